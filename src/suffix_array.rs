#![allow(non_snake_case)]
/*-
 * Copyright 2003-2005 Colin Percival
 * Copyright 2012 Matthew Endsley
 * Modified 2017 Pieter-Jan Briers
 * Modified 2025 - Performance optimizations
 * All rights reserved
 *
 * Redistribution and use in source and binary forms, with or without
 * modification, are permitted providing that the following conditions
 * are met:
 * 1. Redistributions of source code must retain the above copyright
 *    notice, this list of conditions and the following disclaimer.
 * 2. Redistributions in binary form must reproduce the above copyright
 *    notice, this list of conditions and the following disclaimer in the
 *    documentation and/or other materials provided with the distribution.
 *
 * THIS SOFTWARE IS PROVIDED BY THE AUTHOR ``AS IS'' AND ANY EXPRESS OR
 * IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE IMPLIED
 * WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE
 * ARE DISCLAIMED.  IN NO EVENT SHALL THE AUTHOR BE LIABLE FOR ANY
 * DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
 * DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS
 * OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION)
 * HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT,
 * STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING
 * IN ANY WAY OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE
 * POSSIBILITY OF SUCH DAMAGE.
 */

use std::cmp::Ordering;
use std::time::Instant;

use log::debug;

const BUCKET_SIZE: usize = 256;
const MIN_SPLIT_LENGTH: usize = 16;

#[inline(always)]
fn usz(i: isize) -> usize {
    debug_assert!(i >= 0);
    i as usize
}

/// Pending work for the split worklist.
///
/// `Settle` runs once the left partition of a ternary split is fully sorted:
/// it renumbers the equal group and queues the right partition, which keeps
/// the visiting order of the recursive formulation.
enum Work {
    Split { start: usize, len: usize },
    Settle { jj: usize, kk: usize, end: usize },
}

/// Sorted index of every suffix of one buffer, including the empty suffix.
///
/// Built once per diff over the old buffer and never mutated afterwards.
pub struct SuffixArray {
    I: Vec<isize>,
}

impl SuffixArray {
    /// Builds the suffix array of `old` (qsufsort, prefix doubling).
    pub fn new(old: &[u8]) -> Self {
        let started = Instant::now();
        let mut I = vec![0; old.len() + 1];
        let mut V = vec![0; old.len() + 1];
        qsufsort(&mut I, &mut V, old);
        debug!(
            "suffix array over {} bytes built in {:?}",
            old.len(),
            started.elapsed()
        );
        Self { I }
    }

    /// Number of entries, `old.len() + 1`.
    pub fn len(&self) -> usize {
        self.I.len()
    }

    pub fn is_empty(&self) -> bool {
        self.I.is_empty()
    }

    /// Suffix start offsets in lexicographic order.
    pub fn as_slice(&self) -> &[isize] {
        &self.I
    }

    /// Longest match of `new` against any suffix of `old`, as `(length, position)`.
    pub fn search(&self, old: &[u8], new: &[u8]) -> (usize, usize) {
        self.search_range(old, new, 0, self.I.len() - 1)
    }

    /// Binary search restricted to ranks `start..=end`.
    pub fn search_range(&self, old: &[u8], new: &[u8], mut start: usize, mut end: usize) -> (usize, usize) {
        while end - start >= 2 {
            let mid = start + (end - start) / 2;
            let left = &old[usz(self.I[mid])..];
            let len_to_check = left.len().min(new.len());
            if left[..len_to_check] < new[..len_to_check] {
                start = mid;
            } else {
                end = mid;
            }
        }
        let x = matchlen(&old[usz(self.I[start])..], new);
        let y = matchlen(&old[usz(self.I[end])..], new);
        if x > y {
            (x, usz(self.I[start]))
        } else {
            (y, usz(self.I[end]))
        }
    }
}

/// Count matching bytes between two slices
#[inline]
pub(crate) fn matchlen(old: &[u8], new: &[u8]) -> usize {
    old.iter().zip(new).take_while(|(a, b)| a == b).count()
}

fn split_small(I: &mut [isize], V: &mut [isize], start: usize, len: usize, h: usize) {
    let mut k = start;
    while k < start + len {
        let mut j = 1;
        let mut x = V[usz(I[k] + h as isize)];
        let mut i = 1;
        while k + i < start + len {
            let v = V[usz(I[k + i] + h as isize)];
            if v < x {
                x = v;
                j = 0;
            }
            if v == x {
                I.swap(k + j, k + i);
                j += 1;
            }
            i += 1;
        }
        let kj = (k + j) as isize;
        for &Ii in &I[k..k + j] {
            V[usz(Ii)] = kj - 1;
        }
        if j == 1 {
            I[k] = -1;
        }
        k += j;
    }
}

/// Three-way partitions `I[start..start + len]` around the median key and
/// returns the bounds `(jj, kk)` of the equal group.
fn partition(I: &mut [isize], V: &[isize], start: usize, len: usize, h: usize) -> (usize, usize) {
    let x = V[usz(I[start + len / 2] + h as isize)];

    let mut jj = 0;
    let mut kk = 0;
    for &Ii in &I[start..start + len] {
        let v = V[usz(Ii + h as isize)];
        if v < x {
            jj += 1;
        }
        if v == x {
            kk += 1;
        }
    }
    let jj = jj + start;
    let kk = kk + jj;

    let mut j = 0;
    let mut k = 0;
    let mut i = start;
    while i < jj {
        match V[usz(I[i] + h as isize)].cmp(&x) {
            Ordering::Less => i += 1,
            Ordering::Equal => {
                I.swap(i, jj + j);
                j += 1;
            }
            Ordering::Greater => {
                I.swap(i, kk + k);
                k += 1;
            }
        }
    }

    while jj + j < kk {
        if V[usz(I[jj + j] + h as isize)] == x {
            j += 1;
        } else {
            I.swap(jj + j, kk + k);
            k += 1;
        }
    }
    (jj, kk)
}

fn split(I: &mut [isize], V: &mut [isize], start: usize, len: usize, h: usize) {
    let mut work = vec![Work::Split { start, len }];
    while let Some(item) = work.pop() {
        match item {
            Work::Split { start, len } if len < MIN_SPLIT_LENGTH => {
                split_small(I, V, start, len, h);
            }
            Work::Split { start, len } => {
                let (jj, kk) = partition(I, V, start, len, h);
                work.push(Work::Settle {
                    jj,
                    kk,
                    end: start + len,
                });
                if jj > start {
                    work.push(Work::Split {
                        start,
                        len: jj - start,
                    });
                }
            }
            Work::Settle { jj, kk, end } => {
                let kk_minus_1 = (kk - 1) as isize;
                for &Ii in &I[jj..kk] {
                    V[usz(Ii)] = kk_minus_1;
                }
                if jj == kk - 1 {
                    I[jj] = -1;
                }
                if end > kk {
                    work.push(Work::Split {
                        start: kk,
                        len: end - kk,
                    });
                }
            }
        }
    }
}

/// Suffix array construction using bucket sort + refinement
fn qsufsort(I: &mut [isize], V: &mut [isize], old: &[u8]) {
    let mut buckets: [isize; BUCKET_SIZE] = [0; BUCKET_SIZE];

    for &o in old {
        buckets[o as usize] += 1;
    }
    for i in 1..BUCKET_SIZE {
        buckets[i] += buckets[i - 1];
    }
    for i in (1..BUCKET_SIZE).rev() {
        buckets[i] = buckets[i - 1];
    }
    buckets[0] = 0;

    for (i, &old_byte) in old.iter().enumerate() {
        buckets[old_byte as usize] += 1;
        I[usz(buckets[old_byte as usize])] = i as isize;
    }
    I[0] = old.len() as isize;

    for (i, &old_byte) in old.iter().enumerate() {
        V[i] = buckets[old_byte as usize];
    }
    V[old.len()] = 0;

    // Singleton buckets are already in their final place
    for i in 1..BUCKET_SIZE {
        if buckets[i] == buckets[i - 1] + 1 {
            I[usz(buckets[i])] = -1;
        }
    }
    I[0] = -1;

    let mut h = 1;
    while I[0] != -(old.len() as isize + 1) {
        let mut len = 0;
        let mut i = 0;
        while i < old.len() as isize + 1 {
            if I[usz(i)] < 0 {
                len -= I[usz(i)];
                i -= I[usz(i)];
            } else {
                if len != 0 {
                    I[usz(i - len)] = -len;
                }
                len = V[usz(I[usz(i)])] + 1 - i;
                split(I, V, usz(i), usz(len), h);
                i += len;
                len = 0;
            }
        }
        if len != 0 {
            I[usz(i - len)] = -len;
        }
        h += h;
    }

    for (i, &v) in V[0..=old.len()].iter().enumerate() {
        I[usz(v)] = i as isize;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(old: &[u8]) -> Vec<isize> {
        let mut idx: Vec<usize> = (0..=old.len()).collect();
        idx.sort_by(|&a, &b| old[a..].cmp(&old[b..]));
        idx.into_iter().map(|i| i as isize).collect()
    }

    #[test]
    fn empty_buffer_has_single_suffix() {
        let sa = SuffixArray::new(b"");
        assert_eq!(sa.as_slice(), &[0]);
        assert_eq!(sa.search(b"", b"anything"), (0, 0));
    }

    #[test]
    fn matches_naive_sort() {
        let inputs: Vec<Vec<u8>> = vec![
            b"banana".to_vec(),
            b"mississippi".to_vec(),
            vec![0u8; 100],
            (0..=255u8).cycle().take(1000).collect(),
            (0..2000u32).map(|i| ((i * 7919) % 13) as u8).collect(),
        ];
        for old in inputs {
            assert_eq!(SuffixArray::new(&old).as_slice(), naive(&old).as_slice());
        }
    }

    #[test]
    fn long_runs_do_not_recurse() {
        // Degenerate input that drives the deepest partitioning.
        let old: Vec<u8> = (0..200_000u32).map(|i| (i % 2) as u8).collect();
        let sa = SuffixArray::new(&old);
        assert_eq!(sa.len(), old.len() + 1);
        assert_eq!(sa.as_slice()[0], old.len() as isize);
    }

    #[test]
    fn search_finds_longest_match() {
        let old = b"the quick brown fox jumps over the lazy dog";
        let sa = SuffixArray::new(old);
        let (len, pos) = sa.search(old, b"brown fox sleeps");
        assert_eq!(len, 10);
        assert_eq!(&old[pos..pos + len], b"brown fox ");

        let (len, _) = sa.search(old, b"zzz");
        assert_eq!(len, 1);
    }

    #[test]
    fn search_range_compares_both_ends() {
        let old = b"abcabd";
        let sa = SuffixArray::new(old);
        // ranks 1 and 2 are "abcabd" / "abd"
        let (len, pos) = sa.search_range(old, b"abd", 1, 2);
        assert_eq!((len, pos), (3, 3));
    }
}
