//! CRC-32 over emitted code, used as an internal corruption detector.
//!
//! The pipeline validates the checksum at three points: after initial
//! emission, after branch shortening, and over the final relocated buffer.
//! Both sides of every comparison go through the single pure
//! [`checksum`] function over a byte slice plus exclusion ranges, so a
//! disagreement can only mean the bytes themselves differ, never that two
//! implementations drifted apart. The incremental [`Crc32`] folder exists
//! so emission does not need a second pass over the scratch buffer.

use std::ops::Range;

const fn make_table() -> [u32; 256] {
    // Reflected IEEE 802.3 polynomial.
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = make_table();

/// Incremental CRC-32 folder. Fed one byte at a time during emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc32 {
    state: u32,
}

impl Crc32 {
    pub fn new() -> Self {
        Self { state: 0xFFFF_FFFF }
    }

    #[inline]
    pub fn fold(&mut self, byte: u8) {
        self.state = (self.state >> 8) ^ CRC_TABLE[((self.state ^ byte as u32) & 0xFF) as usize];
    }

    pub fn fold_slice(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.fold(b);
        }
    }

    pub fn value(&self) -> u32 {
        self.state ^ 0xFFFF_FFFF
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute the checksum of `bytes`, skipping every byte covered by
/// `exclusions`. Ranges must be sorted by start and non-overlapping;
/// both are debug-asserted since the relocation table produces them in
/// offset order.
pub fn checksum(bytes: &[u8], exclusions: &[Range<u32>]) -> u32 {
    debug_assert!(
        exclusions.windows(2).all(|w| w[0].end <= w[1].start),
        "exclusion ranges must be sorted and disjoint"
    );

    let mut crc = Crc32::new();
    let mut pos = 0usize;
    for range in exclusions {
        let start = (range.start as usize).min(bytes.len());
        let end = (range.end as usize).min(bytes.len());
        if start > pos {
            crc.fold_slice(&bytes[pos..start]);
        }
        pos = pos.max(end);
    }
    if pos < bytes.len() {
        crc.fold_slice(&bytes[pos..]);
    }
    crc.value()
}

/// Merge two sorted exclusion lists into one sorted, disjoint list.
pub fn merge_exclusions(a: &[Range<u32>], b: &[Range<u32>]) -> Vec<Range<u32>> {
    let mut all: Vec<Range<u32>> = a.iter().chain(b.iter()).cloned().collect();
    all.sort_by_key(|r| r.start);
    let mut merged: Vec<Range<u32>> = Vec::with_capacity(all.len());
    for r in all {
        match merged.last_mut() {
            Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
            _ => merged.push(r),
        }
    }
    merged
}
