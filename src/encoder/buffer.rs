//! Scratch buffer for one encode pass.
//!
//! The buffer is reserved once at the worst-case size (instruction count
//! times the per-instruction bound, plus jump-table tail bytes) and lives
//! in the session arena, so a whole compile costs one arena bump. Every
//! ordinary byte written is folded into the running CRC; relocation
//! placeholders go through the dedicated methods which skip the fold,
//! keeping the incremental value equal to a from-scratch checksum with
//! the placeholder ranges excluded.
//!
//! Writing past the reservation is fatal by policy: the reservation is
//! computed to make overflow unreachable, so hitting it means the size
//! bookkeeping is corrupt.

use bumpalo::collections::Vec as BumpVec;
use bumpalo::Bump;

use crate::core::error::fatal_error;
use crate::encoder::checksum::Crc32;

pub struct EncodeBuffer<'arena> {
    bytes: BumpVec<'arena, u8>,
    capacity: usize,
    crc: Crc32,
}

impl<'arena> EncodeBuffer<'arena> {
    pub fn new_in(arena: &'arena Bump, capacity: usize) -> Self {
        Self {
            bytes: BumpVec::with_capacity_in(capacity, arena),
            capacity,
            crc: Crc32::new(),
        }
    }

    #[inline]
    pub fn offset(&self) -> u32 {
        self.bytes.len() as u32
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Running checksum over everything emitted so far except
    /// placeholder bytes.
    pub fn crc_value(&self) -> u32 {
        self.crc.value()
    }

    #[inline]
    fn ensure(&mut self, extra: usize) {
        if self.bytes.len() + extra > self.capacity {
            fatal_error(&format!(
                "scratch buffer overflow: {} + {extra} exceeds reservation of {}",
                self.bytes.len(),
                self.capacity
            ));
        }
    }

    #[inline]
    pub fn emit_u8(&mut self, byte: u8) {
        self.ensure(1);
        self.crc.fold(byte);
        self.bytes.push(byte);
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.ensure(bytes.len());
        self.crc.fold_slice(bytes);
        self.bytes.extend_from_slice(bytes);
    }

    #[inline]
    pub fn emit_u32(&mut self, val: u32) {
        self.emit_bytes(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_i32(&mut self, val: i32) {
        self.emit_bytes(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_u64(&mut self, val: u64) {
        self.emit_bytes(&val.to_le_bytes());
    }

    /// Reserve `len` zero bytes for a deferred fixup and return the
    /// payload's offset. Placeholder bytes are not folded into the CRC;
    /// the relocation table reports them as checksum exclusions instead.
    pub fn emit_placeholder(&mut self, len: usize) -> u32 {
        self.ensure(len);
        let offset = self.offset();
        for _ in 0..len {
            self.bytes.push(0);
        }
        offset
    }
}
