//! x86-64 general-purpose register identifiers.
//!
//! The lowered IR arrives with registers already selected, so all this
//! module needs is a compact id type plus the two views every encoder
//! byte-slicer wants: the low three ModRM/SIB bits and the REX extension
//! bit for r8..r15.

/// One general-purpose 64-bit register, identified by its hardware number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(pub u8);

pub const RAX: Reg = Reg(0);
pub const RCX: Reg = Reg(1);
pub const RDX: Reg = Reg(2);
pub const RBX: Reg = Reg(3);
pub const RSP: Reg = Reg(4);
pub const RBP: Reg = Reg(5);
pub const RSI: Reg = Reg(6);
pub const RDI: Reg = Reg(7);
pub const R8: Reg = Reg(8);
pub const R9: Reg = Reg(9);
pub const R10: Reg = Reg(10);
pub const R11: Reg = Reg(11);
pub const R12: Reg = Reg(12);
pub const R13: Reg = Reg(13);
pub const R14: Reg = Reg(14);
pub const R15: Reg = Reg(15);

impl Reg {
    /// The three bits that go into a ModRM or SIB field.
    #[inline]
    pub fn low3(self) -> u8 {
        self.0 & 0x7
    }

    /// The REX extension bit (set for r8..r15).
    #[inline]
    pub fn rex_bit(self) -> u8 {
        (self.0 >> 3) & 1
    }

    /// Whether this is a valid hardware register number.
    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 < 16
    }

    pub fn name(self) -> &'static str {
        const NAMES: [&str; 16] = [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ];
        NAMES.get(self.0 as usize).copied().unwrap_or("r?")
    }
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modrm_bits_and_rex() {
        assert_eq!(RAX.low3(), 0);
        assert_eq!(RAX.rex_bit(), 0);
        assert_eq!(R8.low3(), 0);
        assert_eq!(R8.rex_bit(), 1);
        assert_eq!(R13.low3(), 5);
        assert_eq!(R13.rex_bit(), 1);
        assert_eq!(RBP.low3(), 5);
        assert_eq!(RBP.rex_bit(), 0);
    }

    #[test]
    fn names() {
        assert_eq!(RSP.name(), "rsp");
        assert_eq!(R15.to_string(), "r15");
    }
}
