//! AArch64 architecture definitions.

use smallvec::SmallVec;
use tether_core::{Architecture, JumpBytes, Va};

/// `ldr x17, #8`
const LDR_X17_LITERAL: u32 = 0x5800_0051;

/// `br x17`
const BR_X17: u32 = 0xd61f_0220;

/// AArch64 architecture (4K granule).
#[derive(Debug)]
pub struct Aarch64;

impl Architecture for Aarch64 {
    const PAGE_SIZE: u64 = 0x1000;
    const PAGE_SHIFT: u64 = 12;
    const PAGE_MASK: u64 = 0xFFFFFFFFFFFFF000;

    const JUMP_SIZE: usize = 2 * size_of::<u32>() + size_of::<u64>();

    fn absolute_jump(target: Va) -> JumpBytes {
        // x17 (IP1) is an intra-procedure-call scratch register, free to
        // clobber at a function entry.
        let mut result = SmallVec::new();
        result.extend_from_slice(&LDR_X17_LITERAL.to_le_bytes());
        result.extend_from_slice(&BR_X17.to_le_bytes());
        result.extend_from_slice(&target.0.to_le_bytes());
        result
    }

    fn flush_instruction_cache(address: Va, len: usize) {
        #[cfg(target_arch = "aarch64")]
        {
            unsafe extern "C" {
                fn __clear_cache(begin: *mut core::ffi::c_char, end: *mut core::ffi::c_char);
            }

            let begin = address.0 as *mut core::ffi::c_char;

            // SAFETY: `__clear_cache` only performs cache maintenance on the
            // range and never dereferences it as data.
            unsafe { __clear_cache(begin, begin.wrapping_add(len)) };
        }

        #[cfg(not(target_arch = "aarch64"))]
        {
            let _ = (address, len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_encoding() {
        let jump = Aarch64::absolute_jump(Va(0x0000_ffff_8000_1000));

        assert_eq!(jump.len(), Aarch64::JUMP_SIZE);
        assert_eq!(&jump[0..4], &[0x51, 0x00, 0x00, 0x58]);
        assert_eq!(&jump[4..8], &[0x20, 0x02, 0x1f, 0xd6]);
        assert_eq!(
            u64::from_le_bytes(jump[8..16].try_into().unwrap()),
            0x0000_ffff_8000_1000
        );
    }

    #[test]
    fn literal_offset_points_past_branch() {
        // imm19 is encoded in bits [23:5] in units of words.
        let imm19 = (LDR_X17_LITERAL >> 5) & 0x7ffff;
        assert_eq!(imm19 * 4, 8);
        assert_eq!(LDR_X17_LITERAL & 0x1f, 17);
        assert_eq!((BR_X17 >> 5) & 0x1f, 17);
    }
}
