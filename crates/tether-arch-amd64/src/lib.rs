//! AMD64 architecture definitions.

use smallvec::SmallVec;
use tether_core::{Architecture, JumpBytes, Va};

/// `jmp qword ptr [rip+0]`
const JMP_RIP_INDIRECT: [u8; 6] = [0xff, 0x25, 0x00, 0x00, 0x00, 0x00];

/// AMD64 architecture.
#[derive(Debug)]
pub struct Amd64;

impl Architecture for Amd64 {
    const PAGE_SIZE: u64 = 0x1000;
    const PAGE_SHIFT: u64 = 12;
    const PAGE_MASK: u64 = 0xFFFFFFFFFFFFF000;

    const JUMP_SIZE: usize = JMP_RIP_INDIRECT.len() + size_of::<u64>();

    fn absolute_jump(target: Va) -> JumpBytes {
        // The indirect jump reads its destination from the quadword that
        // immediately follows the instruction.
        let mut result = SmallVec::new();
        result.extend_from_slice(&JMP_RIP_INDIRECT);
        result.extend_from_slice(&target.0.to_le_bytes());
        result
    }

    fn flush_instruction_cache(_address: Va, _len: usize) {
        // Instruction and data caches are coherent on x86.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_encoding() {
        let jump = Amd64::absolute_jump(Va(0x1122_3344_5566_7788));

        assert_eq!(jump.len(), Amd64::JUMP_SIZE);
        assert_eq!(
            jump.as_slice(),
            &[
                0xff, 0x25, 0x00, 0x00, 0x00, 0x00, //
                0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11,
            ]
        );
    }

    #[test]
    fn page_helpers() {
        assert_eq!(Amd64::page_base(Va(0x7fff_1234)), Va(0x7fff_1000));
        assert_eq!(
            Amd64::page_span(Va(0x1ff8), Amd64::JUMP_SIZE),
            (Va(0x1000), Va(0x3000))
        );
        assert_eq!(Amd64::page_span(Va(0x1000), 0), (Va(0x1000), Va(0x2000)));
    }
}
