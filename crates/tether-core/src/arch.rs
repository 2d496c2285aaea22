//! Architecture abstraction used for code patching.

use smallvec::SmallVec;

use crate::Va;

/// Machine code for a single absolute jump.
pub type JumpBytes = SmallVec<[u8; 16]>;

/// Defines an interface for CPU architecture-specific operations and constants.
///
/// The `Architecture` trait captures what the inline hook manager needs to
/// know about the CPU it runs on: page geometry and how to encode a jump
/// that can reach any address.
pub trait Architecture {
    /// The size of a memory page in bytes for the given architecture.
    ///
    /// # Architecture-specific
    ///
    /// - **AMD64**: `0x1000` (4096 bytes)
    /// - **AArch64**: `0x1000` (4096 bytes, 4K granule)
    const PAGE_SIZE: u64;

    /// The number of bits to shift when converting between page numbers and
    /// addresses.
    const PAGE_SHIFT: u64;

    /// A bitmask used to isolate the page number from a full address.
    const PAGE_MASK: u64;

    /// The size of the instruction window overwritten by a hook.
    ///
    /// This is the length of the worst-case absolute jump.
    ///
    /// # Architecture-specific
    ///
    /// - **AMD64**: `14` (`jmp [rip+0]` followed by the 64-bit target)
    /// - **AArch64**: `16` (`ldr x17, #8; br x17` followed by the 64-bit target)
    const JUMP_SIZE: usize;

    /// Encodes an absolute jump to `target`.
    ///
    /// The result is exactly [`JUMP_SIZE`] bytes long and does not depend on
    /// where it is placed.
    ///
    /// [`JUMP_SIZE`]: Self::JUMP_SIZE
    fn absolute_jump(target: Va) -> JumpBytes;

    /// Makes freshly written code at `address` visible to instruction fetch.
    ///
    /// # Architecture-specific
    ///
    /// - **AMD64**: no-op, caches are coherent.
    /// - **AArch64**: cleans the data cache and invalidates the instruction
    ///   cache for the range.
    fn flush_instruction_cache(address: Va, len: usize);

    /// Returns the base address of the page containing `va`.
    fn page_base(va: Va) -> Va {
        Va(va.0 & Self::PAGE_MASK)
    }

    /// Returns the `[start, end)` page span covering `len` bytes at `va`.
    fn page_span(va: Va, len: usize) -> (Va, Va) {
        let start = Self::page_base(va);
        let end = Self::page_base(va + (len.max(1) as u64 - 1)) + Self::PAGE_SIZE;
        (start, end)
    }
}
