use std::fmt::Write as _;

use tether_core::{MemoryDriver, ProcessMemory, TetherError, Va};

/// Representation of memory for hexdump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Representation {
    /// Display memory as 8-bit values.
    U8,

    /// Display memory as 32-bit values.
    U32,

    /// Display memory as 64-bit values.
    U64,
}

impl Representation {
    fn width(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U32 => 4,
            Self::U64 => 8,
        }
    }
}

/// Formats a hexdump of `count` bytes of process memory at `address`.
pub fn hexdump<Driver>(
    memory: &ProcessMemory<Driver>,
    address: Va,
    count: usize,
    representation: Representation,
) -> Result<String, TetherError>
where
    Driver: MemoryDriver,
{
    let buffer = memory.read_vec(address, count)?;
    Ok(format_lines(address, &buffer, representation))
}

fn format_lines(address: Va, buffer: &[u8], representation: Representation) -> String {
    let width = representation.width();
    let cell = 2 * width + 1;

    let mut result = String::new();

    for (index, chunk) in buffer.chunks(16).enumerate() {
        let _ = write!(result, "0x{:016X} |", address + (index * 16) as u64);

        for value in chunk.chunks(width) {
            let mut bytes = [0u8; 8];
            bytes[..value.len()].copy_from_slice(value);
            let value = u64::from_le_bytes(bytes);

            let _ = write!(result, " {value:0width$X}", width = 2 * width);
        }

        // Pad the last line so the ASCII column stays aligned.
        let missing = (16 - chunk.len()).div_ceil(width);
        result.extend(std::iter::repeat_n(' ', missing * cell));

        result.push_str(" | ");
        result.extend(chunk.iter().map(|&byte| {
            if byte.is_ascii_graphic() {
                byte as char
            }
            else {
                '.'
            }
        }));
        result.push('\n');
    }

    result
}
