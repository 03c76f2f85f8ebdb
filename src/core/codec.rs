//! Bit-field register codec
//!
//! Pure functions packing and unpacking sub-word values into 16/32/64-bit
//! registers, plus big-endian combination and splitting of wide values across
//! consecutive 16-bit Modbus registers. The first transmitted register always
//! holds the most significant 16 bits.

use thiserror::Error;

/// Errors produced by the bit-field codec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The bit field does not fit inside the register width
    #[error("bit field [{offset}, {offset}+{length}) exceeds register width {width}")]
    FieldOutOfRange { offset: u32, length: u32, width: u32 },

    /// The value does not fit inside the bit field
    #[error("value {value:#x} does not fit in a {length}-bit field")]
    ValueOverflow { value: u64, length: u32 },
}

/// Result type for codec operations
pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Mask covering the low `length` bits, with `length == 64` handled exactly.
fn field_mask(length: u32) -> u64 {
    if length >= 64 {
        u64::MAX
    } else {
        (1u64 << length) - 1
    }
}

/// Extract a sub-field from a register value.
///
/// `width` is the register width in bits (16, 32 or 64). Fails when
/// `offset + length` exceeds the width.
pub fn extract(register: u64, width: u32, offset: u32, length: u32) -> CodecResult<u64> {
    if offset + length > width {
        return Err(CodecError::FieldOutOfRange { offset, length, width });
    }
    Ok((register >> offset) & field_mask(length))
}

/// Write a sub-field into a register value, preserving all bits outside
/// `[offset, offset + length)`.
///
/// Fails when the field exceeds the register width or when `value` does not
/// fit in `length` bits.
pub fn inject(register: u64, width: u32, offset: u32, length: u32, value: u64) -> CodecResult<u64> {
    if offset + length > width {
        return Err(CodecError::FieldOutOfRange { offset, length, width });
    }
    if value > field_mask(length) {
        return Err(CodecError::ValueOverflow { value, length });
    }
    let mask = field_mask(length) << offset;
    Ok((register & !mask) | (value << offset))
}

/// Combine consecutive 16-bit registers into one wide value, big-endian
/// register order: `words[0]` holds the most significant 16 bits.
pub fn combine_words(words: &[u16]) -> u64 {
    words
        .iter()
        .fold(0u64, |acc, &w| (acc << 16) | u64::from(w))
}

/// Split a wide value into `count` 16-bit registers in big-endian register
/// order. The inverse of [`combine_words`].
pub fn split_words(value: u64, count: usize) -> Vec<u16> {
    (0..count)
        .map(|i| (value >> (16 * (count - 1 - i))) as u16)
        .collect()
}
