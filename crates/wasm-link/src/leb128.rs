//! LEB128 integer encoding and decoding.
//!
//! Compilers emit relocatable index operands with maximum-width padding so a
//! linker can rewrite them in place without changing any section size. The
//! fixed-width writers here produce those padded encodings; the slice decoders
//! report how many bytes an existing operand occupies so a rewrite can reuse
//! exactly that width.

/// Maximum number of bytes in the LEB128 encoding of a 32-bit integer.
pub const MAX_WIDTH: usize = 5;

/// Error produced when a varint cannot be decoded from a byte slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The slice ended before the final byte of the encoding.
    Truncated,
    /// The encoding is longer than 32 bits allow.
    Overflow,
}

/// Appends the unsigned LEB128 encoding of `value` to `sink`.
pub fn write_u32(sink: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            sink.push(byte | 0x80);
        } else {
            sink.push(byte);
            return;
        }
    }
}

/// Appends the signed LEB128 encoding of `value` to `sink`.
pub fn write_i32(sink: &mut Vec<u8>, value: i32) {
    let mut value = value as i64;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            sink.push(byte);
            return;
        }
        sink.push(byte | 0x80);
    }
}

/// Appends `value` as an unsigned LEB128 padded to exactly `width` bytes.
///
/// Returns `false` when `value` cannot be represented in `width` bytes.
pub fn write_u32_fixed(sink: &mut Vec<u8>, mut value: u32, width: usize) -> bool {
    debug_assert!(width >= 1 && width <= MAX_WIDTH);
    if width < MAX_WIDTH && value >> (7 * width as u32) != 0 {
        return false;
    }
    for i in 0..width {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if i + 1 < width {
            byte |= 0x80;
        }
        sink.push(byte);
    }
    true
}

/// Appends `value` as a signed LEB128 padded to exactly `width` bytes.
///
/// Returns `false` when `value` cannot be represented in `width` bytes.
pub fn write_i32_fixed(sink: &mut Vec<u8>, value: i32, width: usize) -> bool {
    debug_assert!(width >= 1 && width <= MAX_WIDTH);
    let mut value = value as i64;
    if width < MAX_WIDTH {
        // Everything above the sign bit of the final byte must be pure sign
        // extension, otherwise the value does not fit.
        let rest = value >> (7 * width as u32 - 1);
        if rest != 0 && rest != -1 {
            return false;
        }
    }
    for i in 0..width {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if i + 1 < width {
            byte |= 0x80;
        }
        sink.push(byte);
    }
    true
}

/// Decodes an unsigned LEB128 from the front of `bytes`, returning the value
/// and the number of bytes consumed.
pub fn read_u32(bytes: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut result = 0u32;
    let mut shift = 0u32;
    for (i, &byte) in bytes.iter().enumerate() {
        if i == MAX_WIDTH {
            return Err(DecodeError::Overflow);
        }
        let low = u32::from(byte & 0x7f);
        if shift == 28 && low >> 4 != 0 {
            return Err(DecodeError::Overflow);
        }
        result |= low << shift;
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
    }
    Err(DecodeError::Truncated)
}

/// Decodes a signed LEB128 from the front of `bytes`, returning the value and
/// the number of bytes consumed.
pub fn read_i32(bytes: &[u8]) -> Result<(i32, usize), DecodeError> {
    let mut result = 0i64;
    let mut shift = 0u32;
    for (i, &byte) in bytes.iter().enumerate() {
        if i == MAX_WIDTH {
            return Err(DecodeError::Overflow);
        }
        result |= i64::from(byte & 0x7f) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            let unused = 64 - shift;
            result = (result << unused) >> unused;
            return i32::try_from(result)
                .map(|value| (value, i + 1))
                .map_err(|_| DecodeError::Overflow);
        }
    }
    Err(DecodeError::Truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_round_trip() {
        for value in [0, 1, 127, 128, 624485, u32::MAX] {
            let mut bytes = Vec::new();
            write_u32(&mut bytes, value);
            assert_eq!(read_u32(&bytes), Ok((value, bytes.len())));
        }
    }

    #[test]
    fn signed_round_trip() {
        for value in [0, 1, -1, 63, -64, 64, -65, 624485, -624485, i32::MIN, i32::MAX] {
            let mut bytes = Vec::new();
            write_i32(&mut bytes, value);
            assert_eq!(read_i32(&bytes), Ok((value, bytes.len())));
        }
    }

    #[test]
    fn padded_encodings_decode_to_the_same_value() {
        for value in [0u32, 1, 127, 128, u32::MAX] {
            let mut bytes = Vec::new();
            assert!(write_u32_fixed(&mut bytes, value, MAX_WIDTH));
            assert_eq!(bytes.len(), MAX_WIDTH);
            assert_eq!(read_u32(&bytes), Ok((value, MAX_WIDTH)));
        }
        for value in [0i32, 1, -1, i32::MIN, i32::MAX] {
            let mut bytes = Vec::new();
            assert!(write_i32_fixed(&mut bytes, value, MAX_WIDTH));
            assert_eq!(bytes.len(), MAX_WIDTH);
            assert_eq!(read_i32(&bytes), Ok((value, MAX_WIDTH)));
        }
    }

    #[test]
    fn fixed_width_rejects_values_that_do_not_fit() {
        let mut bytes = Vec::new();
        assert!(!write_u32_fixed(&mut bytes, 128, 1));
        assert!(write_u32_fixed(&mut bytes, 127, 1));
        assert!(!write_i32_fixed(&mut bytes, 64, 1));
        assert!(write_i32_fixed(&mut bytes, -64, 1));
        assert!(write_i32_fixed(&mut bytes, 64, 2));
    }

    #[test]
    fn truncated_input() {
        assert_eq!(read_u32(&[0x80]), Err(DecodeError::Truncated));
        assert_eq!(read_u32(&[]), Err(DecodeError::Truncated));
        assert_eq!(read_i32(&[0xff, 0xff]), Err(DecodeError::Truncated));
    }

    #[test]
    fn overlong_input() {
        assert_eq!(
            read_u32(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x00]),
            Err(DecodeError::Overflow)
        );
        assert_eq!(read_u32(&[0x80, 0x80, 0x80, 0x80, 0x70]), Err(DecodeError::Overflow));
    }
}
