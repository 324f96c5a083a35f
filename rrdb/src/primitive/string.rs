//! Fixed-width string slots and the oversize relocation codec.
//!
//! A string slot holds [`STRING_LENGTH`] UTF-16 code units, big-endian,
//! padded with spaces. Longer strings are moved to the tail of the store:
//!
//! ```text
//!             ┌──── body (len × u16) ────┐┌ len:u16 ┐
//!  ... free ..│ c0 c1 c2 ...        c_n-1 ││  len    │ ... older bodies ... │end
//!                                          ▲
//!                                   relocation offset R
//!
//!  slot: [ c0 c1 ... c_k | d_m ... d1 d0 ]   d_i = U+E000 + digit_i(R, base 6400)
//! ```
//!
//! The slot keeps the leading characters so it still reads as an ordinary
//! fixed-width string; its tail is overwritten with the base-6400 digits of
//! `R`, least significant digit last, drawn from the private-use range
//! U+E000..U+F8FF. Decoding scans backwards over private-use units to
//! rebuild `R`. Everything else in the crate only sees logical strings.

/// Width of a fixed string slot in UTF-16 code units.
pub const STRING_LENGTH: usize = 20;

/// Width of a fixed string slot in bytes.
pub const STRING_BYTES: u64 = 2 * STRING_LENGTH as u64;

/// First private-use code point used as a digit.
const DIGIT_BASE: u16 = 0xE000;

/// Last private-use code point used as a digit.
const DIGIT_LAST: u16 = 0xF8FF;

/// Number of distinct digits.
const RADIX: u64 = (DIGIT_LAST - DIGIT_BASE) as u64 + 1;

/// Longest relocated body, in code units (the length word is a `u16`).
pub const MAX_RELOCATED_UNITS: usize = u16::MAX as usize;

/// Bytes a string of `units` code units needs beyond its slot.
pub fn relocation_size(units: usize) -> u64 {
    if units > STRING_LENGTH {
        2 * units.min(MAX_RELOCATED_UNITS) as u64 + 2
    } else {
        0
    }
}

/// Whether a code unit falls in the digit range.
pub fn is_digit_unit(unit: u16) -> bool {
    (DIGIT_BASE..=DIGIT_LAST).contains(&unit)
}

/// Result of encoding one logical string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    /// Bytes of the fixed slot.
    pub slot: [u8; STRING_BYTES as usize],
    /// Relocated body, if the string did not fit: offset of the first body
    /// byte and the bytes to write there (body followed by the length word).
    pub relocated: Option<(u64, Vec<u8>)>,
}

/// What a slot decodes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// The string fit in the slot.
    Inline(String),
    /// The string lives at the tail; the value is the offset of its length
    /// word.
    Relocated(u64),
}

/// Encodes `value` (trimmed) into a slot.
///
/// `tail` is the current relocation cursor: the offset where the next length
/// word goes. It is lowered past the body when relocation happens.
pub fn encode(value: &str, tail: &mut u64) -> Encoded {
    let units: Vec<u16> = value.trim().encode_utf16().collect();
    let mut slot_units = [b' ' as u16; STRING_LENGTH];

    let relocated = if units.len() > STRING_LENGTH {
        let body_len = units.len().min(MAX_RELOCATED_UNITS);
        let length_offset = *tail;
        let body_offset = length_offset - 2 * body_len as u64;
        *tail = body_offset - 2;

        let mut bytes = Vec::with_capacity(2 * body_len + 2);
        for unit in &units[..body_len] {
            bytes.extend_from_slice(&unit.to_be_bytes());
        }
        #[allow(clippy::cast_possible_truncation)] // body_len <= u16::MAX
        bytes.extend_from_slice(&(body_len as u16).to_be_bytes());

        slot_units.copy_from_slice(&units[..STRING_LENGTH]);
        let mut remainder = length_offset;
        let mut position = STRING_LENGTH;
        while remainder > 0 {
            position -= 1;
            #[allow(clippy::cast_possible_truncation)] // remainder % RADIX < 6400
            let digit = (remainder % RADIX) as u16;
            slot_units[position] = DIGIT_BASE + digit;
            remainder /= RADIX;
        }
        Some((body_offset, bytes))
    } else {
        slot_units[..units.len()].copy_from_slice(&units);
        None
    };

    let mut slot = [0u8; STRING_BYTES as usize];
    for (chunk, unit) in slot.chunks_exact_mut(2).zip(slot_units) {
        chunk.copy_from_slice(&unit.to_be_bytes());
    }
    Encoded { slot, relocated }
}

/// Decodes a slot. Returns `None` if the digit run overflows.
pub fn decode(slot: &[u8; STRING_BYTES as usize]) -> Option<Decoded> {
    let units: Vec<u16> = slot
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();

    let mut offset = 0u64;
    let mut weight = 1u64;
    let mut limit = STRING_LENGTH;
    for &unit in units.iter().rev() {
        if !is_digit_unit(unit) {
            break;
        }
        let digit = u64::from(unit - DIGIT_BASE);
        offset = offset.checked_add(digit.checked_mul(weight)?)?;
        weight = weight.saturating_mul(RADIX);
        limit -= 1;
    }

    if offset > 0 {
        Some(Decoded::Relocated(offset))
    } else {
        let text = String::from_utf16_lossy(&units[..limit]);
        Some(Decoded::Inline(text.trim().to_string()))
    }
}

/// Decodes a relocated body (big-endian UTF-16 bytes).
pub fn decode_body(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units_of(slot: &[u8; STRING_BYTES as usize]) -> Vec<u16> {
        slot.chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn test_short_string_is_padded() {
        let mut tail = 1000;
        let encoded = encode("  cpu  ", &mut tail);
        assert_eq!(tail, 1000);
        assert!(encoded.relocated.is_none());

        let units = units_of(&encoded.slot);
        assert_eq!(&units[..3], &[b'c' as u16, b'p' as u16, b'u' as u16]);
        assert!(units[3..].iter().all(|&u| u == b' ' as u16));
        assert_eq!(decode(&encoded.slot), Some(Decoded::Inline("cpu".to_string())));
    }

    #[test]
    fn test_exactly_full_slot_stays_inline() {
        let name = "abcdefghijklmnopqrst";
        let mut tail = 500;
        let encoded = encode(name, &mut tail);
        assert!(encoded.relocated.is_none());
        assert_eq!(decode(&encoded.slot), Some(Decoded::Inline(name.to_string())));
    }

    #[test]
    fn test_oversize_string_relocates() {
        let name = "interface_eth0_received_bytes_total";
        let len = name.len() as u64;
        let mut tail = 10_000;
        let encoded = encode(name, &mut tail);

        let (body_offset, bytes) = encoded.relocated.clone().unwrap();
        assert_eq!(body_offset, 10_000 - 2 * len);
        assert_eq!(tail, body_offset - 2);
        assert_eq!(bytes.len() as u64, 2 * len + 2);
        assert_eq!(&bytes[bytes.len() - 2..], &(len as u16).to_be_bytes());
        assert_eq!(decode_body(&bytes[..bytes.len() - 2]), name);

        // 10_000 = 1 * 6400 + 3600: two digits at the end of the slot.
        let units = units_of(&encoded.slot);
        assert_eq!(units[18], 0xE000 + 1);
        assert_eq!(units[19], 0xE000 + 3600);
        assert_eq!(units[0], b'i' as u16);
        assert_eq!(decode(&encoded.slot), Some(Decoded::Relocated(10_000)));
    }

    #[test]
    fn test_successive_relocations_stack_downwards() {
        let mut tail = 4_096;
        let first = encode(&"a".repeat(30), &mut tail);
        let second = encode(&"b".repeat(25), &mut tail);

        let (first_body, _) = first.relocated.unwrap();
        let (second_body, second_bytes) = second.relocated.unwrap();
        assert_eq!(first_body, 4_096 - 60);
        assert_eq!(second_body + second_bytes.len() as u64, first_body - 2 + 2);
        assert_eq!(decode(&second.slot), Some(Decoded::Relocated(first_body - 2)));
    }

    #[test]
    fn test_relocation_size() {
        assert_eq!(relocation_size(20), 0);
        assert_eq!(relocation_size(21), 44);
        assert_eq!(relocation_size(100_000), 2 * 65_535 + 2);
    }
}
