//! HEX32 identity codec.
//!
//! Every node in the memory graph is addressed by a 13-symbol id over the
//! alphabet `0-9A-V` (32 symbols, 5 bits each). The id encodes a 64-bit
//! FNV-1a hash, most-significant symbol first; because 13 symbols span 65
//! bits, the first symbol only ever carries 4 bits and must fall in `0-9A-F`.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{MemForgeError, MemForgeResult};

/// The 32-symbol encoding alphabet.
const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHIJKLMNOPQRSTUV";

/// Number of symbols in an encoded id.
const ID_LEN: usize = 13;

/// FNV-1a 64-bit offset basis.
const FNV_OFFSET: u64 = 14_695_981_039_346_656_037;

/// FNV-1a 64-bit prime.
const FNV_PRIME: u64 = 1_099_511_628_211;

/// A 13-symbol HEX32 identifier.
///
/// Equality is bit-equality on the underlying 64-bit hash, which the string
/// form encodes canonically (uppercase, fixed length), so string equality is
/// sufficient.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hex32Id(String);

impl Hex32Id {
    /// Generate a fresh random id.
    ///
    /// A random 128-bit UUID is reordered into the canonical mixed-endian
    /// 16-byte layout (groups 1-3 little-endian, groups 4-5 big-endian, for
    /// compatibility with external reference implementations) and hashed
    /// with FNV-1a x64.
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4();
        Self(encode(fnv1a64(&mixed_endian_bytes(&uuid))))
    }

    /// Derive a deterministic id from arbitrary text (UTF-8 bytes).
    pub fn from_content(input: &str) -> Self {
        Self(encode(fnv1a64(input.as_bytes())))
    }

    /// Parse and validate an id string, normalizing to uppercase.
    pub fn parse(s: &str) -> MemForgeResult<Self> {
        let normalized = s.to_ascii_uppercase();
        if !Self::is_valid(&normalized) {
            return Err(MemForgeError::validation(
                "id",
                format!("'{s}' is not a valid HEX32 identifier"),
            ));
        }
        Ok(Self(normalized))
    }

    /// Check whether a string is a valid id.
    ///
    /// Valid ids are exactly 13 symbols, uppercase alphabet `0-9A-V`, and
    /// the first symbol is restricted to `0-9A-F` so the encoded value fits
    /// in 64 bits. The restriction is checked strictly; a crafted `G-V`
    /// first symbol would silently truncate on decode otherwise.
    pub fn is_valid(s: &str) -> bool {
        let bytes = s.as_bytes();
        if bytes.len() != ID_LEN {
            return false;
        }
        match symbol_value(bytes[0]) {
            Some(v) if v <= 0xF => {}
            _ => return false,
        }
        bytes[1..].iter().all(|&b| symbol_value(b).is_some())
    }

    /// The encoded string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode back to the underlying 64-bit hash.
    pub fn decode(&self) -> u64 {
        // Validated on construction, so the fold cannot overflow.
        self.0
            .bytes()
            .fold(0u64, |acc, b| (acc << 5) | u64::from(symbol_value(b).unwrap_or(0)))
    }

    /// The leading `length` symbols, usable as a partition key.
    pub fn partition_key(&self, length: usize) -> &str {
        &self.0[..length.min(ID_LEN)]
    }

    /// Map the hash into `[0, count)` by dividing the u64 space evenly.
    pub fn partition_number(&self, count: u64) -> u64 {
        if count == 0 {
            return 0;
        }
        (self.decode() / (u64::MAX / count)).min(count - 1)
    }
}

impl fmt::Display for Hex32Id {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// FNV-1a x64 over a byte slice.
fn fnv1a64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(FNV_PRIME)
    })
}

/// Reorder UUID bytes into the mixed-endian layout: the three leading
/// groups little-endian, the trailing two big-endian.
fn mixed_endian_bytes(uuid: &Uuid) -> [u8; 16] {
    let b = uuid.as_bytes();
    [
        b[3], b[2], b[1], b[0], // group 1 (4 bytes) reversed
        b[5], b[4], // group 2 (2 bytes) reversed
        b[7], b[6], // group 3 (2 bytes) reversed
        b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15],
    ]
}

/// Encode a 64-bit value as 13 HEX32 symbols, most significant first.
fn encode(value: u64) -> String {
    let mut out = String::with_capacity(ID_LEN);
    for i in 0..ID_LEN {
        let shift = 5 * (ID_LEN - 1 - i);
        let sym = ((value >> shift) & 0x1F) as usize;
        out.push(ALPHABET[sym] as char);
    }
    out
}

/// Map an ASCII symbol to its 5-bit value, if in the alphabet.
fn symbol_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'A'..=b'V' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_shape() {
        for _ in 0..64 {
            let id = Hex32Id::generate();
            assert_eq!(id.as_str().len(), 13);
            assert!(Hex32Id::is_valid(id.as_str()), "generated id {id} invalid");
        }
    }

    #[test]
    fn test_from_content_deterministic() {
        let a = Hex32Id::from_content("My blood type is O positive.");
        let b = Hex32Id::from_content("My blood type is O positive.");
        let c = Hex32Id::from_content("My blood type is A negative.");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_fnv_reference_vectors() {
        // Published FNV-1a x64 test vectors.
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a64(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let id = Hex32Id::from_content("a");
        assert_eq!(id.decode(), 0xaf63_dc4c_8601_ec8c);

        let id = Hex32Id::from_content("");
        assert_eq!(id.decode(), 0xcbf2_9ce4_8422_2325);
    }

    #[test]
    fn test_first_symbol_range() {
        // Top 4 bits of the hash bound the first symbol to 0-F.
        for input in ["a", "b", "c", "hello", "memforge", ""] {
            let id = Hex32Id::from_content(input);
            let first = id.as_str().as_bytes()[0];
            assert!(
                first.is_ascii_digit() || (b'A'..=b'F').contains(&first),
                "first symbol of {id} out of range"
            );
        }
    }

    #[test]
    fn test_validation() {
        assert!(Hex32Id::is_valid("0123456789ABC"));
        assert!(Hex32Id::is_valid("F0000000000UV"));
        // Wrong length.
        assert!(!Hex32Id::is_valid("0123"));
        assert!(!Hex32Id::is_valid("0123456789ABCD"));
        // First symbol above F would overflow 64 bits.
        assert!(!Hex32Id::is_valid("G000000000000"));
        assert!(!Hex32Id::is_valid("V000000000000"));
        // Outside the alphabet.
        assert!(!Hex32Id::is_valid("0123456789ABZ"));
        assert!(!Hex32Id::is_valid("0123456789ab!"));
    }

    #[test]
    fn test_parse_normalizes_case() {
        let id = Hex32Id::parse("af63dc4c8601e").expect("lowercase should parse");
        assert_eq!(id.as_str(), "AF63DC4C8601E");
        assert!(Hex32Id::parse("g000000000000").is_err());
    }

    #[test]
    fn test_partition_key() {
        let id = Hex32Id::from_content("partition me");
        assert_eq!(id.partition_key(4), &id.as_str()[..4]);
        assert_eq!(id.partition_key(64), id.as_str());
    }

    #[test]
    fn test_partition_number_in_range() {
        for count in [1u64, 2, 3, 16, 1024] {
            for input in ["a", "b", "c", "d", "e", "f", "g", "h"] {
                let id = Hex32Id::from_content(input);
                assert!(id.partition_number(count) < count);
            }
        }
    }
}
