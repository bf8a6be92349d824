//! The terminal's single-byte character set.
//!
//! The wire charset is ISO-8859-15. ISO-8859-1 serves as the fallback for
//! text the primary set cannot represent; `WINDOWS_1252` is the WHATWG
//! superset of ISO-8859-1 and stands in for it here.

use encoding_rs::{ISO_8859_15, WINDOWS_1252};

/// Encodes `text` for the wire.
pub fn encode(text: &str) -> Vec<u8> {
    let (bytes, _, had_errors) = ISO_8859_15.encode(text);
    if !had_errors {
        return bytes.into_owned();
    }
    let (bytes, _, _) = WINDOWS_1252.encode(text);
    bytes.into_owned()
}

/// Decodes wire bytes into text. Single-byte sets map every byte value, so
/// this cannot fail.
pub fn decode(bytes: &[u8]) -> String {
    let (text, had_errors) = ISO_8859_15.decode_without_bom_handling(bytes);
    if !had_errors {
        return text.into_owned();
    }
    WINDOWS_1252
        .decode_without_bom_handling(bytes)
        .0
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_passthrough() {
        assert_eq!(encode("y0000000001234"), b"y0000000001234");
        assert_eq!(decode(b"CARD  ** 1234"), "CARD  ** 1234");
    }

    #[test]
    fn test_euro_sign() {
        // The euro sign is 0xa4 in ISO-8859-15.
        assert_eq!(encode("12,34 \u{20ac}"), b"12,34 \xa4");
        assert_eq!(decode(b"12,34 \xa4"), "12,34 \u{20ac}");
    }

    #[test]
    fn test_roundtrip_high_bytes() {
        let all: Vec<u8> = (0x20..=0xff).collect();
        assert_eq!(encode(&decode(&all)), all);
    }
}
