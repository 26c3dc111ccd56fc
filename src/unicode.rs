//! UTF-8 <-> UTF-32 conversion with the lexer's surrogate-escape rule.
//!
//! Grounded in `unicode.c`'s `utf8_to_utf32_ex`/`utf32_to_utf8`: a byte that
//! cannot begin or continue a valid UTF-8 sequence is mapped to the code
//! point `0xDC80 + byte` when `surrogate_replace` is requested, rather than
//! aborting the conversion. This lets the lexer carry verbatim byte strings
//! through a code-point pipeline without losing information on malformed
//! input.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnicodeError {
    #[error("invalid UTF-8 byte 0x{0:02x} at offset {1}")]
    InvalidByte(u8, usize),
}

const SURROGATE_BASE: u32 = 0xDC80;

/// Decode `bytes` into code points. When `surrogate_replace` is true,
/// malformed bytes are mapped to `0xDC80 + byte` instead of failing.
pub fn utf8_to_utf32(bytes: &[u8], surrogate_replace: bool) -> Result<Vec<u32>, UnicodeError> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0usize;
    while i < bytes.len() {
        match decode_one(bytes, i) {
            Some((cp, len)) => {
                out.push(cp);
                i += len;
            }
            None => {
                if surrogate_replace {
                    out.push(SURROGATE_BASE + bytes[i] as u32);
                    i += 1;
                } else {
                    return Err(UnicodeError::InvalidByte(bytes[i], i));
                }
            }
        }
    }
    Ok(out)
}

/// Encode code points back to UTF-8. Surrogate-escape code points
/// (`0xDC80..=0xDCFF`) are written back out as their original raw byte,
/// making `utf8_to_utf32(surrogate_replace=true)` followed by this function
/// a lossless round trip even for ill-formed input.
pub fn utf32_to_utf8(codepoints: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(codepoints.len());
    for &cp in codepoints {
        if (SURROGATE_BASE..=0xDCFF).contains(&cp) {
            out.push((cp - SURROGATE_BASE) as u8);
            continue;
        }
        encode_one(cp, &mut out);
    }
    out
}

fn decode_one(bytes: &[u8], i: usize) -> Option<(u32, usize)> {
    let b0 = bytes[i];
    if b0 < 0x80 {
        return Some((b0 as u32, 1));
    }
    let (len, mut cp) = if b0 & 0xE0 == 0xC0 {
        (2, (b0 & 0x1F) as u32)
    } else if b0 & 0xF0 == 0xE0 {
        (3, (b0 & 0x0F) as u32)
    } else if b0 & 0xF8 == 0xF0 {
        (4, (b0 & 0x07) as u32)
    } else {
        return None;
    };
    if i + len > bytes.len() {
        return None;
    }
    for k in 1..len {
        let b = bytes[i + k];
        if b & 0xC0 != 0x80 {
            return None;
        }
        cp = (cp << 6) | (b & 0x3F) as u32;
    }
    if len == 2 && cp < 0x80 {
        return None;
    }
    if len == 3 && cp < 0x800 {
        return None;
    }
    if len == 4 && cp < 0x10000 {
        return None;
    }
    if (0xD800..=0xDFFF).contains(&cp) || cp > 0x10FFFF {
        return None;
    }
    Some((cp, len))
}

fn encode_one(cp: u32, out: &mut Vec<u8>) {
    if cp < 0x80 {
        out.push(cp as u8);
    } else if cp < 0x800 {
        out.push(0xC0 | (cp >> 6) as u8);
        out.push(0x80 | (cp & 0x3F) as u8);
    } else if cp < 0x10000 {
        out.push(0xE0 | (cp >> 12) as u8);
        out.push(0x80 | ((cp >> 6) & 0x3F) as u8);
        out.push(0x80 | (cp & 0x3F) as u8);
    } else {
        out.push(0xF0 | (cp >> 18) as u8);
        out.push(0x80 | ((cp >> 12) & 0x3F) as u8);
        out.push(0x80 | ((cp >> 6) & 0x3F) as u8);
        out.push(0x80 | (cp & 0x3F) as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_well_formed_text() {
        let text = "hello \u{00f6}\u{4e16}\u{1f600}".as_bytes().to_vec();
        let cps = utf8_to_utf32(&text, false).unwrap();
        assert_eq!(utf32_to_utf8(&cps), text);
    }

    #[test]
    fn ill_formed_bytes_without_surrogate_replace_fail() {
        let bad = [0xc3, 0xc3];
        assert!(utf8_to_utf32(&bad, false).is_err());
    }

    #[test]
    fn ill_formed_bytes_with_surrogate_replace_map_to_dc80_plus_byte() {
        let bad = [0xc3, 0xc3];
        let cps = utf8_to_utf32(&bad, true).unwrap();
        assert_eq!(cps, vec![0xDC80 + 0xc3, 0xDC80 + 0xc3]);
        assert_eq!(utf32_to_utf8(&cps), bad);
    }

    #[test]
    fn single_invalid_byte_among_valid_ones() {
        let mut bytes = b"ok-".to_vec();
        bytes.push(0xff);
        let cps = utf8_to_utf32(&bytes, true).unwrap();
        assert_eq!(*cps.last().unwrap(), 0xDC80 + 0xff);
    }
}
