//! Glyph-aware text handling for PostgreSQL client encodings.
//!
//! Several server encodings (BIG5, GBK, SJIS, ...) can embed ASCII-valued bytes
//! inside a multibyte character, so searching raw bytes for a quote or a comma
//! is wrong for them. Everything here walks text one glyph at a time using a
//! scanner chosen by [`EncodingGroup`].

pub mod composite;
pub mod escape;

use std::borrow::Cow;

use crate::error::{Error, Result};

/// Family of server encodings that share one glyph-scanning rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncodingGroup {
    /// Any single-byte encoding (SQL_ASCII, LATIN*, WIN*, KOI8*, ISO_8859_*)
    Monobyte,
    Big5,
    EucCn,
    /// EUC_JP and EUC_JIS_2004
    EucJp,
    EucKr,
    EucTw,
    Gb18030,
    Gbk,
    Johab,
    MuleInternal,
    /// SJIS and SHIFT_JIS_2004
    Sjis,
    Uhc,
    Utf8,
}

const WINDOWS_SUBTYPES: [&str; 11] = [
    "866", "874", "1250", "1251", "1252", "1253", "1254", "1255", "1256", "1257", "1258",
];

/// Look up the encoding group for a server encoding name such as `"UTF8"`.
pub fn enc_group(name: &str) -> Result<EncodingGroup> {
    use EncodingGroup::*;

    let group = match name {
        "BIG5" => Some(Big5),
        "EUC_CN" => Some(EucCn),
        "EUC_JP" | "EUC_JIS_2004" => Some(EucJp),
        "EUC_KR" => Some(EucKr),
        "EUC_TW" => Some(EucTw),
        "GB18030" => Some(Gb18030),
        "GBK" => Some(Gbk),
        "JOHAB" => Some(Johab),
        "KOI8R" | "KOI8U" | "SQL_ASCII" => Some(Monobyte),
        "MULE_INTERNAL" => Some(MuleInternal),
        "SJIS" | "SHIFT_JIS_2004" => Some(Sjis),
        "UHC" => Some(Uhc),
        "UTF8" => Some(Utf8),
        _ => {
            let latin = name.strip_prefix("LATIN").is_some_and(|n| {
                matches!(n.as_bytes(), [b'1'..=b'9'] | b"10")
            });
            let iso = name.len() == 10
                && name.starts_with("ISO_8859_")
                && matches!(name.as_bytes()[9], b'5'..=b'8');
            let win = name
                .strip_prefix("WIN")
                .is_some_and(|n| WINDOWS_SUBTYPES.contains(&n));
            (latin || iso || win).then_some(Monobyte)
        }
    };

    group.ok_or_else(|| Error::Usage(format!("Unrecognized encoding: '{name}'.")))
}

impl EncodingGroup {
    /// Canonical name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            EncodingGroup::Monobyte => "MONOBYTE",
            EncodingGroup::Big5 => "BIG5",
            EncodingGroup::EucCn => "EUC_CN",
            EncodingGroup::EucJp => "EUC_JP",
            EncodingGroup::EucKr => "EUC_KR",
            EncodingGroup::EucTw => "EUC_TW",
            EncodingGroup::Gb18030 => "GB18030",
            EncodingGroup::Gbk => "GBK",
            EncodingGroup::Johab => "JOHAB",
            EncodingGroup::MuleInternal => "MULE_INTERNAL",
            EncodingGroup::Sjis => "SJIS",
            EncodingGroup::Uhc => "UHC",
            EncodingGroup::Utf8 => "UTF8",
        }
    }

    /// Group for a `client_encoding` value, or UTF8 if the name is unknown.
    pub fn for_client_encoding(name: &str) -> Self {
        enc_group(name).unwrap_or(EncodingGroup::Utf8)
    }

    /// Decode server-sent text such as a message or notification payload.
    ///
    /// Single-byte text maps each byte to the code point of equal value.
    /// Other groups take valid UTF-8 as is and replace anything else.
    pub fn decode_lossy(self, bytes: &[u8]) -> Cow<'_, str> {
        if self == EncodingGroup::Monobyte && !bytes.is_ascii() {
            return Cow::Owned(bytes.iter().map(|&b| char::from(b)).collect());
        }
        match simdutf8::basic::from_utf8(bytes) {
            Ok(text) => Cow::Borrowed(text),
            Err(_) => String::from_utf8_lossy(bytes),
        }
    }

    /// True if no byte below 0x80 can occur inside a multibyte glyph,
    /// which lets ASCII searches run over raw bytes.
    pub fn is_ascii_safe(self) -> bool {
        matches!(
            self,
            EncodingGroup::Monobyte
                | EncodingGroup::Utf8
                | EncodingGroup::EucCn
                | EncodingGroup::EucJp
                | EncodingGroup::EucKr
                | EncodingGroup::EucTw
                | EncodingGroup::MuleInternal
        )
    }

    /// Offset one past the end of the glyph that starts at `start`.
    ///
    /// At or beyond the end of `text` this returns `start + 1`, so loops of
    /// the form `while here < text.len()` always terminate.
    pub fn glyph_end(self, text: &[u8], start: usize) -> Result<usize> {
        let Some(&lead) = text.get(start) else {
            return Ok(start + 1);
        };
        if lead < 0x80 {
            return Ok(start + 1);
        }

        let byte = |n: usize| text.get(start + n).copied();
        let within = |n: usize, lo: u8, hi: u8| byte(n).is_some_and(|b| (lo..=hi).contains(&b));

        let len = match self {
            EncodingGroup::Monobyte => Some(1),

            EncodingGroup::Big5 => ((0x81..=0xFE).contains(&lead)
                && (within(1, 0x40, 0x7E) || within(1, 0xA1, 0xFE)))
            .then_some(2),

            EncodingGroup::EucCn => {
                ((0xA1..=0xF7).contains(&lead) && within(1, 0xA1, 0xFE)).then_some(2)
            }

            EncodingGroup::EucJp => match lead {
                0x8E => within(1, 0xA1, 0xFE).then_some(2),
                0x8F => (within(1, 0xA1, 0xFE) && within(2, 0xA1, 0xFE)).then_some(3),
                0xA1..=0xFE => within(1, 0xA1, 0xFE).then_some(2),
                _ => None,
            },

            EncodingGroup::EucKr => {
                ((0xA1..=0xFE).contains(&lead) && within(1, 0xA1, 0xFE)).then_some(2)
            }

            EncodingGroup::EucTw => match lead {
                0x8E => (within(1, 0xA1, 0xB0) && within(2, 0xA1, 0xFE) && within(3, 0xA1, 0xFE))
                    .then_some(4),
                0xA1..=0xFE => within(1, 0xA1, 0xFE).then_some(2),
                _ => None,
            },

            EncodingGroup::Gb18030 => match lead {
                0x81..=0xFE if within(1, 0x30, 0x39) => {
                    (within(2, 0x81, 0xFE) && within(3, 0x30, 0x39)).then_some(4)
                }
                0x81..=0xFE => {
                    (within(1, 0x40, 0xFE) && byte(1) != Some(0x7F)).then_some(2)
                }
                _ => None,
            },

            EncodingGroup::Gbk => match lead {
                0x80 => Some(1),
                0x81..=0xFE => {
                    (within(1, 0x40, 0xFE) && byte(1) != Some(0x7F)).then_some(2)
                }
                _ => None,
            },

            EncodingGroup::Johab => match lead {
                0x84..=0xD3 => (within(1, 0x41, 0x7E) || within(1, 0x81, 0xFE)).then_some(2),
                0xD8..=0xDE | 0xE0..=0xF9 => {
                    (within(1, 0x31, 0x7E) || within(1, 0x91, 0xFE)).then_some(2)
                }
                _ => None,
            },

            EncodingGroup::MuleInternal => match lead {
                0x81..=0x8D => within(1, 0xA0, 0xFF).then_some(2),
                0x9A..=0x9B => (within(1, 0xA0, 0xDF) && within(2, 0xA0, 0xFF)).then_some(3),
                0x90..=0x99 => (within(1, 0xA0, 0xFF) && within(2, 0xA0, 0xFF)).then_some(3),
                0x9C..=0x9D => (within(1, 0xF0, 0xF4)
                    && within(2, 0xA0, 0xFF)
                    && within(3, 0xA0, 0xFF))
                .then_some(4),
                _ => None,
            },

            EncodingGroup::Sjis => match lead {
                0xA1..=0xDF => Some(1),
                0x81..=0x9F | 0xE0..=0xFC => {
                    (within(1, 0x40, 0x7E) || within(1, 0x80, 0xFC)).then_some(2)
                }
                _ => None,
            },

            EncodingGroup::Uhc => match lead {
                0x80..=0xC6 => (within(1, 0x41, 0x5A)
                    || within(1, 0x61, 0x7A)
                    || within(1, 0x80, 0xFE))
                .then_some(2),
                0xC7..=0xFE => within(1, 0xA1, 0xFE).then_some(2),
                _ => None,
            },

            EncodingGroup::Utf8 => {
                let width = match lead {
                    0xC0..=0xDF => 2,
                    0xE0..=0xEF => 3,
                    0xF0..=0xF7 => 4,
                    _ => 0,
                };
                (width > 0 && (1..width).all(|n| within(n, 0x80, 0xBF))).then_some(width)
            }
        };

        match len {
            Some(len) => Ok(start + len),
            None => Err(self.encoding_error(text, start)),
        }
    }

    fn encoding_error(self, text: &[u8], start: usize) -> Error {
        let tail = &text[start..text.len().min(start + 4)];
        let bytes = tail
            .iter()
            .map(|b| format!("0x{b:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        Error::Conversion(format!(
            "Invalid byte sequence for encoding {} at byte {}: {}",
            self.name(),
            start,
            bytes
        ))
    }

    /// Iterate over the glyphs of `text`.
    pub fn glyphs(self, text: &[u8]) -> Glyphs<'_> {
        Glyphs {
            enc: self,
            text,
            pos: 0,
        }
    }
}

/// Iterator over the glyphs of a byte string; yields an error once on a bad sequence.
#[derive(Debug, Clone)]
pub struct Glyphs<'a> {
    enc: EncodingGroup,
    text: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Glyphs<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.text.len() {
            return None;
        }
        match self.enc.glyph_end(self.text, self.pos) {
            Ok(end) => {
                let glyph = &self.text[self.pos..end];
                self.pos = end;
                Some(Ok(glyph))
            }
            Err(e) => {
                self.pos = self.text.len();
                Some(Err(e))
            }
        }
    }
}

/// Call `f` on each glyph in `text`, in order.
pub fn for_glyphs(enc: EncodingGroup, text: &[u8], mut f: impl FnMut(&[u8])) -> Result<()> {
    for glyph in enc.glyphs(text) {
        f(glyph?);
    }
    Ok(())
}

/// Offset of the first glyph at or after `start` that is one of the ASCII
/// bytes in `needles`, or `text.len()` if there is none.
pub fn find_char(enc: EncodingGroup, text: &[u8], start: usize, needles: &[u8]) -> Result<usize> {
    let Some(haystack) = text.get(start..) else {
        return Ok(text.len());
    };

    if enc.is_ascii_safe() {
        let found = match needles {
            [a] => memchr::memchr(*a, haystack),
            [a, b] => memchr::memchr2(*a, *b, haystack),
            [a, b, c] => memchr::memchr3(*a, *b, *c, haystack),
            _ => haystack.iter().position(|b| needles.contains(b)),
        };
        return Ok(found.map_or(text.len(), |i| start + i));
    }

    let mut here = start;
    while here < text.len() {
        let next = enc.glyph_end(text, here)?;
        if next - here == 1 && needles.contains(&text[here]) {
            return Ok(here);
        }
        here = next;
    }
    Ok(text.len())
}
