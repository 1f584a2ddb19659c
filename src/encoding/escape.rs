//! Escaping and quoting of identifiers, literals, LIKE patterns and bytea.
//!
//! Every transform that fills a caller buffer has a matching `size_*` function;
//! callers allocate exactly that many bytes and the transform never writes past it.

use crate::encoding::EncodingGroup;
use crate::error::{Error, Result};

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Bytes needed to hex-escape `binary_bytes` bytes, including the `\x`
/// prefix and a trailing NUL.
pub const fn size_esc_bin(binary_bytes: usize) -> usize {
    2 + 2 * binary_bytes + 1
}

/// Bytes produced by unescaping a hex-escaped text of `escaped_bytes` bytes
/// (prefix included, no terminator).
pub const fn size_unesc_bin(escaped_bytes: usize) -> usize {
    escaped_bytes.saturating_sub(2) / 2
}

/// Hex-escape `data` into `buf`, NUL-terminated.
///
/// Returns the number of bytes written, which is always `size_esc_bin(data.len())`.
pub fn esc_bin_into(data: &[u8], buf: &mut [u8]) -> Result<usize> {
    let needed = size_esc_bin(data.len());
    let Some(out) = buf.get_mut(..needed) else {
        return Err(Error::Conversion(format!(
            "Not enough buffer space to escape binary data: need {needed}, have {}.",
            buf.len()
        )));
    };

    out[0] = b'\\';
    out[1] = b'x';
    for (pair, byte) in out[2..needed - 1].chunks_exact_mut(2).zip(data) {
        pair[0] = HEX_DIGITS[(byte >> 4) as usize];
        pair[1] = HEX_DIGITS[(byte & 0x0F) as usize];
    }
    out[needed - 1] = 0;
    Ok(needed)
}

/// Hex-escape `data` as a `\x...` string.
pub fn esc_bin(data: &[u8]) -> String {
    let mut text = String::with_capacity(size_esc_bin(data.len()) - 1);
    text.push_str("\\x");
    for byte in data {
        text.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        text.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
    }
    text
}

fn nibble(digit: u8) -> Result<u8> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        _ => Err(Error::Conversion(format!(
            "Invalid hex-escaped data: unexpected byte 0x{digit:02x}."
        ))),
    }
}

/// Unescape hex-escaped binary `text` into `buf`.
///
/// Returns the number of bytes written, `size_unesc_bin(text.len())`.
pub fn unesc_bin_into(text: &[u8], buf: &mut [u8]) -> Result<usize> {
    let Some(digits) = text.strip_prefix(b"\\x") else {
        return Err(Error::Conversion(
            "Escaped binary data did not start with '\\x'.".into(),
        ));
    };
    if digits.len() % 2 != 0 {
        return Err(Error::Conversion(
            "Invalid hex-escaped data: odd number of hex digits.".into(),
        ));
    }
    let needed = size_unesc_bin(text.len());
    let Some(out) = buf.get_mut(..needed) else {
        return Err(Error::Conversion(format!(
            "Not enough buffer space to unescape binary data: need {needed}, have {}.",
            buf.len()
        )));
    };
    for (slot, pair) in out.iter_mut().zip(digits.chunks_exact(2)) {
        *slot = (nibble(pair[0])? << 4) | nibble(pair[1])?;
    }
    Ok(needed)
}

/// Unescape hex-escaped binary `text`.
pub fn unesc_bin(text: &[u8]) -> Result<Vec<u8>> {
    let mut buf = vec![0; size_unesc_bin(text.len())];
    unesc_bin_into(text, &mut buf)?;
    Ok(buf)
}

/// Cursor over a caller buffer that was checked against a `size_*` bound.
struct Out<'b> {
    buf: &'b mut [u8],
    len: usize,
}

impl<'b> Out<'b> {
    fn new(buf: &'b mut [u8], needed: usize, what: &str) -> Result<Self> {
        if buf.len() < needed {
            return Err(Error::Conversion(format!(
                "Not enough buffer space to {what}: need {needed}, have {}.",
                buf.len()
            )));
        }
        Ok(Self { buf, len: 0 })
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.len + bytes.len();
        let Some(slot) = self.buf.get_mut(self.len..end) else {
            return Err(Error::Internal(format!(
                "escape output overran its computed size ({end} > {})",
                self.buf.len()
            )));
        };
        slot.copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }

    /// NUL-terminate; returns the bytes written, terminator included.
    fn terminate(mut self) -> Result<usize> {
        self.put(&[0])?;
        Ok(self.len)
    }
}

/// Copy `text` glyph by glyph, doubling every single-byte `quote` glyph.
fn double_quote_char(enc: EncodingGroup, text: &str, quote: u8, out: &mut Out<'_>) -> Result<()> {
    for glyph in enc.glyphs(text.as_bytes()) {
        let glyph = glyph?;
        if glyph == [quote].as_slice() {
            out.put(&[quote])?;
        }
        out.put(glyph)?;
    }
    Ok(())
}

/// Run a `*_into` transform on a buffer of `size` bytes and keep the text.
fn collect(size: usize, fill: impl FnOnce(&mut [u8]) -> Result<usize>) -> Result<String> {
    let mut buf = vec![0; size];
    let written = fill(&mut buf)?;
    buf.truncate(written.saturating_sub(1));
    String::from_utf8(buf).map_err(|e| Error::Conversion(format!("Escaped text is not UTF-8: {e}")))
}

/// Upper bound on the bytes [`esc_into`] writes for a `text_bytes`-byte
/// string, including the trailing NUL.
pub const fn size_esc(text_bytes: usize) -> usize {
    2 * text_bytes + 1
}

/// Escape `text` for use inside a single-quoted SQL literal, writing it
/// NUL-terminated into `buf`.
///
/// Returns the number of bytes written, at most `size_esc(text.len())`.
pub fn esc_into(enc: EncodingGroup, text: &str, buf: &mut [u8]) -> Result<usize> {
    let mut out = Out::new(buf, size_esc(text.len()), "escape string")?;
    double_quote_char(enc, text, b'\'', &mut out)?;
    out.terminate()
}

/// Escape a string for use inside a single-quoted SQL literal.
pub fn esc(enc: EncodingGroup, text: &str) -> Result<String> {
    collect(size_esc(text.len()), |buf| esc_into(enc, text, buf))
}

/// Upper bound on the bytes [`quote_into`] writes, including the trailing NUL.
pub const fn size_quote(text_bytes: usize) -> usize {
    2 * text_bytes + 3
}

/// Escape and single-quote `text` into `buf`, NUL-terminated.
pub fn quote_into(enc: EncodingGroup, text: &str, buf: &mut [u8]) -> Result<usize> {
    let mut out = Out::new(buf, size_quote(text.len()), "quote string")?;
    out.put(b"'")?;
    double_quote_char(enc, text, b'\'', &mut out)?;
    out.put(b"'")?;
    out.terminate()
}

/// Escape and single-quote a string as an SQL literal.
pub fn quote(enc: EncodingGroup, text: &str) -> Result<String> {
    collect(size_quote(text.len()), |buf| quote_into(enc, text, buf))
}

/// Exact bytes [`quote_raw_into`] writes, including the trailing NUL.
pub const fn size_quote_raw(binary_bytes: usize) -> usize {
    size_esc_bin(binary_bytes) + "''::bytea".len()
}

/// Quote binary data as a `bytea` literal into `buf`, NUL-terminated.
pub fn quote_raw_into(data: &[u8], buf: &mut [u8]) -> Result<usize> {
    let mut out = Out::new(buf, size_quote_raw(data.len()), "quote binary data")?;
    out.put(b"'")?;
    let hex = esc_bin_into(data, &mut out.buf[1..])?;
    // Drop the NUL esc_bin_into wrote.
    out.len += hex - 1;
    out.put(b"'::bytea")?;
    out.terminate()
}

/// Quote binary data as a `bytea` literal.
pub fn quote_raw(data: &[u8]) -> String {
    format!("'{}'::bytea", esc_bin(data))
}

/// Upper bound on the bytes [`quote_name_into`] writes, including the
/// trailing NUL.
pub const fn size_quote_name(identifier_bytes: usize) -> usize {
    2 * identifier_bytes + 3
}

fn quote_name_part(enc: EncodingGroup, identifier: &str, out: &mut Out<'_>) -> Result<()> {
    out.put(b"\"")?;
    double_quote_char(enc, identifier, b'"', out)?;
    out.put(b"\"")
}

/// Double-quote `identifier` into `buf`, NUL-terminated.
pub fn quote_name_into(enc: EncodingGroup, identifier: &str, buf: &mut [u8]) -> Result<usize> {
    let mut out = Out::new(buf, size_quote_name(identifier.len()), "quote identifier")?;
    quote_name_part(enc, identifier, &mut out)?;
    out.terminate()
}

/// Double-quote an identifier so it can be embedded in SQL as-is.
pub fn quote_name(enc: EncodingGroup, identifier: &str) -> Result<String> {
    collect(size_quote_name(identifier.len()), |buf| {
        quote_name_into(enc, identifier, buf)
    })
}

/// Upper bound on the bytes [`quote_table_into`] writes for `path`,
/// including the trailing NUL.
pub fn size_quote_table<S: AsRef<str>>(path: &[S]) -> usize {
    let parts: usize = path
        .iter()
        .map(|part| size_quote_name(part.as_ref().len()) - 1)
        .sum();
    parts + path.len().saturating_sub(1) + 1
}

/// Quote a table path into `buf`, one identifier per element, NUL-terminated.
pub fn quote_table_into<S: AsRef<str>>(
    enc: EncodingGroup,
    path: &[S],
    buf: &mut [u8],
) -> Result<usize> {
    let mut out = Out::new(buf, size_quote_table(path), "quote table path")?;
    for (i, part) in path.iter().enumerate() {
        if i > 0 {
            out.put(b".")?;
        }
        quote_name_part(enc, part.as_ref(), &mut out)?;
    }
    out.terminate()
}

/// Quote a possibly schema-qualified table path, one identifier per element.
pub fn quote_table<S: AsRef<str>>(enc: EncodingGroup, path: &[S]) -> Result<String> {
    collect(size_quote_table(path), |buf| quote_table_into(enc, path, buf))
}

/// Upper bound on the bytes [`esc_like_into`] writes, including the
/// trailing NUL.
pub const fn size_esc_like(text_bytes: usize, escape_char: char) -> usize {
    text_bytes * (1 + escape_char.len_utf8()) + 1
}

/// Escape the `_` and `%` wildcards of a LIKE pattern into `buf`,
/// NUL-terminated.
///
/// Only standalone glyphs count: a multibyte character whose trailing byte
/// happens to equal `_` or `%` is left alone.
pub fn esc_like_into(
    enc: EncodingGroup,
    text: &str,
    escape_char: char,
    buf: &mut [u8],
) -> Result<usize> {
    let mut escape = [0u8; 4];
    let escape = escape_char.encode_utf8(&mut escape).as_bytes();
    let needed = size_esc_like(text.len(), escape_char);
    let mut out = Out::new(buf, needed, "escape LIKE pattern")?;
    for glyph in enc.glyphs(text.as_bytes()) {
        let glyph = glyph?;
        if matches!(glyph, b"_" | b"%") {
            out.put(escape)?;
        }
        out.put(glyph)?;
    }
    out.terminate()
}

/// Escape the `_` and `%` wildcards of a LIKE pattern with `escape_char`.
pub fn esc_like(enc: EncodingGroup, text: &str, escape_char: char) -> Result<String> {
    collect(size_esc_like(text.len(), escape_char), |buf| {
        esc_like_into(enc, text, escape_char, buf)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_esc_bin_sizes() {
        assert_eq!(size_esc_bin(0), 3);
        assert_eq!(size_esc_bin(4), 11);
        assert_eq!(size_unesc_bin(2), 0);
        assert_eq!(size_unesc_bin(10), 4);
    }

    #[test]
    fn test_esc_bin_fills_exactly() {
        let data = [0x00, 0xAB, 0xFF];
        let mut buf = [0xEE; 16];
        let written = esc_bin_into(&data, &mut buf).unwrap();
        assert_eq!(written, size_esc_bin(data.len()));
        assert_eq!(&buf[..written], b"\\x00abff\0");
        assert!(buf[written..].iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn test_esc_bin_buffer_too_small() {
        let mut buf = [0; 4];
        assert!(matches!(esc_bin_into(b"ab", &mut buf), Err(Error::Conversion(_))));
    }

    #[test]
    fn test_binary_round_trip() {
        let samples: [Vec<u8>; 4] = [
            Vec::new(),
            vec![0x00; 17],
            vec![0xFF; 9],
            (0..=255).collect(),
        ];
        for data in samples {
            let text = esc_bin(&data);
            assert_eq!(text.len() + 1, size_esc_bin(data.len()));
            assert_eq!(unesc_bin(text.as_bytes()).unwrap(), data);
        }
    }

    #[test]
    fn test_unesc_bin_rejects_garbage() {
        assert!(unesc_bin(b"00ff").is_err());
        assert!(unesc_bin(b"\\x0").is_err());
        assert!(unesc_bin(b"\\xzz").is_err());
        assert_eq!(unesc_bin(b"\\xDEADbeef").unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_quote_name() {
        let enc = EncodingGroup::Utf8;
        assert_eq!(quote_name(enc, "users").unwrap(), "\"users\"");
        assert_eq!(quote_name(enc, "we\"ird").unwrap(), "\"we\"\"ird\"");
        assert_eq!(
            quote_table(enc, &["public", "my table"]).unwrap(),
            "\"public\".\"my table\""
        );
    }

    #[test]
    fn test_literals() {
        let enc = EncodingGroup::Monobyte;
        assert_eq!(esc(enc, "it's").unwrap(), "it''s");
        assert_eq!(quote(enc, "").unwrap(), "''");
        assert_eq!(quote_raw(&[1, 2]), "'\\x0102'::bytea");
    }

    #[test]
    fn test_esc_like() {
        let enc = EncodingGroup::Utf8;
        assert_eq!(esc_like(enc, "100%_done", '\\').unwrap(), "100\\%\\_done");
        assert_eq!(esc_like(enc, "plain", '#').unwrap(), "plain");
        assert_eq!(esc_like(enc, "a_b", '#').unwrap(), "a#_b");
    }

    #[test]
    fn test_worst_case_fills_size_exactly() {
        let enc = EncodingGroup::Utf8;
        let mut buf = vec![0xEE; 64];

        let n = esc_into(enc, "''''", &mut buf).unwrap();
        assert_eq!(n, size_esc(4));
        assert_eq!(&buf[..n], b"''''''''\0");

        let n = quote_into(enc, "''", &mut buf).unwrap();
        assert_eq!(n, size_quote(2));
        assert_eq!(&buf[..n], b"''''''\0");

        let n = quote_name_into(enc, "\"\"\"", &mut buf).unwrap();
        assert_eq!(n, size_quote_name(3));
        assert_eq!(&buf[..n], b"\"\"\"\"\"\"\"\"\0");

        let n = esc_like_into(enc, "%_", '\\', &mut buf).unwrap();
        assert_eq!(n, size_esc_like(2, '\\'));
        assert_eq!(&buf[..n], b"\\%\\_\0");

        let path = ["\"", "\""];
        let n = quote_table_into(enc, &path, &mut buf).unwrap();
        assert_eq!(n, size_quote_table(&path));
        assert_eq!(&buf[..n], b"\"\"\"\".\"\"\"\"\0");

        let n = quote_raw_into(&[0xAB], &mut buf).unwrap();
        assert_eq!(n, size_quote_raw(1));
        assert_eq!(&buf[..n], b"'\\xab'::bytea\0");
    }

    #[test]
    fn test_into_leaves_rest_of_buffer_alone() {
        let enc = EncodingGroup::Utf8;
        let mut buf = vec![0xEE; size_esc_like(6, '\u{e9}')];
        let n = esc_like_into(enc, "a_b%cd", '\u{e9}', &mut buf).unwrap();
        assert_eq!(&buf[..n], "a\u{e9}_b\u{e9}%cd\0".as_bytes());
        assert!(buf[n..].iter().all(|&b| b == 0xEE));
        assert_eq!(esc_like(enc, "a_b%cd", '\u{e9}').unwrap(), "a\u{e9}_b\u{e9}%cd");
    }

    #[test]
    fn test_into_rejects_short_buffer() {
        let enc = EncodingGroup::Utf8;
        let mut buf = vec![0; size_quote_name(3) - 1];
        assert!(matches!(
            quote_name_into(enc, "abc", &mut buf),
            Err(Error::Conversion(_))
        ));
        assert!(matches!(esc_into(enc, "abc", &mut buf[..2]), Err(Error::Conversion(_))));
        assert!(matches!(
            quote_table_into(enc, &["a", "b"], &mut buf[..6]),
            Err(Error::Conversion(_))
        ));
    }
}
