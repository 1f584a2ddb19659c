//! Text representation of composite-type values: `(field,"quoted field",)`.

use std::borrow::Cow;

use crate::encoding::EncodingGroup;
use crate::error::{Error, Result};

const EMPTY_COMPOSITE: &[u8] = b"()\0";

/// A value that can sit in one field of a composite value.
pub trait CompositeField {
    /// Store SQL NULL.
    fn set_null(&mut self) -> Result<()> {
        Err(Error::Conversion(
            "Can't read composite field: type does not support nulls.".into(),
        ))
    }

    /// Store the unquoted, unescaped text of a field.
    fn set_text(&mut self, text: &str) -> Result<()>;

    /// Text form of the value, `None` for NULL.
    fn to_text(&self) -> Option<Cow<'_, str>>;

    /// Upper bound on the text form's length, plus one for a terminator.
    fn size_buffer(&self) -> usize;

    /// True if the text form never needs quoting or escaping.
    fn unquoted_safe(&self) -> bool {
        false
    }
}

impl CompositeField for String {
    fn set_text(&mut self, text: &str) -> Result<()> {
        self.clear();
        self.push_str(text);
        Ok(())
    }

    fn to_text(&self) -> Option<Cow<'_, str>> {
        Some(Cow::Borrowed(self))
    }

    fn size_buffer(&self) -> usize {
        self.len() + 1
    }
}

macro_rules! integer_field {
    ($($ty:ty => $width:expr),* $(,)?) => {$(
        impl CompositeField for $ty {
            fn set_text(&mut self, text: &str) -> Result<()> {
                *self = text.parse().map_err(|e| {
                    Error::Conversion(format!(
                        "Could not convert '{text}' to {}: {e}",
                        stringify!($ty)
                    ))
                })?;
                Ok(())
            }

            fn to_text(&self) -> Option<Cow<'_, str>> {
                Some(Cow::Owned(self.to_string()))
            }

            fn size_buffer(&self) -> usize {
                $width
            }

            fn unquoted_safe(&self) -> bool {
                true
            }
        }
    )*};
}

// Sign, digits and terminator.
integer_field!(i16 => 7, i32 => 12, i64 => 21);

impl CompositeField for bool {
    fn set_text(&mut self, text: &str) -> Result<()> {
        *self = match text {
            "t" | "true" => true,
            "f" | "false" => false,
            _ => {
                return Err(Error::Conversion(format!(
                    "Could not convert '{text}' to bool"
                )));
            }
        };
        Ok(())
    }

    fn to_text(&self) -> Option<Cow<'_, str>> {
        Some(Cow::Borrowed(if *self { "t" } else { "f" }))
    }

    fn size_buffer(&self) -> usize {
        2
    }

    fn unquoted_safe(&self) -> bool {
        true
    }
}

impl<T: CompositeField + Default> CompositeField for Option<T> {
    fn set_null(&mut self) -> Result<()> {
        *self = None;
        Ok(())
    }

    fn set_text(&mut self, text: &str) -> Result<()> {
        self.get_or_insert_with(T::default).set_text(text)
    }

    fn to_text(&self) -> Option<Cow<'_, str>> {
        self.as_ref().and_then(T::to_text)
    }

    fn size_buffer(&self) -> usize {
        self.as_ref().map_or(1, T::size_buffer)
    }

    fn unquoted_safe(&self) -> bool {
        self.as_ref().is_none_or(T::unquoted_safe)
    }
}

fn field_text(enc: EncodingGroup, bytes: &[u8]) -> Result<&str> {
    simdutf8::compat::from_utf8(bytes).map_err(|e| {
        Error::Conversion(format!(
            "Composite field is not valid UTF-8 ({}): {e}",
            enc.name()
        ))
    })
}

/// Parse a double-quoted field starting at `pos`; returns the unescaped
/// bytes and the offset just past the closing quote.
fn parse_quoted(enc: EncodingGroup, input: &[u8], pos: usize) -> Result<(Vec<u8>, usize)> {
    let mut out = Vec::new();
    let mut here = pos + 1;
    while here < input.len() {
        let next = enc.glyph_end(input, here)?;
        let glyph = &input[here..next];
        match glyph {
            b"\\" => {
                if next >= input.len() {
                    return Err(Error::Conversion(
                        "Unexpected end of string: backslash.".into(),
                    ));
                }
                let after = enc.glyph_end(input, next)?;
                out.extend_from_slice(&input[next..after]);
                here = after;
            }
            b"\"" => {
                if input.get(next) == Some(&b'"') {
                    out.push(b'"');
                    here = next + 1;
                } else {
                    return Ok((out, next));
                }
            }
            _ => {
                out.extend_from_slice(glyph);
                here = next;
            }
        }
    }
    Err(Error::Conversion(format!(
        "Missing closing double-quote: {}",
        String::from_utf8_lossy(input)
    )))
}

/// Parse the text form of a composite value into `fields`, in order.
///
/// The number of fields in `text` must match `fields.len()` exactly, and
/// nothing may follow the closing parenthesis.
pub fn parse_composite(
    enc: EncodingGroup,
    text: &str,
    fields: &mut [&mut dyn CompositeField],
) -> Result<()> {
    let input = text.as_bytes();
    if input.is_empty() {
        return Err(Error::Conversion(
            "Cannot parse composite value from empty string.".into(),
        ));
    }
    if fields.is_empty() {
        return Err(Error::Usage(
            "Parsing a composite value needs at least one field.".into(),
        ));
    }
    if enc.glyph_end(input, 0)? != 1 || input[0] != b'(' {
        return Err(Error::Conversion(format!(
            "Invalid composite value string: {text}"
        )));
    }

    let last = fields.len() - 1;
    let mut pos = 1;
    for (index, field) in fields.iter_mut().enumerate() {
        let Some(&first) = input.get(pos) else {
            return Err(Error::Conversion(format!(
                "Composite value ended unexpectedly: {text}"
            )));
        };
        let single = enc.glyph_end(input, pos)? == pos + 1;

        match (single, first) {
            (true, b',' | b')') => field.set_null()?,
            (true, b'"') => {
                let (bytes, stop) = parse_quoted(enc, input, pos)?;
                field.set_text(field_text(enc, &bytes)?)?;
                pos = stop;
            }
            _ => {
                let stop = super::find_char(enc, input, pos, b",)")?;
                field.set_text(field_text(enc, &input[pos..stop])?)?;
                pos = stop;
            }
        }

        let Some(&separator) = input.get(pos) else {
            return Err(Error::Conversion(format!(
                "Composite value ended unexpectedly: {text}"
            )));
        };
        let next = enc.glyph_end(input, pos)?;
        if next != pos + 1 {
            return Err(Error::Conversion(format!(
                "Unexpected non-ASCII character after composite field: {text}"
            )));
        }

        if index < last {
            if separator != b',' {
                return Err(Error::Conversion(format!(
                    "Found '{}' in composite value where comma was expected: {text}",
                    separator as char
                )));
            }
        } else if separator == b',' {
            return Err(Error::Conversion(format!(
                "Composite value contained more fields than the expected {}: {text}",
                last + 1
            )));
        } else if separator != b')' {
            return Err(Error::Conversion(format!(
                "Composite value has unexpected characters where closing parenthesis was expected: {text}"
            )));
        } else if next != input.len() {
            return Err(Error::Conversion(format!(
                "Composite value has unexpected text after closing parenthesis: {text}"
            )));
        }
        pos = next;
    }
    Ok(())
}

/// Conservative estimate of the buffer needed by [`composite_into_buf`].
///
/// Each field gets room for quotes, worst-case backslash escaping of every
/// byte, and a separating comma; plus the parentheses and a terminator.
pub fn composite_size_buffer(fields: &[&dyn CompositeField]) -> usize {
    if fields.is_empty() {
        return EMPTY_COMPOSITE.len();
    }
    1 + 3 * fields.len()
        + fields
            .iter()
            .map(|f| (2 * f.size_buffer()).saturating_sub(2))
            .sum::<usize>()
        + 1
}

struct BufWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl BufWriter<'_> {
    fn put(&mut self, byte: u8) -> Result<()> {
        let slot = self.buf.get_mut(self.pos).ok_or_else(|| {
            Error::Conversion("Composite value did not fit its size estimate.".into())
        })?;
        *slot = byte;
        self.pos += 1;
        Ok(())
    }
}

/// Render `fields` as a NUL-terminated composite value into `buf`.
///
/// Returns the number of bytes written, terminator included.
pub fn composite_into_buf(buf: &mut [u8], fields: &[&dyn CompositeField]) -> Result<usize> {
    if buf.len() < composite_size_buffer(fields) {
        return Err(Error::Conversion(
            "Buffer space may not be enough to represent composite value.".into(),
        ));
    }

    let mut out = BufWriter { buf, pos: 0 };
    out.put(b'(')?;
    for field in fields {
        if let Some(text) = field.to_text() {
            if field.unquoted_safe() {
                for &b in text.as_bytes() {
                    out.put(b)?;
                }
            } else {
                out.put(b'"')?;
                for &b in text.as_bytes() {
                    if b == b'"' || b == b'\\' {
                        out.put(b'\\')?;
                    }
                    out.put(b)?;
                }
                out.put(b'"')?;
            }
        }
        out.put(b',')?;
    }
    if !fields.is_empty() {
        // Drop the comma after the last field.
        out.pos -= 1;
    }
    out.put(b')')?;
    out.put(0)?;
    Ok(out.pos)
}

/// Render `fields` as a composite value string.
pub fn render_composite(fields: &[&dyn CompositeField]) -> Result<String> {
    let mut buf = vec![0; composite_size_buffer(fields)];
    let written = composite_into_buf(&mut buf, fields)?;
    buf.truncate(written - 1);
    String::from_utf8(buf).map_err(|e| Error::Conversion(format!("Composite value is not UTF-8: {e}")))
}
