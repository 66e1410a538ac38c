//! Bounds-checked big-endian cursor over untrusted bytes.
//!
//! Every read either returns the value or a [`ParseError::Truncated`] naming
//! the field and the offset where it was attempted, so decoders can use `?`
//! and keep the exact field order of the wire tables.

use bytes::Buf;

use crate::error::ParseError;

/// Cursor over a byte slice.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    rest: &'a [u8],
    len: usize,
    base: usize,
}

impl<'a> Reader<'a> {
    /// Create a reader whose offsets start at zero.
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_base(data, 0)
    }

    /// Create a reader whose reported offsets start at `base`.
    pub fn with_base(data: &'a [u8], base: usize) -> Self {
        Self {
            rest: data,
            len: data.len(),
            base,
        }
    }

    /// Absolute offset of the next unread byte.
    pub fn position(&self) -> usize {
        self.base + (self.len - self.rest.len())
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.rest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    fn ensure(&self, field: &'static str, needed: usize) -> Result<(), ParseError> {
        if self.rest.len() < needed {
            return Err(ParseError::Truncated {
                field,
                position: self.position(),
                needed,
                remaining: self.rest.len(),
            });
        }
        Ok(())
    }

    pub fn u8(&mut self, field: &'static str) -> Result<u8, ParseError> {
        self.ensure(field, 1)?;
        Ok(self.rest.get_u8())
    }

    pub fn u16(&mut self, field: &'static str) -> Result<u16, ParseError> {
        self.ensure(field, 2)?;
        Ok(self.rest.get_u16())
    }

    pub fn u32(&mut self, field: &'static str) -> Result<u32, ParseError> {
        self.ensure(field, 4)?;
        Ok(self.rest.get_u32())
    }

    pub fn u64(&mut self, field: &'static str) -> Result<u64, ParseError> {
        self.ensure(field, 8)?;
        Ok(self.rest.get_u64())
    }

    /// Borrow the next `n` bytes.
    pub fn bytes(&mut self, field: &'static str, n: usize) -> Result<&'a [u8], ParseError> {
        self.ensure(field, n)?;
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    pub fn skip(&mut self, field: &'static str, n: usize) -> Result<(), ParseError> {
        self.bytes(field, n).map(|_| ())
    }

    /// Split off a sub-reader over the next `n` bytes.
    ///
    /// A declared length larger than what is left is reported as
    /// [`ParseError::LengthOverflow`] rather than a plain truncation, since
    /// it comes from a length field and not from the data itself.
    pub fn sub(&mut self, field: &'static str, n: usize) -> Result<Reader<'a>, ParseError> {
        if n > self.rest.len() {
            return Err(ParseError::LengthOverflow {
                field,
                position: self.position(),
                declared: n,
                available: self.rest.len(),
            });
        }
        let base = self.position();
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(Reader::with_base(head, base))
    }

    /// Look at what is left without consuming it.
    pub fn peek(&self) -> &'a [u8] {
        self.rest
    }

    /// Consume everything that is left.
    pub fn rest(&mut self) -> &'a [u8] {
        let all = self.rest;
        self.rest = &[];
        all
    }

    /// Read a `u32` and fail unless it equals `expected`.
    pub fn expect_u32(&mut self, field: &'static str, expected: u32) -> Result<(), ParseError> {
        let position = self.position();
        let value = self.u32(field)?;
        if value != expected {
            return Err(ParseError::UnexpectedValue {
                field,
                position,
                value,
            });
        }
        Ok(())
    }

    /// Read a `u8` and fail unless it equals `expected`.
    pub fn expect_u8(&mut self, field: &'static str, expected: u8) -> Result<(), ParseError> {
        let position = self.position();
        let value = self.u8(field)?;
        if value != expected {
            return Err(ParseError::UnexpectedValue {
                field,
                position,
                value: value as u32,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_big_endian() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x9A];
        let mut r = Reader::new(&data);
        assert_eq!(r.u16("a").unwrap(), 0x1234);
        assert_eq!(r.position(), 2);
        assert_eq!(r.u8("b").unwrap(), 0x56);
        assert_eq!(r.remaining(), 2);
    }

    #[test]
    fn test_truncated_reports_position() {
        let data = [0x00, 0x01, 0x02];
        let mut r = Reader::with_base(&data, 100);
        r.u8("first").unwrap();
        let err = r.u32("length").unwrap_err();
        assert_eq!(
            err,
            ParseError::Truncated {
                field: "length",
                position: 101,
                needed: 4,
                remaining: 2,
            }
        );
    }

    #[test]
    fn test_sub_reader_keeps_offsets() {
        let data = [0xAA, 0x01, 0x02, 0x03, 0xBB];
        let mut r = Reader::new(&data);
        r.u8("lead").unwrap();
        let mut sub = r.sub("body", 3).unwrap();
        assert_eq!(sub.position(), 1);
        sub.u16("x").unwrap();
        let err = sub.u16("y").unwrap_err();
        assert_eq!(err.position(), Some(3));
        assert_eq!(r.u8("trail").unwrap(), 0xBB);
    }

    #[test]
    fn test_sub_overflow_is_length_error() {
        let data = [0u8; 4];
        let mut r = Reader::new(&data);
        assert!(matches!(
            r.sub("body", 10),
            Err(ParseError::LengthOverflow { declared: 10, available: 4, .. })
        ));
    }
}
