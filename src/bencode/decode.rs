use std::collections::BTreeMap;

use bytes::Bytes;

use super::{BencodeError, Value};

// Inbound datagrams are untrusted, bound the recursion.
const MAX_DEPTH: usize = 64;

/// Decodes a single value, the whole input must be consumed.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut decoder = Decoder { data, pos: 0 };
    let value = decoder.value(0)?;

    if decoder.pos != data.len() {
        return Err(BencodeError::TrailingData);
    }

    Ok(value)
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep);
        }

        match self.peek()? {
            b'i' => self.integer().map(Value::Integer),
            b'0'..=b'9' => self.bytes().map(Value::Bytes),
            b'l' => {
                self.pos += 1;
                let mut list = Vec::new();
                while self.peek()? != b'e' {
                    list.push(self.value(depth + 1)?);
                }
                self.pos += 1;

                Ok(Value::List(list))
            }
            b'd' => {
                self.pos += 1;
                let mut dict = BTreeMap::new();
                while self.peek()? != b'e' {
                    if !self.peek()?.is_ascii_digit() {
                        return Err(BencodeError::NonStringKey);
                    }
                    let key = self.bytes()?;
                    let value = self.value(depth + 1)?;
                    dict.insert(key, value);
                }
                self.pos += 1;

                Ok(Value::Dict(dict))
            }
            byte => Err(BencodeError::UnexpectedByte(byte, self.pos)),
        }
    }

    // Returns the slice up to (excluding) the terminator and moves past it.
    fn until(&mut self, terminator: u8) -> Result<&'a [u8], BencodeError> {
        let rest: &'a [u8] = &self.data[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == terminator)
            .ok_or(BencodeError::UnexpectedEof)?;
        self.pos += len + 1;

        Ok(&rest[..len])
    }

    fn integer(&mut self) -> Result<i64, BencodeError> {
        self.pos += 1;
        let raw = self.until(b'e')?;
        let text = std::str::from_utf8(raw)
            .map_err(|_| BencodeError::InvalidInteger(String::from_utf8_lossy(raw).into()))?;

        let digits = text.strip_prefix('-').unwrap_or(text);
        if digits.is_empty()
            || (digits.starts_with('0') && digits.len() > 1)
            || text == "-0"
            || !digits.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(BencodeError::InvalidInteger(text.into()));
        }

        text.parse()
            .map_err(|_| BencodeError::InvalidInteger(text.into()))
    }

    fn bytes(&mut self) -> Result<Bytes, BencodeError> {
        let raw = self.until(b':')?;
        let len: usize = std::str::from_utf8(raw)
            .ok()
            .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidLength)?;

        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(BencodeError::UnexpectedEof)?;
        let bytes = Bytes::copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;

        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::encode;

    #[test]
    fn scalars() {
        assert_eq!(decode(b"i42e"), Ok(Value::Integer(42)));
        assert_eq!(decode(b"i-7e"), Ok(Value::Integer(-7)));
        assert_eq!(decode(b"4:spam"), Ok(Value::string("spam")));
        assert_eq!(decode(b"0:"), Ok(Value::string("")));
    }

    #[test]
    fn nested() {
        let value = decode(b"d1:ad2:id3:abce1:t2:xy1:y1:qe").unwrap();

        assert_eq!(value.get(b"y").and_then(Value::as_str), Some("q"));
        assert_eq!(
            value
                .get(b"a")
                .and_then(|a| a.get(b"id"))
                .and_then(Value::as_str),
            Some("abc")
        );
        assert_eq!(encode(&value), b"d1:ad2:id3:abce1:t2:xy1:y1:qe");
    }

    #[test]
    fn rejects_invalid_integers() {
        for input in [&b"i03e"[..], b"i-0e", b"ie", b"i1x2e", b"i--1e"] {
            assert!(
                matches!(decode(input), Err(BencodeError::InvalidInteger(_))),
                "{input:?}"
            );
        }
    }

    #[test]
    fn rejects_truncated_input() {
        assert_eq!(decode(b"5:spam"), Err(BencodeError::UnexpectedEof));
        assert_eq!(decode(b"li1e"), Err(BencodeError::UnexpectedEof));
        assert_eq!(decode(b"i42"), Err(BencodeError::UnexpectedEof));
        assert_eq!(decode(b""), Err(BencodeError::UnexpectedEof));
    }

    #[test]
    fn rejects_malformed_structure() {
        assert_eq!(decode(b"i1ei2e"), Err(BencodeError::TrailingData));
        assert_eq!(decode(b"di1ei2ee"), Err(BencodeError::NonStringKey));
        assert_eq!(decode(b"x"), Err(BencodeError::UnexpectedByte(b'x', 0)));
        assert_eq!(decode(b"1a:xy"), Err(BencodeError::InvalidLength));
    }

    #[test]
    fn nesting_limit() {
        let mut deep = vec![b'l'; MAX_DEPTH + 2];
        deep.extend(vec![b'e'; MAX_DEPTH + 2]);

        assert_eq!(decode(&deep), Err(BencodeError::NestingTooDeep));
    }
}
