/*
 * This file is a part of Skytable
 * Skytable (formerly known as TerrabaseDB or Skybase) is a free and open-source
 * NoSQL database written by Sayan Nandan ("the Author") with the
 * vision to provide flexibility in data modelling without compromising
 * on performance, queryability or scalability.
*/

//! # RESP2 framing
//!
//! Parses arrays of bulk strings off a growable connection buffer, and
//! writes replies back in the same wire format. Inline commands are not
//! supported; every request MUST use the `*N\r\n($L\r\nbytes\r\n){N}` array
//! framing.

use std::io::{self, Write};

/// Attempts to parse exactly one RESP array of bulk strings from the front of
/// `buf`. On success, the consumed bytes are drained from `buf` and the
/// argument vector is returned. On an incomplete buffer, or on a malformed
/// prefix, returns `None` without touching `buf` — the caller is expected to
/// read more bytes (a genuinely malformed prefix is a protocol error the
/// caller surfaces itself; this parser only distinguishes "not enough bytes
/// yet" from "will never parse").
pub fn try_parse_command(buf: &mut Vec<u8>) -> Result<Option<Vec<Vec<u8>>>, ()> {
    let mut cursor = 0usize;
    let count = match read_header(buf, &mut cursor, b'*')? {
        Some(n) => n,
        None => return Ok(None),
    };
    if count < 0 {
        return Err(());
    }
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = match read_header(buf, &mut cursor, b'$')? {
            Some(n) => n,
            None => return Ok(None),
        };
        if len < 0 {
            return Err(());
        }
        let len = len as usize;
        if buf.len() < cursor + len + 2 {
            return Ok(None);
        }
        if &buf[cursor + len..cursor + len + 2] != b"\r\n" {
            return Err(());
        }
        args.push(buf[cursor..cursor + len].to_vec());
        cursor += len + 2;
    }
    buf.drain(..cursor);
    Ok(Some(args))
}

/// Reads one `<prefix><integer>\r\n` header starting at `*cursor`, advancing
/// it past the header on success. `Ok(None)` means the buffer doesn't yet
/// hold a full line; `Err(())` means the prefix or integer is malformed.
fn read_header(buf: &[u8], cursor: &mut usize, prefix: u8) -> Result<Option<i64>, ()> {
    if buf.len() <= *cursor {
        return Ok(None);
    }
    if buf[*cursor] != prefix {
        return Err(());
    }
    let line_start = *cursor + 1;
    let Some(rel_nl) = buf[line_start..].iter().position(|&b| b == b'\n') else {
        return Ok(None);
    };
    let line_end = line_start + rel_nl;
    if line_end == line_start || buf[line_end - 1] != b'\r' {
        return Err(());
    }
    let digits = &buf[line_start..line_end - 1];
    let text = std::str::from_utf8(digits).map_err(|_| ())?;
    let n: i64 = text.parse().map_err(|_| ())?;
    *cursor = line_end + 1;
    Ok(Some(n))
}

/// A reply value, encoded in RESP2 on [`Reply::write_to`].
pub enum Reply {
    Ok,
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Nil,
    Array(Vec<Reply>),
}

impl Reply {
    pub fn bulk(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Bulk(bytes.into())
    }

    pub fn array_of_bulks<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Vec<u8>>,
    {
        Self::Array(items.into_iter().map(|b| Self::Bulk(b.into())).collect())
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        match self {
            Self::Ok => w.write_all(b"+OK\r\n"),
            Self::Simple(s) => write!(w, "+{s}\r\n"),
            Self::Error(msg) => write!(w, "-ERR {msg}\r\n"),
            Self::Integer(n) => write!(w, ":{n}\r\n"),
            Self::Nil => w.write_all(b"$-1\r\n"),
            Self::Bulk(bytes) => {
                write!(w, "${}\r\n", bytes.len())?;
                w.write_all(bytes)?;
                w.write_all(b"\r\n")
            }
            Self::Array(items) => {
                write!(w, "*{}\r\n", items.len())?;
                for item in items {
                    item.write_to(w)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_single_command() {
        let mut buf = b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n".to_vec();
        let args = try_parse_command(&mut buf).unwrap().unwrap();
        assert_eq!(args, vec![b"GET".to_vec(), b"foo".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn returns_none_on_incomplete_buffer() {
        let mut buf = b"*2\r\n$3\r\nGET\r\n$3\r\nfo".to_vec();
        let before = buf.clone();
        let result = try_parse_command(&mut buf).unwrap();
        assert!(result.is_none());
        assert_eq!(buf, before);
    }

    #[test]
    fn leaves_a_second_pipelined_command_untouched() {
        let mut buf = b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n".to_vec();
        let args = try_parse_command(&mut buf).unwrap().unwrap();
        assert_eq!(args, vec![b"PING".to_vec()]);
        assert_eq!(buf, b"*1\r\n$4\r\nPING\r\n");
    }

    #[test]
    fn rejects_negative_array_length() {
        let mut buf = b"*-1\r\n".to_vec();
        assert!(try_parse_command(&mut buf).is_err());
    }

    #[test]
    fn rejects_missing_bulk_prefix() {
        let mut buf = b"*1\r\n:3\r\nGET\r\n".to_vec();
        assert!(try_parse_command(&mut buf).is_err());
    }

    #[test]
    fn encodes_nil_and_array_replies() {
        let mut out = Vec::new();
        Reply::Nil.write_to(&mut out).unwrap();
        assert_eq!(out, b"$-1\r\n");

        out.clear();
        Reply::array_of_bulks(vec![b"a".to_vec(), b"bb".to_vec()])
            .write_to(&mut out)
            .unwrap();
        assert_eq!(out, b"*2\r\n$1\r\na\r\n$2\r\nbb\r\n");
    }
}
