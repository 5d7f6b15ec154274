// https://redis.io/docs/reference/protocol-spec

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;
use thiserror::Error as ThisError;

static CRLF: &[u8; 2] = b"\r\n";

/// Arrays nested deeper than this are rejected. The nesting is chosen by the peer and the parser
/// is recursive.
pub const MAX_DEPTH: usize = 128;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("protocol error; {0}")]
    Protocol(&'static str),
    #[error("protocol error; arrays nested deeper than {MAX_DEPTH} levels")]
    TooDeep,
    #[error("protocol error; frame size exceeds limit of {0} bytes")]
    FrameTooLarge(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A RESP2 value. Null bulk strings and null arrays are kept apart from their empty
/// counterparts, so a reply can be relayed without changing its meaning.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(Bytes),
    /// Not necessarily UTF-8: backends echo client input into error text.
    Error(Bytes),
    Integer(i64),
    Bulk(Bytes),
    /// `$-1\r\n`
    Null,
    Array(Vec<Frame>),
    /// `*-1\r\n`
    NullArray,
}

// Protocol specification: https://redis.io/docs/reference/protocol-spec/
impl Frame {
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        Self::parse_nested(src, 0)
    }

    /// Parses one element of an array whose header was read with [`parse_array_len`].
    pub(crate) fn parse_element(src: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        Self::parse_nested(src, 1)
    }

    fn parse_nested(src: &mut Cursor<&[u8]>, depth: usize) -> Result<Self, Error> {
        if depth > MAX_DEPTH {
            return Err(Error::TooDeep);
        }

        // Every frame starts with a line; its first byte identifies the type and the rest of the
        // line is either the value itself or a length header.
        let line = get_line(src)?;
        let (&first_byte, rest) = line
            .split_first()
            .ok_or(Error::Protocol("short response line"))?;
        let data_type = DataType::try_from(first_byte)?;

        match data_type {
            DataType::SimpleString => Ok(Frame::Simple(Bytes::copy_from_slice(rest))),
            DataType::SimpleError => Ok(Frame::Error(Bytes::copy_from_slice(rest))),
            DataType::Integer => parse_integer(rest).map(Frame::Integer),
            // $<length>\r\n<data>\r\n
            DataType::BulkString => {
                let Some(length) = parse_length(rest)? else {
                    return Ok(Frame::Null);
                };

                if src.remaining() < length {
                    return Err(Error::Incomplete);
                }

                let start = src.position() as usize;
                let data = Bytes::copy_from_slice(&src.get_ref()[start..start + length]);
                src.advance(length);

                // The payload is followed by an empty line.
                if !get_line(src)?.is_empty() {
                    return Err(Error::Protocol("bad bulk string format"));
                }

                Ok(Frame::Bulk(data))
            }
            // *<number-of-elements>\r\n<element-1>...<element-n>
            DataType::Array => {
                let Some(length) = parse_length(rest)? else {
                    return Ok(Frame::NullArray);
                };

                // The smallest element is three bytes long, anything beyond that is a promise the
                // peer has not kept yet.
                let mut frames = Vec::with_capacity(length.min(src.remaining() / 3));
                for _ in 0..length {
                    frames.push(Self::parse_nested(src, depth + 1)?);
                }

                Ok(Frame::Array(frames))
            }
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(s) => {
                dst.put_u8(u8::from(DataType::SimpleString));
                dst.put_slice(s);
                dst.put_slice(CRLF);
            }
            Frame::Error(s) => {
                dst.put_u8(u8::from(DataType::SimpleError));
                dst.put_slice(s);
                dst.put_slice(CRLF);
            }
            Frame::Integer(i) => {
                dst.put_u8(u8::from(DataType::Integer));
                dst.put_slice(i.to_string().as_bytes());
                dst.put_slice(CRLF);
            }
            Frame::Bulk(bytes) => {
                put_header(dst, DataType::BulkString, bytes.len());
                dst.put_slice(bytes);
                dst.put_slice(CRLF);
            }
            Frame::Null => dst.put_slice(b"$-1\r\n"),
            Frame::Array(arr) => {
                put_header(dst, DataType::Array, arr.len());
                for frame in arr {
                    frame.encode(dst);
                }
            }
            Frame::NullArray => dst.put_slice(b"*-1\r\n"),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = BytesMut::new();
        self.encode(&mut bytes);
        bytes.to_vec()
    }

    /// Splits `payload` into an array of bulk strings of at most `chunk_size` bytes each. An
    /// empty payload still produces one (empty) chunk.
    pub fn chunked(payload: &Bytes, chunk_size: usize) -> Frame {
        let chunk_size = chunk_size.max(1);
        if payload.is_empty() {
            return Frame::Array(vec![Frame::Bulk(Bytes::new())]);
        }

        let chunks = (0..payload.len())
            .step_by(chunk_size)
            .map(|start| {
                let end = (start + chunk_size).min(payload.len());
                Frame::Bulk(payload.slice(start..end))
            })
            .collect();

        Frame::Array(chunks)
    }
}

impl From<Frame> for Vec<u8> {
    fn from(frame: Frame) -> Self {
        frame.serialize()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Simple(s) => write!(f, "+{}", String::from_utf8_lossy(s)),
            Frame::Error(s) => write!(f, "-{}", String::from_utf8_lossy(s)),
            Frame::Integer(i) => write!(f, ":{}", i),
            Frame::Bulk(bytes) => write!(f, "${}", String::from_utf8_lossy(bytes)),
            Frame::Null => write!(f, "$-1"),
            Frame::Array(arr) => {
                write!(f, "*{}", arr.len())?;
                for frame in arr {
                    write!(f, " {}", frame)?;
                }
                Ok(())
            }
            Frame::NullArray => write!(f, "*-1"),
        }
    }
}

fn put_header(dst: &mut BytesMut, data_type: DataType, len: usize) {
    dst.put_u8(u8::from(data_type));
    dst.put_slice(len.to_string().as_bytes());
    dst.put_slice(CRLF);
}

/// Returns the next line without its terminator. Lines must end in `\r\n`.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let buf: &'a [u8] = *src.get_ref();

    let newline = buf[start..]
        .iter()
        .position(|&b| b == b'\n')
        .map(|index| start + index)
        .ok_or(Error::Incomplete)?;

    if newline == start || buf[newline - 1] != b'\r' {
        return Err(Error::Protocol("bad response line terminator"));
    }

    src.set_position((newline + 1) as u64);

    Ok(&buf[start..newline - 1])
}

/// Reads the `*<n>\r\n` header of an array. `None` is the null array.
pub(crate) fn parse_array_len(src: &mut Cursor<&[u8]>) -> Result<Option<usize>, Error> {
    let line = get_line(src)?;
    match line.split_first() {
        Some((&b'*', rest)) => parse_length(rest),
        _ => Err(Error::Protocol("unexpected response line")),
    }
}

/// Parses bulk string and array lengths. `-1` is the only negative length accepted and stands
/// for null.
fn parse_length(digits: &[u8]) -> Result<Option<usize>, Error> {
    if digits == b"-1" {
        return Ok(None);
    }
    if digits.is_empty() {
        return Err(Error::Protocol("malformed length"));
    }

    digits
        .iter()
        .try_fold(0usize, |n, &b| {
            if !b.is_ascii_digit() {
                return Err(Error::Protocol("illegal bytes in length"));
            }
            n.checked_mul(10)
                .and_then(|n| n.checked_add(usize::from(b - b'0')))
                .ok_or(Error::Protocol("malformed length"))
        })
        .map(Some)
}

fn parse_integer(digits: &[u8]) -> Result<i64, Error> {
    let (negative, digits) = match digits.split_first() {
        Some((&b'-', rest)) => (true, rest),
        _ => (false, digits),
    };
    if digits.is_empty() {
        return Err(Error::Protocol("malformed integer"));
    }

    // Accumulating towards the sign keeps i64::MIN representable.
    digits.iter().try_fold(0i64, |n, &b| {
        if !b.is_ascii_digit() {
            return Err(Error::Protocol("malformed integer"));
        }
        let digit = i64::from(b - b'0');
        n.checked_mul(10)
            .and_then(|n| {
                if negative {
                    n.checked_sub(digit)
                } else {
                    n.checked_add(digit)
                }
            })
            .ok_or(Error::Protocol("malformed integer"))
    })
}

#[derive(Debug)]
enum DataType {
    SimpleString, // '+'
    SimpleError,  // '-'
    Integer,      // ':'
    BulkString,   // '$'
    Array,        // '*'
}

impl TryFrom<u8> for DataType {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            b'+' => Ok(Self::SimpleString),
            b'-' => Ok(Self::SimpleError),
            b':' => Ok(Self::Integer),
            b'$' => Ok(Self::BulkString),
            b'*' => Ok(Self::Array),
            _ => Err(Error::Protocol("unexpected response line")),
        }
    }
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> Self {
        match value {
            DataType::SimpleString => b'+',
            DataType::SimpleError => b'-',
            DataType::Integer => b':',
            DataType::BulkString => b'$',
            DataType::Array => b'*',
        }
    }
}
