use bytes::{BufMut, Bytes, BytesMut};
use itertools::Itertools;
use std::fmt;
use thiserror::Error as ThisError;

use crate::frame::Frame;

/// A request as sent on the wire: an array of bulk strings whose first element is the command
/// name. Names are compared case-insensitively but always sent as given.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    parts: Vec<Bytes>,
}

impl Command {
    pub fn new(name: impl ToArg) -> Command {
        Command {
            parts: vec![name.to_arg()],
        }
    }

    pub fn arg(mut self, arg: impl ToArg) -> Command {
        self.parts.push(arg.to_arg());
        self
    }

    pub fn push_arg(&mut self, arg: impl ToArg) {
        self.parts.push(arg.to_arg());
    }

    pub fn from_parts(parts: Vec<Bytes>) -> Result<Command, CommandError> {
        if parts.is_empty() {
            return Err(CommandError::Empty);
        }
        Ok(Command { parts })
    }

    pub fn name(&self) -> &Bytes {
        &self.parts[0]
    }

    /// The command name in upper case, for table lookups.
    pub fn normalized_name(&self) -> String {
        normalize(self.name())
    }

    pub fn args(&self) -> &[Bytes] {
        &self.parts[1..]
    }

    /// `*<argc>\r\n` followed by `$<len>\r\n<bytes>\r\n` per element.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(b'*');
        dst.put_slice(self.parts.len().to_string().as_bytes());
        dst.put_slice(b"\r\n");
        for part in &self.parts {
            dst.put_u8(b'$');
            dst.put_slice(part.len().to_string().as_bytes());
            dst.put_slice(b"\r\n");
            dst.put_slice(part);
            dst.put_slice(b"\r\n");
        }
    }
}

pub(crate) fn normalize(name: &[u8]) -> String {
    String::from_utf8_lossy(name).to_ascii_uppercase()
}

impl TryFrom<Frame> for Command {
    type Error = CommandError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        // Clients send commands to the Redis server as RESP arrays.
        let frames = match frame {
            Frame::Array(array) => array,
            frame => return Err(CommandError::InvalidFrame(frame)),
        };

        let parts = frames
            .into_iter()
            .map(|frame| match frame {
                Frame::Bulk(bytes) => Ok(bytes),
                Frame::Simple(s) => Ok(s),
                frame => Err(CommandError::InvalidArgument(frame)),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Command::from_parts(parts)
    }
}

impl From<Command> for Frame {
    fn from(cmd: Command) -> Self {
        Frame::Array(cmd.parts.into_iter().map(Frame::Bulk).collect())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self
            .parts
            .iter()
            .map(|part| String::from_utf8_lossy(part))
            .join(" ");
        f.write_str(&text)
    }
}

#[derive(Debug, ThisError, PartialEq)]
pub enum CommandError {
    #[error("protocol error; expected array, got {0}")]
    InvalidFrame(Frame),
    #[error("protocol error; expected bulk string argument, got {0}")]
    InvalidArgument(Frame),
    #[error("protocol error; empty command")]
    Empty,
}

/// Converts a value into a single bulk string argument.
pub trait ToArg {
    fn to_arg(&self) -> Bytes;
}

impl<T: ToArg + ?Sized> ToArg for &T {
    fn to_arg(&self) -> Bytes {
        (**self).to_arg()
    }
}

impl ToArg for str {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for [u8] {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl<const N: usize> ToArg for [u8; N] {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Bytes {
    fn to_arg(&self) -> Bytes {
        self.clone()
    }
}

impl ToArg for bool {
    fn to_arg(&self) -> Bytes {
        Bytes::from_static(if *self { b"1" } else { b"0" })
    }
}

/// A missing value is sent as an empty bulk string.
impl<T: ToArg> ToArg for Option<T> {
    fn to_arg(&self) -> Bytes {
        match self {
            Some(value) => value.to_arg(),
            None => Bytes::new(),
        }
    }
}

macro_rules! display_arg {
    ($($t:ty),*) => {
        $(
            impl ToArg for $t {
                fn to_arg(&self) -> Bytes {
                    Bytes::from(self.to_string())
                }
            }
        )*
    };
}

display_arg!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64);

/// Sends any `Display` value as its textual form.
#[derive(Clone, Copy, Debug)]
pub struct Text<T>(pub T);

impl<T: fmt::Display> ToArg for Text<T> {
    fn to_arg(&self) -> Bytes {
        Bytes::from(self.0.to_string())
    }
}
