use bytes::{Buf, Bytes, BytesMut};
use clap::ValueEnum;
use std::io::{self, Cursor};
use tokio_util::codec::{Decoder, Encoder};

use crate::command::Command;
use crate::frame::{self, Frame};

pub const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

pub const DEFAULT_CHUNK_SIZE: usize = 1024;

pub const REJECTED_COMMAND: &str = "ERR command not support";

/// A top-level array whose elements are still arriving. Parsed elements are moved out of the
/// read buffer, so a large array sent slowly is not parsed again from its first byte on every
/// read.
#[derive(Clone, Debug)]
struct PartialArray {
    len: usize,
    items: Vec<Frame>,
    consumed: usize,
}

#[derive(Clone, Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
    partial: Option<PartialArray>,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> FrameCodec {
        FrameCodec {
            max_frame_size,
            partial: None,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn decode_scalar(&self, src: &mut BytesMut) -> Result<Option<Frame>, frame::Error> {
        let mut cursor = Cursor::new(&src[..]);
        let frame = match Frame::parse(&mut cursor) {
            Ok(frame) => frame,
            Err(frame::Error::Incomplete) => return self.incomplete(src.len()),
            Err(err) => return Err(err),
        };

        // Remove the parsed frame from the buffer.
        let position = cursor.position() as usize;
        src.advance(position);

        Ok(Some(frame))
    }

    fn incomplete(&self, buffered: usize) -> Result<Option<Frame>, frame::Error> {
        // Check if the frame size exceeds a certain limit to prevent DoS attacks
        if buffered > self.max_frame_size {
            return Err(frame::Error::FrameTooLarge(self.max_frame_size));
        }
        Ok(None)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = frame::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.partial.is_none() {
            if src.first() != Some(&b'*') {
                return self.decode_scalar(src);
            }

            let mut cursor = Cursor::new(&src[..]);
            let len = match frame::parse_array_len(&mut cursor) {
                Ok(len) => len,
                Err(frame::Error::Incomplete) => return self.incomplete(src.len()),
                Err(err) => return Err(err),
            };
            let consumed = cursor.position() as usize;
            src.advance(consumed);

            let Some(len) = len else {
                return Ok(Some(Frame::NullArray));
            };
            self.partial = Some(PartialArray {
                len,
                items: Vec::with_capacity(len.min(src.len() / 3)),
                consumed,
            });
        }

        let max_frame_size = self.max_frame_size;
        let Some(partial) = self.partial.as_mut() else {
            return Ok(None);
        };

        while partial.items.len() < partial.len {
            let mut cursor = Cursor::new(&src[..]);
            match Frame::parse_element(&mut cursor) {
                Ok(frame) => {
                    let position = cursor.position() as usize;
                    src.advance(position);
                    partial.consumed += position;
                    partial.items.push(frame);
                }
                Err(frame::Error::Incomplete) => {
                    if partial.consumed + src.len() > max_frame_size {
                        self.partial = None;
                        return Err(frame::Error::FrameTooLarge(max_frame_size));
                    }
                    return Ok(None);
                }
                Err(err) => {
                    self.partial = None;
                    return Err(err);
                }
            }
        }

        let items = self.partial.take().map(|partial| partial.items);
        Ok(items.map(Frame::Array))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.partial.is_none() => Ok(None),
            None => {
                let err = io::Error::new(io::ErrorKind::UnexpectedEof, "bytes remaining on stream");
                Err(err.into())
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = frame::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

impl Encoder<&Command> for FrameCodec {
    type Error = frame::Error;

    fn encode(&mut self, item: &Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

/// How backend replies are shaped before they are written back to a client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Framing {
    /// Every reply body is wrapped in an array of bulk strings of at most `chunk_size` bytes.
    /// Errors and nulls become a single empty chunk.
    #[default]
    Chunked,
    /// Replies are relayed exactly as the backend sent them.
    Transparent,
}

/// Turns backend replies and locally produced errors into the frames sent to clients.
#[derive(Clone, Copy, Debug)]
pub struct ReplyFramer {
    framing: Framing,
    chunk_size: usize,
}

impl ReplyFramer {
    pub fn new(framing: Framing, chunk_size: usize) -> ReplyFramer {
        ReplyFramer {
            framing,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn reply(&self, reply: Frame) -> Frame {
        if self.framing == Framing::Transparent {
            return reply;
        }

        let payload = match reply {
            Frame::Bulk(bytes) => bytes,
            Frame::Simple(s) => s,
            Frame::Integer(i) => Bytes::from(i.to_string()),
            // Arrays have no single body to split, they go through untouched.
            frame @ Frame::Array(_) => return frame,
            Frame::Error(_) | Frame::Null | Frame::NullArray => Bytes::new(),
        };

        Frame::chunked(&payload, self.chunk_size)
    }

    pub fn error(&self, msg: impl Into<Bytes>) -> Frame {
        match self.framing {
            Framing::Chunked => Frame::chunked(&Bytes::new(), self.chunk_size),
            Framing::Transparent => Frame::Error(msg.into()),
        }
    }

    pub fn rejected(&self) -> Frame {
        match self.framing {
            Framing::Chunked => Frame::chunked(&Bytes::from(REJECTED_COMMAND), self.chunk_size),
            Framing::Transparent => Frame::Error(Bytes::from(REJECTED_COMMAND)),
        }
    }
}

impl Default for ReplyFramer {
    fn default() -> Self {
        ReplyFramer::new(Framing::default(), DEFAULT_CHUNK_SIZE)
    }
}
