use futures::StreamExt;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;
use uuid::Uuid;

use crate::codec::FrameCodec;
use crate::frame::{self, Frame};

/// The client side of a proxy session: frames are read from the socket and replies are written
/// back through a buffered writer.
pub struct Connection {
    pub id: Uuid,
    reader: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: BufWriter<OwnedWriteHalf>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Connection {
        Connection::with_codec(stream, FrameCodec::default())
    }

    pub fn with_codec(stream: TcpStream, codec: FrameCodec) -> Connection {
        let (reader, writer) = stream.into_split();
        Connection {
            id: Uuid::new_v4(),
            reader: FramedRead::new(reader, codec),
            writer: BufWriter::new(writer),
        }
    }

    /// Reads the next frame. `None` means the client closed the connection cleanly, that is,
    /// with no partial frame left in the buffer.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, frame::Error> {
        self.reader.next().await.transpose()
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), frame::Error> {
        self.writer.write_all(&frame.serialize()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
