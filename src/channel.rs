//! The duplex message channel a session runs over.
//!
//! A [`Channel`] is a reader half and a writer half. The session owns the
//! reader; the writer is shared behind the [`crate::peer::Peer`].

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::codec;
use crate::error::TransportError;
use crate::protocol::Message;

#[async_trait]
pub trait MessageReader: Send {
    /// Read the next message. `Ok(None)` is a clean end of stream.
    async fn read_message(&mut self) -> Result<Option<Message>, TransportError>;
}

#[async_trait]
pub trait MessageWriter: Send {
    async fn write_message(&mut self, message: &Message) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

pub struct Channel {
    pub reader: Box<dyn MessageReader>,
    pub writer: Box<dyn MessageWriter>,
}

impl Channel {
    pub fn new(
        reader: impl MessageReader + 'static,
        writer: impl MessageWriter + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Frame messages over a byte stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::new(FramedReader::new(read_half), FramedWriter::new(write_half))
    }
}

/// Reads `Content-Length` framed messages.
pub struct FramedReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin + Send> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> MessageReader for FramedReader<R> {
    async fn read_message(&mut self) -> Result<Option<Message>, TransportError> {
        match codec::read_frame(&mut self.inner).await? {
            None => Ok(None),
            Some(body) => Ok(Some(Message::from_slice(&body)?)),
        }
    }
}

/// Writes `Content-Length` framed messages.
pub struct FramedWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin + Send> FramedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> MessageWriter for FramedWriter<W> {
    async fn write_message(&mut self, message: &Message) -> Result<(), TransportError> {
        let body = message.to_vec().map_err(TransportError::Encode)?;
        codec::write_frame(&mut self.inner, &body).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory channel
// ---------------------------------------------------------------------------

pub struct MemoryReader {
    rx: mpsc::UnboundedReceiver<Message>,
}

#[async_trait]
impl MessageReader for MemoryReader {
    async fn read_message(&mut self) -> Result<Option<Message>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

pub struct MemoryWriter {
    tx: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl MessageWriter for MemoryWriter {
    async fn write_message(&mut self, message: &Message) -> Result<(), TransportError> {
        self.tx
            .send(message.clone())
            .map_err(|_| TransportError::Closed)
    }
}

/// The far end of an in-memory channel.
pub struct MemoryPeer {
    tx: Option<mpsc::UnboundedSender<Message>>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl MemoryPeer {
    pub fn send(&self, message: Message) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx.send(message).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    /// `None` once the session has dropped its writer.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// End the stream the session is reading.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

/// An unbounded in-memory channel and the peer that drives it.
pub fn memory_pair() -> (Channel, MemoryPeer) {
    let (to_session, from_peer) = mpsc::unbounded_channel();
    let (to_peer, from_session) = mpsc::unbounded_channel();
    let channel = Channel::new(MemoryReader { rx: from_peer }, MemoryWriter { tx: to_peer });
    let peer = MemoryPeer {
        tx: Some(to_session),
        rx: from_session,
    };
    (channel, peer)
}
