//! Frame and message transports.
//!
//! The byte pipe itself is external — TCP, TLS, or an in-memory duplex.
//! This module turns any `AsyncRead + AsyncWrite` pair into the two
//! halves the engines work with:
//!
//! - [`FrameSink`] / [`FrameSource`]: send one frame, receive a lazy
//!   sequence of decoded frames, close. Object-safe so heterogeneous
//!   transports can sit behind one session type.
//! - [`MessageSender`] / [`MessageReceiver`]: the message layer on top,
//!   serializing via the frame codec and deserializing through the
//!   registry with the configured parse mode.
//!
//! Each session exclusively owns its transport halves; the receive half
//! lives on the session task and the send half behind an async mutex so
//! transfer ticks and disconnects can send concurrently.

use async_trait::async_trait;
use enp_proto::diag::{Diagnostic, ParseResult};
use enp_proto::frame::{Frame, FrameCodec};
use enp_proto::message::Message;
use enp_proto::registry::{self, ParseMode};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::TransportError;

/// The sending half of a frame transport.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Send one frame, flushing it to the wire.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Flush and close the underlying pipe. Idempotent.
    async fn close(&mut self);
}

/// The receiving half of a frame transport: a lazy sequence of decode
/// outcomes ending with `None` at EOF.
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Next decoded frame, a failure item, or `None` on clean EOF.
    async fn next(&mut self) -> Option<ParseResult<Frame>>;
}

/// [`FrameSink`] over any `AsyncWrite` via the frame codec.
pub struct FrameWriter<W> {
    inner: FramedWrite<W, FrameCodec>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> FrameWriter<W> {
    /// Wrap a write half.
    pub fn new(write: W) -> Self {
        Self { inner: FramedWrite::new(write, FrameCodec::new()) }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> FrameSink for FrameWriter<W> {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.inner.send(frame).await.map_err(TransportError::Io)
    }

    async fn close(&mut self) {
        let _ = self.inner.close().await;
    }
}

/// [`FrameSource`] over any `AsyncRead` via the frame codec.
///
/// I/O errors from the pipe surface as `READ_ERROR` failure items, so the
/// session task has a single shutdown path for "stream went bad".
pub struct FrameReader<R> {
    inner: FramedRead<R, FrameCodec>,
}

impl<R: AsyncRead + Unpin + Send + 'static> FrameReader<R> {
    /// Wrap a read half.
    pub fn new(read: R) -> Self {
        Self { inner: FramedRead::new(read, FrameCodec::new()) }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send + 'static> FrameSource for FrameReader<R> {
    async fn next(&mut self) -> Option<ParseResult<Frame>> {
        match self.inner.next().await {
            Some(Ok(item)) => Some(item),
            Some(Err(err)) => Some(ParseResult::failure(vec![Diagnostic::error(
                "READ_ERROR",
                format!("transport read failed: {err}"),
            )])),
            None => None,
        }
    }
}

/// Message-level sending half.
pub struct MessageSender {
    sink: Box<dyn FrameSink>,
}

impl MessageSender {
    /// Wrap a frame sink.
    #[must_use]
    pub fn new(sink: Box<dyn FrameSink>) -> Self {
        Self { sink }
    }

    /// Serialize and send one message.
    pub async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        self.sink.send(message.to_frame()).await
    }

    /// Close the underlying transport.
    pub async fn close(&mut self) {
        self.sink.close().await;
    }
}

/// Message-level receiving half.
pub struct MessageReceiver {
    source: Box<dyn FrameSource>,
    mode: ParseMode,
}

impl MessageReceiver {
    /// Wrap a frame source with a parse mode.
    #[must_use]
    pub fn new(source: Box<dyn FrameSource>, mode: ParseMode) -> Self {
        Self { source, mode }
    }

    /// Next decoded message. Frame-level diagnostics ride ahead of
    /// message-level ones on each item.
    pub async fn recv(&mut self) -> Option<ParseResult<Message>> {
        let item = self.source.next().await?;
        Some(match item {
            ParseResult::Success { value: frame, diagnostics } => {
                registry::parse_frame(&frame, self.mode).with_earlier_diagnostics(diagnostics)
            },
            ParseResult::Failure { diagnostics } => ParseResult::failure(diagnostics),
        })
    }
}

/// Split any byte pipe into message transport halves.
pub fn split_transport<S>(stream: S, mode: ParseMode) -> (MessageSender, MessageReceiver)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
    (
        MessageSender::new(Box::new(FrameWriter::new(write))),
        MessageReceiver::new(Box::new(FrameReader::new(read)), mode),
    )
}

/// Message transport over a TCP stream, using owned halves.
#[must_use]
pub fn tcp_transport(stream: TcpStream, mode: ParseMode) -> (MessageSender, MessageReceiver) {
    let (read, write) = stream.into_split();
    (
        MessageSender::new(Box::new(FrameWriter::new(write))),
        MessageReceiver::new(Box::new(FrameReader::new(read)), mode),
    )
}

#[cfg(test)]
mod tests {
    use enp_proto::message::{SessionParameters, SoftDisconnect};

    use super::*;

    #[tokio::test]
    async fn messages_survive_a_duplex_pipe() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut tx, _) = split_transport(client, ParseMode::Lenient);
        let (_, mut rx) = split_transport(server, ParseMode::Lenient);

        let hello = Message::SessionParameters(
            SessionParameters::new("device-1").with_device_type("charger"),
        );
        tx.send(&hello).await.unwrap();
        tx.send(&Message::Ping).await.unwrap();

        let first = rx.recv().await.unwrap().into_value().unwrap();
        assert_eq!(first, hello);
        let second = rx.recv().await.unwrap().into_value().unwrap();
        assert_eq!(second, Message::Ping);
    }

    #[tokio::test]
    async fn closed_sender_yields_eof() {
        let (client, server) = tokio::io::duplex(4096);
        let (mut tx, _) = split_transport(client, ParseMode::Lenient);
        let (_, mut rx) = split_transport(server, ParseMode::Lenient);

        tx.send(&Message::SoftDisconnect(SoftDisconnect::final_with_reason("done")))
            .await
            .unwrap();
        tx.close().await;

        assert!(rx.recv().await.unwrap().is_success());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn garbage_on_the_wire_is_a_failure_item_then_eof() {
        use tokio::io::AsyncWriteExt;

        let (mut client, server) = tokio::io::duplex(4096);
        let (_, mut rx) = split_transport(server, ParseMode::Lenient);

        client.write_all(&[0xFF, 0x00, 0x01]).await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        let item = rx.recv().await.unwrap();
        assert!(item.is_failure());
        assert!(rx.recv().await.is_none());
    }
}
