//! The exchange engine.
//!
//! One task owns the socket and serializes logical exchanges over it: at
//! most one exchange is active at a time, its server messages are pushed
//! to the subscriber in receipt order, and a new exchange sends nothing
//! until the previous one terminates. A cancelled subscriber switches the
//! engine into draining: pending messages of the dead exchange are still
//! decoded (sequence ids must stay verified) and discarded before the next
//! exchange is admitted.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use myflux_core::{ConnectionErrorKind, Error, Result};

use crate::flow::advance;
use crate::message::server::decode;
use crate::message::{ClientMessage, ServerMessage};
use crate::protocol::{DecodeContext, EnvelopeAssembler, EnvelopeHeader};
use crate::session::{ServerVersion, Session};

/// Byte stream the driver can run over: TCP, TLS or an in-memory pipe.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub(crate) type BoxedTransport = Box<dyn Transport>;

/// Framed, sequence-checked duplex channel over the transport.
pub(crate) struct Channel {
    stream: BoxedTransport,
    assembler: EnvelopeAssembler,
    /// Next outbound sequence id
    sequence: u8,
    pub(crate) is_tls: bool,
}

impl Channel {
    pub(crate) fn new(stream: BoxedTransport) -> Self {
        Self {
            stream,
            assembler: EnvelopeAssembler::new(),
            sequence: 0,
            is_tls: false,
        }
    }

    /// Replace the transport (TLS upgrade). Framing state carries over.
    #[cfg(feature = "tls")]
    pub(crate) fn replace_stream(&mut self, stream: BoxedTransport) {
        self.stream = stream;
        self.is_tls = true;
    }

    #[cfg(feature = "tls")]
    pub(crate) fn take_stream(&mut self) -> BoxedTransport {
        std::mem::replace(&mut self.stream, Box::new(tokio::io::empty()))
    }

    /// Read envelopes until one logical message completes.
    pub(crate) async fn read_message(&mut self) -> Result<Vec<Bytes>> {
        loop {
            let mut header_buf = [0u8; 4];
            self.stream
                .read_exact(&mut header_buf)
                .await
                .map_err(transport_closed)?;
            let header = EnvelopeHeader::from_bytes(&header_buf);

            let mut payload = vec![0u8; header.payload_length as usize];
            if !payload.is_empty() {
                self.stream
                    .read_exact(&mut payload)
                    .await
                    .map_err(transport_closed)?;
            }
            trace!(
                "envelope in: {} bytes, sequence {}",
                header.payload_length,
                header.sequence_id
            );

            if let Some(fragments) = self.assembler.push(header, Bytes::from(payload))? {
                self.sequence = self.assembler.expected_sequence();
                return Ok(fragments);
            }
        }
    }

    /// Encode and send one client message.
    pub(crate) async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        if message.resets_sequence() {
            self.sequence = 0;
        }
        let payload = message.encode()?;
        let mut wire = BytesMut::with_capacity(payload.len() + 4);
        crate::protocol::write_envelopes(&mut wire, &payload, &mut self.sequence);
        self.assembler.expect_sequence(self.sequence);

        self.stream.write_all(&wire).await.map_err(transport_closed)?;
        self.stream.flush().await.map_err(transport_closed)?;
        trace!("sent {} payload bytes", payload.len());
        Ok(())
    }
}

fn transport_closed(err: std::io::Error) -> Error {
    Error::Connection(myflux_core::ConnectionError {
        kind: ConnectionErrorKind::Disconnected,
        message: format!("transport closed: {}", err),
        source: Some(Box::new(err)),
    })
}

/// Immutable-after-handshake connection facts shared with user handles.
#[derive(Debug)]
pub struct ConnectionInfo {
    pub connection_id: u32,
    pub server_version: ServerVersion,
    pub capabilities: u32,
    pub collation: u8,
    status_flags: AtomicU16,
}

impl ConnectionInfo {
    pub(crate) fn from_session(session: &Session) -> Self {
        Self {
            connection_id: session.connection_id,
            server_version: session.server_version,
            capabilities: session.capabilities,
            collation: session.collation,
            status_flags: AtomicU16::new(session.status_flags),
        }
    }

    pub fn status_flags(&self) -> u16 {
        self.status_flags.load(Ordering::Relaxed)
    }

    pub fn deprecate_eof(&self) -> bool {
        self.capabilities & crate::protocol::capabilities::DEPRECATE_EOF != 0
    }

    pub fn no_backslash_escapes(&self) -> bool {
        self.status_flags() & crate::protocol::server_status::NO_BACKSLASH_ESCAPES != 0
    }

    fn record_status(&self, flags: u16) {
        self.status_flags.store(flags, Ordering::Relaxed);
    }
}

/// One logical request/response unit.
pub(crate) struct Exchange {
    /// Client messages sent before any response is read
    pub messages: Vec<ClientMessage>,
    /// Initial decode context
    pub context: DecodeContext,
    /// Result rows of this exchange use the binary protocol
    pub rows_binary: bool,
    /// Statement to reset when a result-phase decode error aborts the
    /// exchange mid-stream
    pub reset_on_error: Option<u32>,
    /// Subscriber; `None` for fire-and-forget messages
    pub responses: Option<mpsc::Sender<Result<ServerMessage>>>,
}

/// Outcome of serving one exchange.
enum Served {
    /// Exchange terminated normally (or was cancelled and drained)
    Complete,
    /// The connection is no longer usable
    Fatal(Error),
}

/// Run the connection: pull exchanges off the queue, one at a time.
pub(crate) async fn run(
    mut channel: Channel,
    info: Arc<ConnectionInfo>,
    mut exchanges: mpsc::Receiver<Exchange>,
) {
    debug!(
        "connection {} entering command phase",
        info.connection_id
    );

    while let Some(exchange) = exchanges.recv().await {
        match serve(&mut channel, &info, exchange).await {
            Served::Complete => {}
            Served::Fatal(error) => {
                warn!(
                    "connection {} failed: {}",
                    info.connection_id, error
                );
                // Fail everything still queued; senders see a closed
                // channel afterwards.
                exchanges.close();
                while let Some(pending) = exchanges.recv().await {
                    if let Some(subscriber) = pending.responses {
                        let _ = subscriber.send(Err(replicate(&error))).await;
                    }
                }
                return;
            }
        }
    }

    debug!("connection {} closed", info.connection_id);
}

async fn serve(channel: &mut Channel, info: &ConnectionInfo, exchange: Exchange) -> Served {
    for message in &exchange.messages {
        if let Err(error) = channel.send(message).await {
            if let Some(subscriber) = &exchange.responses {
                let _ = subscriber.send(Err(replicate(&error))).await;
            }
            return Served::Fatal(error);
        }
    }

    let Some(subscriber) = exchange.responses else {
        return Served::Complete;
    };

    let mut context = exchange.context;
    let mut draining = false;

    loop {
        let fragments = match channel.read_message().await {
            Ok(fragments) => fragments,
            Err(error) => {
                let _ = subscriber.send(Err(replicate(&error))).await;
                return Served::Fatal(error);
            }
        };

        let message = match decode(fragments, &context, info.deprecate_eof()) {
            Ok(message) => message,
            Err(error) if error.is_fatal() => {
                let _ = subscriber.send(Err(replicate(&error))).await;
                return Served::Fatal(error);
            }
            Err(error) => {
                // Result-phase decode failure: the exchange dies, the
                // connection returns to idle. Reset the statement so the
                // server discards whatever remained of the result.
                let _ = subscriber.send(Err(replicate(&error))).await;
                if let Some(statement_id) = exchange.reset_on_error {
                    if reset_statement(channel, statement_id, info.deprecate_eof())
                        .await
                        .is_err()
                    {
                        return Served::Fatal(error);
                    }
                }
                return Served::Complete;
            }
        };

        match &message {
            ServerMessage::Ok(ok) => info.record_status(ok.status_flags),
            ServerMessage::Eof(eof) => info.record_status(eof.status_flags),
            _ => {}
        }

        let step = advance(&context, &message, info.deprecate_eof(), exchange.rows_binary);

        if !draining && subscriber.send(Ok(message)).await.is_err() {
            // Subscriber cancelled: keep decoding to the exchange
            // boundary, discarding as we go.
            trace!("subscriber gone, draining exchange");
            draining = true;
        }

        if step.done {
            return Served::Complete;
        }
        context = step.context;
    }
}

/// Send COM_STMT_RESET and consume its OK/ERR so the stream stays framed.
async fn reset_statement(channel: &mut Channel, statement_id: u32, deprecate_eof: bool) -> Result<()> {
    channel
        .send(&ClientMessage::StmtReset { statement_id })
        .await?;
    loop {
        let fragments = channel.read_message().await?;
        match decode(fragments, &DecodeContext::Command, deprecate_eof)? {
            ServerMessage::Ok(_) | ServerMessage::Err(_) => return Ok(()),
            other => {
                trace!("discarding {:?} while resetting statement", other);
            }
        }
    }
}

/// Structural copy of an error for fan-out to subscribers.
fn replicate(error: &Error) -> Error {
    match error {
        Error::Connection(c) => Error::Connection(myflux_core::ConnectionError {
            kind: c.kind,
            message: c.message.clone(),
            source: None,
        }),
        Error::Protocol(p) => Error::protocol(p.kind, p.message.clone()),
        Error::Server(s) => Error::Server(s.clone()),
        Error::Misuse(m) => Error::Misuse(m.clone()),
        Error::Decode(m) => Error::Decode(m.clone()),
        Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
        Error::Timeout => Error::Timeout,
        Error::Cancelled => Error::Cancelled,
    }
}
