//! Transport session: one live, handshaken connection to the broker
//!
//! `Session::establish` performs the CONNECT/CONNACK exchange over a fresh
//! byte stream and hands back framed reader/writer halves. Frame I/O errors
//! and malformed frames fail immediately; recovery belongs to the
//! reconnection supervisor, never to this layer.

use crate::codec::{ConnAck, Connect, ConnectReturnCode, Packet, ProtocolError};
use crate::config::MqttOptions;
use crate::error::{ConnectError, SessionFault};
use crate::transport::ByteStream;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::timeout;
use tracing::{debug, trace};

/// Read buffer granularity; frames larger than this are assembled across
/// several reads.
const READ_CHUNK: usize = 4 * 1024;

/// Decodes complete frames off the read half of a live stream.
pub(crate) struct FrameReader {
    stream: ReadHalf<Box<dyn ByteStream>>,
    buffer: BytesMut,
    max_packet_size: usize,
}

impl FrameReader {
    /// Next complete frame, suspending for more bytes as needed. EOF while
    /// a session is live is a stream failure like any other.
    pub(crate) async fn read_packet(&mut self) -> Result<Packet, SessionFault> {
        loop {
            if let Some(packet) = Packet::decode(&mut self.buffer, self.max_packet_size)? {
                trace!(packet = packet.name(), "frame in");
                return Ok(packet);
            }
            self.buffer.reserve(READ_CHUNK);
            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(SessionFault::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "broker closed the stream",
                )));
            }
        }
    }
}

/// Encodes frames onto the write half of a live stream.
pub(crate) struct FrameWriter {
    stream: WriteHalf<Box<dyn ByteStream>>,
    buffer: BytesMut,
}

impl FrameWriter {
    pub(crate) async fn write_packet(&mut self, packet: &Packet) -> Result<(), SessionFault> {
        self.buffer.clear();
        packet.encode(&mut self.buffer)?;
        trace!(packet = packet.name(), len = self.buffer.len(), "frame out");
        self.stream.write_all(&self.buffer).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Flush and close the stream. Errors are ignored, the session is going
    /// away either way. Whether a DISCONNECT precedes this is the caller's
    /// decision: skipping it makes the broker publish the will.
    pub(crate) async fn shutdown(mut self) {
        let _ = self.stream.flush().await;
        let _ = self.stream.shutdown().await;
    }
}

/// A live, handshaken session.
pub struct Session {
    reader: FrameReader,
    writer: FrameWriter,
    /// Whether the broker retained state for this client id
    /// (clean session = false across a reconnect).
    session_present: bool,
}

impl Session {
    /// Perform the protocol handshake on a freshly opened stream.
    ///
    /// Sends CONNECT (client id, clean-session flag, keepalive, will,
    /// credentials) and awaits CONNACK within the configured deadline. Any
    /// other first packet is a protocol error; a refusal code is surfaced
    /// as [`ConnectError::Refused`].
    pub async fn establish(
        stream: Box<dyn ByteStream>,
        options: &MqttOptions,
    ) -> Result<Session, ConnectError> {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FrameReader {
            stream: read_half,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            max_packet_size: options.max_packet_size,
        };
        let mut writer = FrameWriter {
            stream: write_half,
            buffer: BytesMut::new(),
        };

        let connect = Packet::Connect(Connect {
            client_id: options.client_id.clone(),
            clean_session: options.clean_session,
            keepalive_secs: options.keepalive_secs as u16,
            will: options.will.clone(),
            credentials: options.credentials.clone(),
        });
        writer
            .write_packet(&connect)
            .await
            .map_err(fault_to_connect)?;

        let ack = timeout(options.connect_timeout(), reader.read_packet())
            .await
            .map_err(|_| ConnectError::Timeout)?
            .map_err(fault_to_connect)?;

        match ack {
            Packet::ConnAck(ConnAck {
                session_present,
                return_code: ConnectReturnCode::Accepted,
            }) => {
                debug!(
                    client_id = %options.client_id,
                    session_present,
                    "session established"
                );
                Ok(Session {
                    reader,
                    writer,
                    session_present,
                })
            }
            Packet::ConnAck(ConnAck { return_code, .. }) => {
                Err(ConnectError::Refused(return_code))
            }
            other => Err(ConnectError::Protocol(ProtocolError::UnexpectedPacket(
                other.name(),
            ))),
        }
    }

    pub fn session_present(&self) -> bool {
        self.session_present
    }

    pub(crate) fn split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

fn fault_to_connect(fault: SessionFault) -> ConnectError {
    match fault {
        SessionFault::Io(e) => ConnectError::Io(e),
        SessionFault::Protocol(e) => ConnectError::Protocol(e),
        SessionFault::KeepaliveTimeout => ConnectError::Timeout,
        SessionFault::DeliveryHalted => ConnectError::LinkDown,
    }
}
