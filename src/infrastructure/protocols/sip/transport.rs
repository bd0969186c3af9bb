//! SIP transport layer - handles UDP and TCP
//!
//! Transports only move bytes. Incoming messages are parsed and pushed onto a
//! channel that the transaction manager drains; sends report failure as an
//! error the caller turns into a transaction input.

use super::message::{SipError, SipMessage};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
        }
    }

    /// Reliable transports never retransmit and skip the linger wait
    pub fn is_reliable(&self) -> bool {
        matches!(self, TransportProtocol::Tcp)
    }
}

/// Incoming SIP message with source information
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
    pub protocol: TransportProtocol,
}

/// Outgoing SIP message with destination information
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub data: Bytes,
    pub destination: SocketAddr,
}

/// Transport layer trait
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send a message
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError>;

    /// Protocol carried by this transport
    fn protocol(&self) -> TransportProtocol;
}

/// UDP transport implementation
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind a socket and start the receive loop.
    /// Returns the transport and the channel of parsed incoming messages.
    pub async fn bind(
        bind_addr: SocketAddr,
    ) -> Result<(Self, mpsc::Receiver<IncomingMessage>), SipError> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;

        let socket = Arc::new(socket);
        if let Ok(local) = socket.local_addr() {
            info!("UDP transport listening on {}", local);
        }

        let (tx, rx) = mpsc::channel(1000);
        let recv_socket = socket.clone();
        tokio::spawn(async move {
            Self::receive_loop(recv_socket, tx).await;
        });

        Ok((Self { socket }, rx))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SipError> {
        self.socket
            .local_addr()
            .map_err(|e| SipError::TransportError(e.to_string()))
    }

    async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<IncomingMessage>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);

                    match SipMessage::parse(&buf[..size]) {
                        Ok(message) => {
                            let incoming = IncomingMessage {
                                message,
                                source,
                                protocol: TransportProtocol::Udp,
                            };

                            if tx.send(incoming).await.is_err() {
                                debug!("UDP receiver dropped, stopping receive loop");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse SIP message from {}: {}", source, e);
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to receive UDP packet: {}", e);
                    break;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        debug!(
            "Sending {} bytes to {} via UDP",
            message.data.len(),
            message.destination
        );

        self.socket
            .send_to(&message.data, message.destination)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;

        Ok(())
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }
}

/// Largest header section accepted on a stream before giving up on it
const MAX_HEADER_LEN: usize = 65535;

/// Split the next complete message off the front of a stream buffer.
///
/// Leading CRLFs (keep-alives) are skipped. Returns `Ok(None)` until the
/// headers and `Content-Length` bytes of body have all arrived.
fn next_frame(buf: &mut BytesMut) -> Result<Option<Bytes>, SipError> {
    let skip = buf.iter().take_while(|b| matches!(b, b'\r' | b'\n')).count();
    buf.advance(skip);

    let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        if buf.len() > MAX_HEADER_LEN {
            return Err(SipError::ParseError("Header section too long".to_string()));
        }
        return Ok(None);
    };
    let head_len = end + 4;

    let head = String::from_utf8_lossy(&buf[..end]);
    let mut body_len = 0;
    for line in head.split("\r\n").skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("l") {
            body_len = value.trim().parse::<usize>().map_err(|_| {
                SipError::ParseError(format!("Invalid Content-Length: {}", value.trim()))
            })?;
        }
    }

    if buf.len() < head_len + body_len {
        return Ok(None);
    }
    Ok(Some(buf.split_to(head_len + body_len).freeze()))
}

/// TCP transport implementation.
///
/// Keeps one outbound connection per destination; responses arrive on the
/// same connection and are fed into the incoming channel.
pub struct TcpTransport {
    connections: Mutex<HashMap<SocketAddr, Arc<Mutex<OwnedWriteHalf>>>>,
    tx: mpsc::Sender<IncomingMessage>,
}

impl TcpTransport {
    pub fn new() -> (Self, mpsc::Receiver<IncomingMessage>) {
        let (tx, rx) = mpsc::channel(1000);
        let transport = Self {
            connections: Mutex::new(HashMap::new()),
            tx,
        };
        (transport, rx)
    }

    async fn read_loop(
        mut reader: tokio::net::tcp::OwnedReadHalf,
        source: SocketAddr,
        tx: mpsc::Sender<IncomingMessage>,
    ) {
        let mut buf = BytesMut::with_capacity(8192);

        'read: loop {
            match reader.read_buf(&mut buf).await {
                Ok(0) => {
                    debug!("TCP connection closed by {}", source);
                    break;
                }
                Ok(size) => {
                    debug!("Received {} bytes from {} via TCP", size, source);

                    loop {
                        let frame = match next_frame(&mut buf) {
                            Ok(Some(frame)) => frame,
                            Ok(None) => break,
                            Err(e) => {
                                // Framing is lost, nothing after this can be trusted
                                error!("Closing TCP stream from {}: {}", source, e);
                                break 'read;
                            }
                        };

                        match SipMessage::parse(&frame) {
                            Ok(message) => {
                                let incoming = IncomingMessage {
                                    message,
                                    source,
                                    protocol: TransportProtocol::Tcp,
                                };

                                if tx.send(incoming).await.is_err() {
                                    break 'read;
                                }
                            }
                            Err(e) => {
                                warn!("Failed to parse SIP message from {}: {}", source, e);
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to read from TCP connection: {}", e);
                    break;
                }
            }
        }
    }

    /// Writer for `destination`, connecting first if needed.
    /// The connection map is not held across the connect.
    async fn connection(
        &self,
        destination: SocketAddr,
    ) -> Result<Arc<Mutex<OwnedWriteHalf>>, SipError> {
        if let Some(writer) = self.connections.lock().await.get(&destination) {
            return Ok(writer.clone());
        }

        let stream = TcpStream::connect(destination).await.map_err(|e| {
            SipError::TransportError(format!("Failed to connect to {}: {}", destination, e))
        })?;

        let mut connections = self.connections.lock().await;
        if let Some(writer) = connections.get(&destination) {
            // Another send connected first; ours is dropped
            return Ok(writer.clone());
        }
        info!("Opened TCP connection to {}", destination);

        let (reader, writer) = stream.into_split();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            Self::read_loop(reader, destination, tx).await;
        });

        let writer = Arc::new(Mutex::new(writer));
        connections.insert(destination, writer.clone());
        Ok(writer)
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, message: OutgoingMessage) -> Result<(), SipError> {
        debug!(
            "Sending {} bytes to {} via TCP",
            message.data.len(),
            message.destination
        );

        let connection = self.connection(message.destination).await?;

        let result = {
            let mut writer = connection.lock().await;
            match writer.write_all(&message.data).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };

        if let Err(e) = result {
            // Drop the broken connection so the next send reconnects
            let mut connections = self.connections.lock().await;
            if connections
                .get(&message.destination)
                .is_some_and(|current| Arc::ptr_eq(current, &connection))
            {
                connections.remove(&message.destination);
            }
            return Err(SipError::TransportError(format!(
                "Failed to send TCP data: {}",
                e
            )));
        }

        Ok(())
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Tcp
    }
}
