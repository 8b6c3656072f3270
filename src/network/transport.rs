// network/transport.rs - Stream Transports

//! Ordered, reliable byte streams that carry ACN frames.
//!
//! Clients reach a node through a [`Connector`]: plain TCP for the delegate
//! service, TCP plus a protocol header for the relay service, a Unix socket or
//! an in-memory pipe. Peer-to-peer streams are TCP connections whose first
//! frame names the protocol spoken on the rest of the stream.
//!
//! A relay stream then proves the client's peer key before any ACN frame:
//!
//! ```text
//! node   -> client : nonce (32 bytes)
//! client -> node   : peer public key
//! client -> node   : signature over "/aea-register/0.1.0" || nonce
//! ```

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use libp2p::{Multiaddr, PeerId, multiaddr::Protocol};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::trust::{PeerKeypair, verify_peer_signature};
use crate::wire::{AcnCodec, AcnMessage, CodecError};

/// Envelope forwarding between peers
pub const PROTOCOL_ENVELOPE: &str = "/aea/0.1.0";

/// Agent address lookup between peers
pub const PROTOCOL_ADDRESS: &str = "/aea-address/0.1.0";

/// Relay client registration
pub const PROTOCOL_REGISTER: &str = "/aea-register/0.1.0";

/// DHT routing RPC
pub const PROTOCOL_DHT: &str = "/acn-kad/0.1.0";

const MAX_PROTOCOL_ID_LEN: usize = 256;

/// Nonce a node sends to a relay client
pub const RELAY_NONCE_LEN: usize = 32;

/// Errors raised by stream transports
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Unsupported address: {0}")]
    UnsupportedAddress(String),

    #[error("Invalid protocol header: {0}")]
    InvalidProtocol(String),

    #[error("Stream closed by remote")]
    Closed,
}

/// Any bidirectional byte stream an ACN session can run over
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn ByteStream>;

/// A byte stream framed with the ACN codec
pub type AcnFramed = Framed<BoxedStream, AcnCodec>;

pub fn acn_framed(stream: BoxedStream) -> AcnFramed {
    Framed::new(stream, AcnCodec::new())
}

/// Opens a fresh stream to a peer node for each call
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<BoxedStream, TransportError>;

    /// Human-readable target for logs
    fn describe(&self) -> String;
}

/// Plain TCP, used for the delegate service
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<BoxedStream, TransportError> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| TransportError::Timeout(format!("connect to {}", self.addr)))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// TCP to a node's peer port, announcing the relay registration protocol
/// and proving possession of `peer`
#[derive(Debug, Clone)]
pub struct RelayConnector {
    addr: Multiaddr,
    peer: PeerKeypair,
    timeout: Duration,
}

impl RelayConnector {
    pub fn new(addr: Multiaddr, peer: PeerKeypair) -> Self {
        Self {
            addr,
            peer,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for RelayConnector {
    async fn connect(&self) -> Result<BoxedStream, TransportError> {
        let mut stream = open_stream(&self.addr, PROTOCOL_REGISTER, self.timeout).await?;
        tokio::time::timeout(self.timeout, answer_relay_challenge(&mut stream, &self.peer))
            .await
            .map_err(|_| TransportError::Timeout(format!("relay challenge from {}", self.addr)))??;
        Ok(stream)
    }

    fn describe(&self) -> String {
        format!("relay {}", self.addr)
    }
}

/// Unix domain socket, the local pipe to a co-located node
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct UnixConnector {
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl UnixConnector {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[cfg(unix)]
#[async_trait]
impl Connector for UnixConnector {
    async fn connect(&self) -> Result<BoxedStream, TransportError> {
        let stream = tokio::net::UnixStream::connect(&self.path).await?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("unix://{}", self.path.display())
    }
}

/// In-memory pipes; each `connect` hands the far end to a [`MemoryListener`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    incoming: mpsc::UnboundedSender<DuplexStream>,
    buffer: usize,
}

/// Accepting side of a [`MemoryConnector`]
#[derive(Debug)]
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<DuplexStream>,
}

impl MemoryConnector {
    pub fn pair() -> (MemoryConnector, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MemoryConnector {
                incoming: tx,
                buffer: 64 * 1024,
            },
            MemoryListener { incoming: rx },
        )
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<BoxedStream, TransportError> {
        let (local, remote) = tokio::io::duplex(self.buffer);
        self.incoming
            .send(remote)
            .map_err(|_| TransportError::Io(std::io::ErrorKind::ConnectionRefused.into()))?;
        Ok(Box::new(local))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

impl MemoryListener {
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.incoming.recv().await
    }
}

/// Write one small length-prefixed frame straight to the stream
async fn write_short_frame<S>(stream: &mut S, bytes: &[u8]) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    if bytes.is_empty() || bytes.len() > MAX_PROTOCOL_ID_LEN {
        return Err(TransportError::InvalidProtocol(format!("frame of {} bytes", bytes.len())));
    }
    stream.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one small frame without buffering past it
async fn read_short_frame<S>(stream: &mut S) -> Result<Vec<u8>, TransportError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len == 0 || len > MAX_PROTOCOL_ID_LEN {
        return Err(TransportError::InvalidProtocol(format!("length {}", len)));
    }
    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes).await?;
    Ok(bytes)
}

async fn read_short_string<S>(stream: &mut S) -> Result<String, TransportError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    String::from_utf8(read_short_frame(stream).await?)
        .map_err(|e| TransportError::InvalidProtocol(e.to_string()))
}

/// Write the protocol id frame that opens a peer stream
pub async fn write_protocol_header<S>(stream: &mut S, protocol: &str) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    write_short_frame(stream, protocol.as_bytes()).await
}

/// Read the protocol id frame without buffering past it
pub async fn read_protocol_header<S>(stream: &mut S) -> Result<String, TransportError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    read_short_string(stream).await
}

fn relay_challenge_message(nonce: &[u8]) -> Vec<u8> {
    let mut message = PROTOCOL_REGISTER.as_bytes().to_vec();
    message.extend_from_slice(nonce);
    message
}

/// Node side of the relay handshake. Returns the proven peer key, or `None`
/// when the answer does not verify.
pub async fn challenge_relay_client<S>(stream: &mut S) -> Result<Option<String>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let nonce: [u8; RELAY_NONCE_LEN] = rand::random();
    write_short_frame(stream, &nonce).await?;
    let public_key = read_short_string(stream).await?;
    let signature = read_short_string(stream).await?;
    if verify_peer_signature(&public_key, &relay_challenge_message(&nonce), &signature) {
        Ok(Some(public_key))
    } else {
        debug!(public_key = %public_key, "Relay client failed the key challenge");
        Ok(None)
    }
}

/// Client side of the relay handshake
pub async fn answer_relay_challenge<S>(stream: &mut S, peer: &PeerKeypair) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let nonce = read_short_frame(stream).await?;
    if nonce.len() != RELAY_NONCE_LEN {
        return Err(TransportError::InvalidProtocol(format!("nonce of {} bytes", nonce.len())));
    }
    write_short_frame(stream, peer.public_key().as_bytes()).await?;
    write_short_frame(stream, peer.sign(&relay_challenge_message(&nonce)).as_bytes()).await
}

/// Resolve a `/ip4|ip6|dns|dns4|dns6/<host>/tcp/<port>[/p2p/<id>]` address
pub fn dial_target(addr: &Multiaddr) -> Result<(String, u16), TransportError> {
    let mut host = None;
    let mut port = None;
    for proto in addr.iter() {
        match proto {
            Protocol::Ip4(ip) => host = Some(ip.to_string()),
            Protocol::Ip6(ip) => host = Some(ip.to_string()),
            Protocol::Dns(name) | Protocol::Dns4(name) | Protocol::Dns6(name) => {
                host = Some(name.to_string())
            }
            Protocol::Tcp(p) => port = Some(p),
            Protocol::P2p(_) => {}
            other => {
                return Err(TransportError::UnsupportedAddress(format!(
                    "{} (protocol {})",
                    addr, other
                )));
            }
        }
    }
    match (host, port) {
        (Some(host), Some(port)) => Ok((host, port)),
        _ => Err(TransportError::UnsupportedAddress(addr.to_string())),
    }
}

/// Split the trailing `/p2p/<id>` component off a multiaddr
pub fn split_peer_id(addr: &Multiaddr) -> (Multiaddr, Option<PeerId>) {
    let mut base = Multiaddr::empty();
    let mut peer_id = None;
    for proto in addr.iter() {
        match proto {
            Protocol::P2p(id) => peer_id = Some(id),
            other => base.push(other),
        }
    }
    (base, peer_id)
}

pub fn socket_multiaddr(addr: SocketAddr) -> Multiaddr {
    Multiaddr::empty()
        .with(Protocol::from(addr.ip()))
        .with(Protocol::Tcp(addr.port()))
}

/// Open a peer stream speaking `protocol`
pub async fn open_stream(
    addr: &Multiaddr,
    protocol: &str,
    timeout: Duration,
) -> Result<BoxedStream, TransportError> {
    let (host, port) = dial_target(addr)?;
    let connect = async {
        let mut stream = TcpStream::connect((host.as_str(), port)).await?;
        stream.set_nodelay(true)?;
        write_protocol_header(&mut stream, protocol).await?;
        Ok::<_, TransportError>(stream)
    };
    let stream = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| TransportError::Timeout(format!("open {} to {}", protocol, addr)))??;
    debug!(addr = %addr, protocol, "Opened peer stream");
    Ok(Box::new(stream))
}

pub async fn send_message(framed: &mut AcnFramed, msg: AcnMessage) -> Result<(), TransportError> {
    framed.send(msg).await?;
    Ok(())
}

/// Wait for the next message, treating a clean close as an error
pub async fn recv_message(framed: &mut AcnFramed, timeout: Duration) -> Result<AcnMessage, TransportError> {
    match tokio::time::timeout(timeout, framed.next()).await {
        Err(_) => Err(TransportError::Timeout("waiting for message".to_string())),
        Ok(None) => Err(TransportError::Closed),
        Ok(Some(result)) => Ok(result?),
    }
}

/// Send one message and wait for the reply
pub async fn request(
    framed: &mut AcnFramed,
    msg: AcnMessage,
    timeout: Duration,
) -> Result<AcnMessage, TransportError> {
    send_message(framed, msg).await?;
    recv_message(framed, timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Status;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_protocol_header_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_protocol_header(&mut a, PROTOCOL_ENVELOPE).await.unwrap();
        a.write_all(b"rest").await.unwrap();

        assert_eq!(read_protocol_header(&mut b).await.unwrap(), PROTOCOL_ENVELOPE);
        let mut rest = [0u8; 4];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"rest");
    }

    #[tokio::test]
    async fn test_protocol_header_rejects_oversize() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&10_000u32.to_be_bytes()).await.unwrap();
        assert!(matches!(
            read_protocol_header(&mut b).await,
            Err(TransportError::InvalidProtocol(_))
        ));
    }

    #[tokio::test]
    async fn test_relay_challenge_proves_peer_key() {
        let (mut node, mut client) = tokio::io::duplex(1024);
        let peer = PeerKeypair::generate();
        let answer = tokio::spawn({
            let peer = peer.clone();
            async move { answer_relay_challenge(&mut client, &peer).await }
        });

        let proven = challenge_relay_client(&mut node).await.unwrap();
        answer.await.unwrap().unwrap();
        assert_eq!(proven.as_deref(), Some(peer.public_key()));
    }

    #[tokio::test]
    async fn test_relay_challenge_rejects_borrowed_key() {
        let (mut node, mut client) = tokio::io::duplex(1024);
        let victim = PeerKeypair::generate();
        let attacker = PeerKeypair::generate();
        let answer = tokio::spawn(async move {
            let nonce = read_short_frame(&mut client).await.unwrap();
            write_short_frame(&mut client, victim.public_key().as_bytes()).await.unwrap();
            let signature = attacker.sign(&relay_challenge_message(&nonce));
            write_short_frame(&mut client, signature.as_bytes()).await.unwrap();
        });

        assert_eq!(challenge_relay_client(&mut node).await.unwrap(), None);
        answer.await.unwrap();
    }

    #[test]
    fn test_dial_target() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/9000".parse().unwrap();
        assert_eq!(dial_target(&addr).unwrap(), ("127.0.0.1".to_string(), 9000));

        let addr: Multiaddr = "/dns4/acn.example.com/tcp/9001".parse().unwrap();
        assert_eq!(dial_target(&addr).unwrap(), ("acn.example.com".to_string(), 9001));

        let addr: Multiaddr = "/ip4/127.0.0.1/udp/9000/quic-v1".parse().unwrap();
        assert!(dial_target(&addr).is_err());
    }

    #[test]
    fn test_split_peer_id() {
        let peer = crate::trust::PeerKeypair::generate().peer_id();
        let addr: Multiaddr = format!("/ip4/10.0.0.1/tcp/9000/p2p/{}", peer).parse().unwrap();
        let (base, id) = split_peer_id(&addr);
        assert_eq!(base.to_string(), "/ip4/10.0.0.1/tcp/9000");
        assert_eq!(id, Some(peer));
    }

    #[tokio::test]
    async fn test_memory_connector_pair() {
        let (connector, mut listener) = MemoryConnector::pair();
        let client = connector.connect().await.unwrap();
        let server = listener.accept().await.unwrap();

        let mut client = acn_framed(client);
        let mut server = acn_framed(Box::new(server));
        send_message(&mut client, AcnMessage::Status(Status::success())).await.unwrap();
        let msg = recv_message(&mut server, Duration::from_secs(1)).await.unwrap();
        assert_eq!(msg, AcnMessage::Status(Status::success()));
    }

    #[tokio::test]
    async fn test_open_stream_announces_protocol() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = socket_multiaddr(listener.local_addr().unwrap());

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_protocol_header(&mut stream).await.unwrap()
        });
        let _stream = open_stream(&addr, PROTOCOL_DHT, Duration::from_secs(2)).await.unwrap();
        assert_eq!(accept.await.unwrap(), PROTOCOL_DHT);
    }

    #[tokio::test]
    async fn test_recv_reports_close() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut framed = acn_framed(Box::new(b));
        assert!(matches!(
            recv_message(&mut framed, Duration::from_secs(1)).await,
            Err(TransportError::Closed)
        ));
    }
}
