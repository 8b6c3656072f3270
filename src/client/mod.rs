// client/mod.rs - ACN Client Session

//! Agent-side session with one peer node.
//!
//! [`ClientSession::connect`] registers the agent record, retrying with
//! backoff. Once connected a background reader decodes frames: status
//! frames complete the in-flight [`ClientSession::send`], envelopes land in
//! the inbound queue and are acknowledged. Sends are serialized, so each
//! status correlates with exactly one envelope.

pub mod config;
pub mod retry;

pub use config::ClientConfig;
pub use retry::{Backoff, Clock, RetryPolicy, TokioClock};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::network::transport::{recv_message, send_message};
use crate::network::{AcnFramed, Connector, TransportError, acn_framed};
use crate::trust::{LedgerSigner, por};
use crate::wire::codec;
use crate::wire::{AcnMessage, AgentRecord, Envelope, MAX_FRAME_LEN, Status, StatusCode};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors surfaced to the owner of a client session
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Registration rejected: {0}")]
    Rejected(Status),

    #[error("Registration failed after {attempts} attempts: {last}")]
    RegistrationFailed { attempts: u32, last: Box<ClientError> },

    #[error("Peer answered with {0}")]
    Status(Status),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid agent record: {0}")]
    InvalidRecord(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Envelope of {len} bytes exceeds the {max} byte frame limit")]
    TooLarge { len: usize, max: usize },

    #[error("Not connected")]
    NotConnected,

    #[error("Session closed")]
    Disconnected,
}

impl ClientError {
    /// Errors that retrying with the same record cannot fix
    pub fn is_unrecoverable(&self) -> bool {
        match self {
            ClientError::Rejected(status) => status.code.is_authentication_error(),
            ClientError::InvalidRecord(_) | ClientError::Config(_) => true,
            _ => false,
        }
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            ClientError::Rejected(status) | ClientError::Status(status) => Some(status.code),
            ClientError::RegistrationFailed { last, .. } => last.status_code(),
            _ => None,
        }
    }
}

#[derive(Default)]
struct AckState {
    waiting: Option<oneshot::Sender<Status>>,
    /// Statuses still owed for sends that already timed out
    late: usize,
}

struct Connection {
    sink: tokio::sync::Mutex<SplitSink<AcnFramed, AcnMessage>>,
    acks: Mutex<AckState>,
    cancel: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    async fn write(&self, msg: AcnMessage) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        sink.send(msg).await?;
        Ok(())
    }

    fn close(&self) {
        self.cancel.cancel();
        self.acks.lock().waiting.take();
    }
}

enum AckOutcome {
    Status(Status),
    TimedOut,
    Closed,
}

/// One agent's registration with one peer node
pub struct ClientSession {
    record: AgentRecord,
    connector: Arc<dyn Connector>,
    config: ClientConfig,
    clock: Arc<dyn Clock>,
    connection: Mutex<Option<Arc<Connection>>>,
    send_lock: tokio::sync::Mutex<()>,
    inbound_tx: mpsc::Sender<Envelope>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Envelope>>,
}

impl ClientSession {
    pub fn new(record: AgentRecord, connector: impl Connector + 'static, config: ClientConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        Self {
            record,
            connector: Arc::new(connector),
            config,
            clock: Arc::new(TokioClock),
            connection: Mutex::new(None),
            send_lock: tokio::sync::Mutex::new(()),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        }
    }

    /// Sign `peer_public_key` with the agent's key and build the session
    pub fn from_signer(
        signer: &dyn LedgerSigner,
        peer_public_key: &str,
        connector: impl Connector + 'static,
        config: ClientConfig,
    ) -> Self {
        Self::new(AgentRecord::issue(signer, peer_public_key), connector, config)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn address(&self) -> &str {
        &self.record.address
    }

    pub fn record(&self) -> &AgentRecord {
        &self.record
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|c| !c.cancel.is_cancelled())
    }

    /// Register with the node, retrying recoverable failures with backoff.
    /// Each attempt opens a fresh stream.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.config.validate().map_err(ClientError::Config)?;
        por::check_record(&self.record).map_err(|e| ClientError::InvalidRecord(e.to_string()))?;
        if self.is_connected() {
            return Ok(());
        }
        self.disconnect().await;

        let mut backoff = Backoff::new(self.config.retry.clone());
        let framed = loop {
            match self.register_once().await {
                Ok(framed) => break framed,
                Err(e) if e.is_unrecoverable() => {
                    warn!(address = %self.record.address, error = %e, "Registration rejected");
                    return Err(e);
                }
                Err(e) => match backoff.fail(self.clock.now()) {
                    Some(delay) => {
                        warn!(
                            address = %self.record.address,
                            attempt = backoff.attempts(),
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Registration attempt failed"
                        );
                        self.clock.sleep(delay).await;
                    }
                    None => {
                        return Err(ClientError::RegistrationFailed {
                            attempts: backoff.attempts(),
                            last: Box::new(e),
                        });
                    }
                },
            }
        };

        let (sink, stream) = framed.split();
        let connection = Arc::new(Connection {
            sink: tokio::sync::Mutex::new(sink),
            acks: Mutex::new(AckState::default()),
            cancel: CancellationToken::new(),
            reader: Mutex::new(None),
        });
        let reader = tokio::spawn(read_loop(
            connection.clone(),
            stream,
            self.record.address.clone(),
            self.inbound_tx.clone(),
        ));
        *connection.reader.lock() = Some(reader);
        *self.connection.lock() = Some(connection);

        info!(address = %self.record.address, node = %self.connector.describe(), "Registered with peer node");
        Ok(())
    }

    async fn register_once(&self) -> Result<AcnFramed, ClientError> {
        let stream = self.connector.connect().await?;
        let mut framed = acn_framed(stream);
        send_message(&mut framed, AcnMessage::Register(self.record.clone())).await?;
        match recv_message(&mut framed, self.config.registration_timeout()).await {
            Ok(AcnMessage::Status(status)) if status.is_success() => Ok(framed),
            Ok(AcnMessage::Status(status)) => Err(ClientError::Rejected(status)),
            Ok(other) => Err(ClientError::Protocol(format!(
                "expected status, got {}",
                other.kind()
            ))),
            Err(TransportError::Timeout(_)) => Err(ClientError::Timeout("registration status")),
            Err(e) => Err(e.into()),
        }
    }

    fn current(&self) -> Result<Arc<Connection>, ClientError> {
        match self.connection.lock().as_ref() {
            None => Err(ClientError::NotConnected),
            Some(c) if c.cancel.is_cancelled() => Err(ClientError::Disconnected),
            Some(c) => Ok(c.clone()),
        }
    }

    /// Send one envelope and wait for its acknowledgement. Failures are
    /// returned, never retried.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), ClientError> {
        let msg = AcnMessage::envelope(envelope, None);
        let len = codec::payload_len(&msg);
        if len > MAX_FRAME_LEN {
            return Err(ClientError::TooLarge { len, max: MAX_FRAME_LEN });
        }

        let _serialized = self.send_lock.lock().await;
        let connection = self.current()?;

        let (tx, mut rx) = oneshot::channel();
        connection.acks.lock().waiting = Some(tx);
        if let Err(e) = connection.write(msg).await {
            connection.close();
            return Err(e.into());
        }

        let outcome = tokio::select! {
            biased;
            status = &mut rx => match status {
                Ok(status) => AckOutcome::Status(status),
                Err(_) => AckOutcome::Closed,
            },
            _ = connection.cancel.cancelled() => match rx.try_recv() {
                Ok(status) => AckOutcome::Status(status),
                Err(_) => AckOutcome::Closed,
            },
            _ = tokio::time::sleep(self.config.ack_timeout()) => AckOutcome::TimedOut,
        };

        match outcome {
            AckOutcome::Status(status) if status.is_success() => Ok(()),
            AckOutcome::Status(status) => {
                debug!(to = %envelope.to, status = %status, "Envelope refused");
                Err(ClientError::Status(status))
            }
            AckOutcome::TimedOut => {
                let mut acks = connection.acks.lock();
                if acks.waiting.take().is_some() {
                    acks.late += 1;
                }
                Err(ClientError::Timeout("envelope acknowledgement"))
            }
            AckOutcome::Closed => Err(ClientError::Disconnected),
        }
    }

    /// Next received envelope, if one arrives within `timeout`
    pub async fn receive(&self, timeout: Duration) -> Option<Envelope> {
        let cancel = self.connection.lock().as_ref().map(|c| c.cancel.clone());
        let mut inbound = self.inbound_rx.lock().await;
        if let Ok(envelope) = inbound.try_recv() {
            return Some(envelope);
        }
        let cancel = cancel?;
        tokio::select! {
            biased;
            envelope = inbound.recv() => envelope,
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep(timeout) => None,
        }
    }

    /// Received envelope, without waiting
    pub fn try_receive(&self) -> Option<Envelope> {
        self.inbound_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Close the transport and clear queues. Idempotent; pending sends fail
    /// with [`ClientError::Disconnected`].
    pub async fn disconnect(&self) {
        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            connection.close();
            let close = async {
                let mut sink = connection.sink.lock().await;
                let _ = sink.close().await;
            };
            if tokio::time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
                debug!(address = %self.record.address, "Transport close timed out");
            }
            let reader = connection.reader.lock().take();
            if let Some(mut reader) = reader {
                if tokio::time::timeout(CLOSE_TIMEOUT, &mut reader).await.is_err() {
                    reader.abort();
                }
            }
            info!(address = %self.record.address, "Disconnected from peer node");
        }

        let mut inbound = self.inbound_rx.lock().await;
        while inbound.try_recv().is_ok() {}
    }
}

async fn read_loop(
    connection: Arc<Connection>,
    mut stream: SplitStream<AcnFramed>,
    address: String,
    inbound: mpsc::Sender<Envelope>,
) {
    loop {
        let frame = tokio::select! {
            _ = connection.cancel.cancelled() => break,
            frame = stream.next() => frame,
        };
        let msg = match frame {
            None => {
                debug!(address = %address, "Peer node closed the stream");
                break;
            }
            Some(Err(e)) => {
                warn!(address = %address, error = %e, "Undecodable frame from peer node");
                break;
            }
            Some(Ok(msg)) => msg,
        };

        match msg {
            AcnMessage::Status(status) => {
                let mut acks = connection.acks.lock();
                if acks.late > 0 {
                    acks.late -= 1;
                    debug!(address = %address, status = %status, "Dropped late acknowledgement");
                    continue;
                }
                match acks.waiting.take() {
                    Some(waiter) => {
                        let _ = waiter.send(status);
                    }
                    None => {
                        warn!(address = %address, status = %status, "Unsolicited status from peer node");
                        break;
                    }
                }
            }
            AcnMessage::EnvelopePayload { envelope, .. } => {
                let envelope = match Envelope::from_bytes(&envelope) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(address = %address, error = %e, "Malformed envelope from peer node");
                        break;
                    }
                };
                let reply = if envelope.to != address {
                    warn!(address = %address, to = %envelope.to, "Dropped envelope for another address");
                    Status::error(
                        StatusCode::ErrorWrongAgentAddress,
                        format!("{} is not {}", envelope.to, address),
                    )
                } else {
                    match inbound.try_send(envelope) {
                        Ok(()) => Status::success(),
                        Err(mpsc::error::TrySendError::Full(dropped)) => {
                            warn!(address = %address, sender = %dropped.sender, "Inbound queue full");
                            Status::error(StatusCode::ErrorAgentNotReady, "inbound queue full")
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                };
                if connection.write(reply.into()).await.is_err() {
                    break;
                }
            }
            other => {
                warn!(address = %address, kind = other.kind(), "Unexpected message from peer node");
                break;
            }
        }
    }
    connection.close();
}
