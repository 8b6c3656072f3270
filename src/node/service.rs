// node/service.rs - Delegate and Peer Listeners

use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::registration::register;
use super::router;
use super::session;
use super::state::{NodeState, ServiceKind};
use crate::network::transport::{
    BoxedStream, PROTOCOL_ADDRESS, PROTOCOL_DHT, PROTOCOL_ENVELOPE, PROTOCOL_REGISTER,
    TransportError, acn_framed, challenge_relay_client, read_protocol_header, recv_message,
    send_message,
};
use crate::wire::{AcnMessage, Envelope, Status, StatusCode};

/// Register a client on `stream` and serve it until it leaves
pub async fn handle_client(
    stream: BoxedStream,
    state: Arc<NodeState>,
    kind: ServiceKind,
    relay_peer_key: Option<String>,
) {
    let mut framed = acn_framed(stream);
    match register(&mut framed, &state, kind, relay_peer_key.as_deref()).await {
        Ok(registered) => session::serve(framed, state, registered).await,
        Err(outcome) => debug!(service = %kind, outcome = ?outcome, "Registration ended without a session"),
    }
}

/// Accept delegate clients over TCP
pub async fn serve_delegate(listener: TcpListener, state: Arc<NodeState>) {
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    debug!(remote = %remote, "Delegate client connected");
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(handle_client(Box::new(stream), state.clone(), ServiceKind::Delegate, None));
                }
                Err(e) => {
                    error!(error = %e, "Delegate accept failed");
                    break;
                }
            },
        }
    }
    info!("Delegate service stopped");
}

/// Accept delegate clients on a local Unix socket
#[cfg(unix)]
pub async fn serve_delegate_socket(listener: tokio::net::UnixListener, state: Arc<NodeState>) {
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(handle_client(Box::new(stream), state.clone(), ServiceKind::Delegate, None));
                }
                Err(e) => {
                    error!(error = %e, "Local socket accept failed");
                    break;
                }
            },
        }
    }
}

/// Accept peer streams and dispatch on their protocol header
pub async fn serve_peers(listener: TcpListener, state: Arc<NodeState>) {
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let _ = stream.set_nodelay(true);
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = dispatch_peer(Box::new(stream), state).await {
                            debug!(remote = %remote, error = %e, "Peer stream failed");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Peer accept failed");
                    break;
                }
            },
        }
    }
    info!("Peer service stopped");
}

async fn dispatch_peer(mut stream: BoxedStream, state: Arc<NodeState>) -> Result<(), TransportError> {
    let header = tokio::time::timeout(
        state.config.timeouts.new_stream(),
        read_protocol_header(&mut stream),
    )
    .await
    .map_err(|_| TransportError::Timeout("protocol header".into()))??;

    match header.as_str() {
        PROTOCOL_DHT => state
            .dht
            .serve_stream(stream)
            .await
            .map_err(|e| TransportError::InvalidProtocol(e.to_string())),
        PROTOCOL_ENVELOPE => handle_forwarded(stream, &state).await,
        PROTOCOL_ADDRESS => handle_lookup(stream, &state).await,
        PROTOCOL_REGISTER if state.config.enable_relay => {
            let proven = tokio::time::timeout(
                state.config.timeouts.new_stream(),
                challenge_relay_client(&mut stream),
            )
            .await
            .map_err(|_| TransportError::Timeout("relay key challenge".into()))??;
            handle_client(stream, state, ServiceKind::Relay, proven).await;
            Ok(())
        }
        other => {
            warn!(protocol = other, "Unsupported peer protocol");
            Err(TransportError::InvalidProtocol(other.to_string()))
        }
    }
}

async fn handle_forwarded(stream: BoxedStream, state: &NodeState) -> Result<(), TransportError> {
    let mut framed = acn_framed(stream);
    let status = match recv_message(&mut framed, state.config.timeouts.status()).await {
        Ok(AcnMessage::EnvelopePayload { envelope, record }) => match Envelope::from_bytes(&envelope) {
            Ok(envelope) => router::accept_forwarded(state, envelope, record),
            Err(e) => Status::error(StatusCode::ErrorDecode, e.to_string()),
        },
        Ok(other) => Status::error(
            StatusCode::ErrorUnexpectedPayload,
            format!("expected envelope, got {}", other.kind()),
        ),
        Err(TransportError::Codec(e)) => Status::error(e.status_code(), e.to_string()),
        Err(e) => return Err(e),
    };
    send_message(&mut framed, status.into()).await
}

async fn handle_lookup(stream: BoxedStream, state: &NodeState) -> Result<(), TransportError> {
    let mut framed = acn_framed(stream);
    let reply = match recv_message(&mut framed, state.config.timeouts.status()).await {
        Ok(AcnMessage::LookupRequest { agent_address }) => router::answer_lookup(state, &agent_address),
        Ok(other) => Status::error(
            StatusCode::ErrorUnexpectedPayload,
            format!("expected lookup request, got {}", other.kind()),
        )
        .into(),
        Err(TransportError::Codec(e)) => Status::error(e.status_code(), e.to_string()).into(),
        Err(e) => return Err(e),
    };
    send_message(&mut framed, reply).await
}
