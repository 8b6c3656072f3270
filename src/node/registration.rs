// node/registration.rs - Registration Handshake

//! The first exchange on a client connection:
//!
//! ```text
//! AwaitingRegister -> Verified -> (session loop) -> Closed
//! AwaitingRegister -> Rejected -> Closed
//! ```
//!
//! A verified connection leaves this module as [`Registered`] and is served
//! by the session loop until it closes.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::state::{NodeState, ServiceKind, SessionHandle, SessionInsert};
use crate::network::transport::{AcnFramed, TransportError, recv_message, send_message};
use crate::observability::record_registration;
use crate::trust::por;
use crate::wire::{AcnMessage, AgentRecord, Envelope, Status, StatusCode};

/// Per-connection registration state
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationState {
    AwaitingRegister,
    Verified(AgentRecord),
    Rejected(StatusCode),
    Closed,
}

/// A registered connection ready for the session loop
pub struct Registered {
    pub record: AgentRecord,
    pub handle: SessionHandle,
    pub outbound: mpsc::Receiver<Envelope>,
}

/// Check a presented record for the given front end.
///
/// Delegate clients must name this node's key. Relay clients must name the
/// peer key they proved on the stream; `relay_peer_key` is `None` when that
/// proof failed.
pub fn verify_registration(
    record: &AgentRecord,
    kind: ServiceKind,
    node_public_key: &str,
    relay_peer_key: Option<&str>,
) -> Result<(), Status> {
    let expected_peer_key = match (kind, relay_peer_key) {
        (ServiceKind::Delegate, _) => node_public_key,
        (ServiceKind::Relay, Some(proven)) => proven,
        (ServiceKind::Relay, None) => {
            return Err(Status::error(
                StatusCode::ErrorWrongPublicKey,
                format!("relay peer key {} was not proven", record.peer_public_key),
            ));
        }
    };
    por::check(record, &record.address, expected_peer_key)
        .map_err(|e| Status::error(e.status_code(), e.to_string()))
}

/// Run the handshake. On success the session is registered and SUCCESS has
/// been sent; on failure the error status has been sent and the caller
/// closes the connection.
pub async fn register(
    framed: &mut AcnFramed,
    state: &Arc<NodeState>,
    kind: ServiceKind,
    relay_peer_key: Option<&str>,
) -> Result<Registered, RegistrationState> {
    let started = Instant::now();
    let mut current = RegistrationState::AwaitingRegister;

    loop {
        current = match current {
            RegistrationState::AwaitingRegister => {
                match recv_message(framed, state.config.timeouts.registration()).await {
                    Ok(AcnMessage::Register(record)) => {
                        match verify_registration(&record, kind, state.public_key(), relay_peer_key) {
                            Ok(()) => RegistrationState::Verified(record),
                            Err(status) => {
                                warn!(
                                    service = %kind,
                                    address = %record.address,
                                    code = ?status.code,
                                    reason = ?status.msgs,
                                    "Rejected registration"
                                );
                                reject(framed, status).await
                            }
                        }
                    }
                    Ok(other) => {
                        let status = Status::error(
                            StatusCode::ErrorUnexpectedPayload,
                            format!("expected register, got {}", other.kind()),
                        );
                        reject(framed, status).await
                    }
                    Err(TransportError::Codec(e)) => {
                        reject(framed, Status::error(e.status_code(), e.to_string())).await
                    }
                    Err(e) => {
                        debug!(service = %kind, error = %e, "Connection ended before registration");
                        RegistrationState::Closed
                    }
                }
            }
            RegistrationState::Verified(record) => {
                let (handle, outbound) =
                    SessionHandle::new(&record.address, kind, state.config.session_queue);
                match state.sessions.insert(handle.clone()) {
                    SessionInsert::Rejected => {
                        let status = Status::error(
                            StatusCode::ErrorGeneric,
                            format!("{} already has an active session", record.address),
                        );
                        reject(framed, status).await
                    }
                    inserted => {
                        if let SessionInsert::Replaced(previous) = inserted {
                            info!(address = %record.address, previous = %previous.id, "Replaced existing session");
                        }
                        if let Err(e) = state.admit(record.clone()) {
                            state.sessions.remove(&record.address, handle.id);
                            let status = Status::error(StatusCode::ErrorGeneric, e.to_string());
                            reject(framed, status).await
                        } else if let Err(e) = send_message(framed, Status::success().into()).await {
                            debug!(address = %record.address, error = %e, "Client left during registration");
                            state.sessions.remove(&record.address, handle.id);
                            state.release(&record.address);
                            RegistrationState::Closed
                        } else {
                            record_registration(&kind.to_string(), "SUCCESS", started.elapsed());
                            info!(service = %kind, address = %record.address, session = %handle.id, "Agent registered");
                            return Ok(Registered {
                                record,
                                handle,
                                outbound,
                            });
                        }
                    }
                }
            }
            RegistrationState::Rejected(code) => {
                record_registration(&kind.to_string(), code.as_str(), started.elapsed());
                return Err(RegistrationState::Rejected(code));
            }
            RegistrationState::Closed => return Err(RegistrationState::Closed),
        }
    }
}

async fn reject(framed: &mut AcnFramed, status: Status) -> RegistrationState {
    let code = status.code;
    if let Err(e) = send_message(framed, status.into()).await {
        debug!(error = %e, "Could not deliver rejection status");
    }
    RegistrationState::Rejected(code)
}
