// node/router.rs - Envelope Routing

//! Resolution and forwarding of envelopes.
//!
//! A destination is looked up in order: live local session, local record
//! without a session, resolution cache, then the DHT. Remote delivery is a
//! single attempt over a fresh `/aea/0.1.0` stream.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::state::{DeliveryError, NodeState, Resolution};
use crate::network::RoutingTableEntry;
use crate::network::transport::{
    PROTOCOL_ADDRESS, PROTOCOL_ENVELOPE, TransportError, acn_framed, open_stream, request,
};
use crate::observability::{record_dht_lookup, record_route};
use crate::trust::por;
use crate::wire::{AcnMessage, AgentRecord, Envelope, Status, StatusCode};

/// Route an envelope from a local session. Never retries.
pub async fn route(state: &Arc<NodeState>, envelope: Envelope) -> Status {
    let started = Instant::now();
    let status = route_inner(state, envelope).await;
    record_route(status.code.as_str(), started.elapsed());
    status
}

async fn route_inner(state: &Arc<NodeState>, envelope: Envelope) -> Status {
    let target = envelope.to.clone();

    if let Some(status) = deliver_local(state, envelope.clone()) {
        return status;
    }

    let resolution = match resolve_remote(state, &target).await {
        Some(resolution) => resolution,
        None => {
            debug!(to = %target, "No route to agent");
            return Status::error(StatusCode::ErrorUnknownAgentAddress, target);
        }
    };

    let sender_record = state.records.get(&envelope.sender);
    match forward(state, &resolution.provider, &envelope, sender_record).await {
        Ok(status) => {
            if status.code == StatusCode::ErrorUnknownAgentAddress {
                state.invalidate(&target);
            }
            status
        }
        Err(e) => {
            warn!(to = %target, peer = %resolution.provider.peer_id, error = %e, "Forwarding failed");
            state.invalidate(&target);
            Status::error(StatusCode::ErrorGeneric, format!("forwarding to {} failed: {}", target, e))
        }
    }
}

/// Deliver to a session on this node. `None` means the address is not ours.
pub fn deliver_local(state: &NodeState, envelope: Envelope) -> Option<Status> {
    let target = envelope.to.clone();
    if let Some(session) = state.sessions.get(&target) {
        return Some(match session.deliver(envelope) {
            Ok(()) => {
                debug!(to = %target, session = %session.id, "Queued envelope for local session");
                Status::success()
            }
            Err(DeliveryError::Full) => {
                Status::error(StatusCode::ErrorAgentNotReady, format!("{} queue is full", target))
            }
            Err(DeliveryError::Closed) => {
                Status::error(StatusCode::ErrorAgentNotReady, format!("{} is disconnecting", target))
            }
        });
    }
    if state.records.contains(&target) {
        return Some(Status::error(
            StatusCode::ErrorAgentNotReady,
            format!("{} is registered but not connected", target),
        ));
    }
    None
}

/// Find the record for an address, locally or through the DHT
pub async fn resolve(state: &Arc<NodeState>, address: &str) -> Option<AgentRecord> {
    if let Some(record) = state.records.get(address) {
        return Some(record);
    }
    resolve_remote(state, address).await.map(|r| r.record)
}

async fn resolve_remote(state: &Arc<NodeState>, address: &str) -> Option<Resolution> {
    if let Some(cached) = state.cached(address) {
        return Some(cached);
    }

    let started = Instant::now();
    let lookup = tokio::time::timeout(
        state.config.timeouts.lookup(),
        state.dht.find_providers(address),
    )
    .await;
    let outcome = match lookup {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(address, "DHT lookup timed out");
            record_dht_lookup(started.elapsed(), false);
            return None;
        }
    };
    record_dht_lookup(started.elapsed(), !outcome.providers.is_empty());
    debug!(address, providers = outcome.providers.len(), hops = outcome.hops, "DHT lookup finished");

    for provider in outcome.providers {
        match lookup_record(state, &provider, address).await {
            Ok(record) => {
                info!(address, peer = %provider.peer_id, "Resolved agent address");
                let resolution = Resolution { record, provider };
                state.cache(address, resolution.clone());
                return Some(resolution);
            }
            Err(reason) => {
                warn!(address, peer = %provider.peer_id, reason = %reason, "Provider failed lookup");
                state.dht.forget_provider(address, &provider.peer_id);
            }
        }
    }
    None
}

/// Ask a provider for the record of `address` and check it.
///
/// The record must be valid for the address. It names either the provider
/// itself (delegate clients) or a relay client's key.
async fn lookup_record(
    state: &NodeState,
    provider: &RoutingTableEntry,
    address: &str,
) -> Result<AgentRecord, String> {
    let timeout = state.config.timeouts.lookup();
    let mut last_error = String::from("no known address");
    for addr in provider.known_addresses.iter().rev() {
        let exchange = async {
            let stream = open_stream(addr, PROTOCOL_ADDRESS, state.config.timeouts.new_stream()).await?;
            let mut framed = acn_framed(stream);
            let msg = AcnMessage::LookupRequest {
                agent_address: address.to_string(),
            };
            request(&mut framed, msg, timeout).await
        };
        match exchange.await {
            Ok(AcnMessage::LookupResponse(record)) => {
                if record.peer_public_key != provider.public_key {
                    debug!(address, peer = %provider.peer_id, "Record names a relay client key");
                }
                return por::check(&record, address, &record.peer_public_key)
                    .map(|()| record)
                    .map_err(|e| e.to_string());
            }
            Ok(AcnMessage::Status(status)) => return Err(status.to_string()),
            Ok(other) => return Err(format!("unexpected {}", other.kind())),
            Err(e) => last_error = e.to_string(),
        }
    }
    Err(last_error)
}

async fn forward(
    state: &NodeState,
    provider: &RoutingTableEntry,
    envelope: &Envelope,
    sender_record: Option<AgentRecord>,
) -> Result<Status, TransportError> {
    let mut last_error = TransportError::UnsupportedAddress(format!("{} has no address", provider.peer_id));
    for addr in provider.known_addresses.iter().rev() {
        let stream = match open_stream(addr, PROTOCOL_ENVELOPE, state.config.timeouts.new_stream()).await {
            Ok(stream) => stream,
            Err(e) => {
                last_error = e;
                continue;
            }
        };
        let mut framed = acn_framed(stream);
        let msg = AcnMessage::envelope(envelope, sender_record.clone());
        return match request(&mut framed, msg, state.config.timeouts.status()).await? {
            AcnMessage::Status(status) => {
                debug!(to = %envelope.to, peer = %provider.peer_id, status = %status, "Forwarded envelope");
                Ok(status)
            }
            other => Ok(Status::error(
                StatusCode::ErrorUnexpectedPayload,
                format!("peer answered envelope with {}", other.kind()),
            )),
        };
    }
    Err(last_error)
}

/// Check and deliver an envelope arriving from another peer. Only local
/// sessions are considered so forwarded envelopes never loop.
pub fn accept_forwarded(state: &NodeState, envelope: Envelope, record: Option<AgentRecord>) -> Status {
    let Some(record) = record else {
        return Status::error(StatusCode::ErrorInvalidProof, "missing sender record");
    };
    if let Err(e) = por::check(&record, &envelope.sender, &record.peer_public_key) {
        warn!(sender = %envelope.sender, error = %e, "Rejected forwarded envelope");
        return Status::error(e.status_code(), e.to_string());
    }
    let target = envelope.to.clone();
    deliver_local(state, envelope)
        .unwrap_or_else(|| Status::error(StatusCode::ErrorUnknownAgentAddress, target))
}

/// Answer a peer's address lookup from local records only
pub fn answer_lookup(state: &NodeState, address: &str) -> AcnMessage {
    match state.records.get(address) {
        Some(record) => AcnMessage::LookupResponse(record),
        None => Status::error(StatusCode::ErrorUnknownAgentAddress, address).into(),
    }
}
