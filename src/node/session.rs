// node/session.rs - Serving Session Loop

use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::FuturesOrdered;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::registration::Registered;
use super::router;
use super::state::NodeState;
use crate::network::AcnFramed;
use crate::observability::record_client_connected;
use crate::wire::{AcnMessage, Envelope, Status, StatusCode};

/// Serve a registered client until it disconnects, is replaced, sends a
/// protocol error, or the node shuts down.
///
/// Routing runs on separate tasks so a slow forward never stalls reads.
/// Replies are written in the order their requests arrived.
pub async fn serve(mut framed: AcnFramed, state: Arc<NodeState>, registered: Registered) {
    let Registered {
        record,
        handle,
        mut outbound,
    } = registered;
    let address = record.address.clone();
    let kind_label = handle.kind.to_string();
    let cancel = handle.cancelled();
    let mut replies = Replies::new();
    record_client_connected(&kind_label, 1.0);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(address = %address, "Session closed by node");
                break;
            }
            _ = state.shutdown.cancelled() => break,
            Some(reply) = replies.next(), if !replies.is_empty() => {
                if let Err(e) = framed.send(reply).await {
                    debug!(address = %address, error = %e, "Failed to write reply");
                    break;
                }
            }
            Some(envelope) = outbound.recv() => {
                if let Err(e) = framed.send(AcnMessage::envelope(&envelope, None)).await {
                    warn!(address = %address, to = %envelope.to, error = %e, "Failed to deliver envelope");
                    break;
                }
            }
            frame = framed.next() => match frame {
                None => {
                    debug!(address = %address, "Client disconnected");
                    break;
                }
                Some(Err(e)) => {
                    warn!(address = %address, error = %e, "Undecodable frame from client");
                    let _ = framed.send(Status::error(e.status_code(), e.to_string()).into()).await;
                    break;
                }
                Some(Ok(msg)) => {
                    if !handle_frame(&state, &address, msg, &mut replies, &mut framed).await {
                        break;
                    }
                }
            },
        }
    }

    state.sessions.remove(&address, handle.id);
    state.release(&address);
    record_client_connected(&kind_label, -1.0);
    info!(service = %handle.kind, address = %address, session = %handle.id, "Session ended");
}

/// Replies owed to the client, oldest first
type Replies = FuturesOrdered<BoxFuture<'static, AcnMessage>>;

fn reply_now(replies: &mut Replies, msg: AcnMessage) {
    replies.push_back(future::ready(msg).boxed());
}

fn reply_from(replies: &mut Replies, task: JoinHandle<AcnMessage>) {
    replies.push_back(
        async move {
            task.await.unwrap_or_else(|e| {
                Status::error(StatusCode::ErrorGeneric, format!("routing task failed: {}", e)).into()
            })
        }
        .boxed(),
    );
}

/// Returns false when the connection must close
async fn handle_frame(
    state: &Arc<NodeState>,
    address: &str,
    msg: AcnMessage,
    replies: &mut Replies,
    framed: &mut AcnFramed,
) -> bool {
    match msg {
        AcnMessage::EnvelopePayload { envelope, .. } => {
            let envelope = match Envelope::from_bytes(&envelope) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(address, error = %e, "Malformed envelope from client");
                    let _ = framed.send(Status::error(StatusCode::ErrorDecode, e.to_string()).into()).await;
                    return false;
                }
            };
            if envelope.sender != address {
                let status = Status::error(
                    StatusCode::ErrorWrongAgentAddress,
                    format!("sender {} is not the registered address {}", envelope.sender, address),
                );
                reply_now(replies, status.into());
                return true;
            }

            let state = state.clone();
            let task = tokio::spawn(async move {
                let to = envelope.to.clone();
                let status = match tokio::time::timeout(
                    state.config.timeouts.forward(),
                    router::route(&state, envelope),
                )
                .await
                {
                    Ok(status) => status,
                    Err(_) => Status::error(StatusCode::ErrorGeneric, format!("routing to {} timed out", to)),
                };
                AcnMessage::from(status)
            });
            reply_from(replies, task);
            true
        }
        AcnMessage::LookupRequest { agent_address } => {
            let state = state.clone();
            let task = tokio::spawn(async move {
                match router::resolve(&state, &agent_address).await {
                    Some(record) => AcnMessage::LookupResponse(record),
                    None => Status::error(StatusCode::ErrorUnknownAgentAddress, agent_address).into(),
                }
            });
            reply_from(replies, task);
            true
        }
        AcnMessage::Status(status) => {
            // Acknowledgement of an envelope we delivered
            if !status.is_success() {
                debug!(address, status = %status, "Client refused an envelope");
            }
            true
        }
        other @ (AcnMessage::Register(_) | AcnMessage::LookupResponse(_)) => {
            let status = Status::error(
                StatusCode::ErrorUnexpectedPayload,
                format!("unexpected {} on a serving session", other.kind()),
            );
            let _ = framed.send(status.into()).await;
            false
        }
    }
}

