// wire/message.rs - ACN Message Taxonomy

use prost::Message;
use serde::{Deserialize, Serialize};

use super::codec::CodecError;
use crate::proto::{self, acn_message::Performative};
use crate::trust::LedgerSigner;

pub use crate::proto::StatusCode;

impl StatusCode {
    /// Protocol name of the code, e.g. `ERROR_INVALID_PROOF`
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Success => "SUCCESS",
            StatusCode::ErrorUnsupportedVersion => "ERROR_UNSUPPORTED_VERSION",
            StatusCode::ErrorUnexpectedPayload => "ERROR_UNEXPECTED_PAYLOAD",
            StatusCode::ErrorGeneric => "ERROR_GENERIC",
            StatusCode::ErrorDecode => "ERROR_DECODE",
            StatusCode::ErrorWrongAgentAddress => "ERROR_WRONG_AGENT_ADDRESS",
            StatusCode::ErrorWrongPublicKey => "ERROR_WRONG_PUBLIC_KEY",
            StatusCode::ErrorInvalidProof => "ERROR_INVALID_PROOF",
            StatusCode::ErrorUnsupportedLedger => "ERROR_UNSUPPORTED_LEDGER",
            StatusCode::ErrorUnknownAgentAddress => "ERROR_UNKNOWN_AGENT_ADDRESS",
            StatusCode::ErrorAgentNotReady => "ERROR_AGENT_NOT_READY",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StatusCode::Success)
    }

    /// Failures caused by the record itself; retrying with it fails identically
    pub fn is_authentication_error(&self) -> bool {
        matches!(
            self,
            StatusCode::ErrorWrongAgentAddress
                | StatusCode::ErrorWrongPublicKey
                | StatusCode::ErrorInvalidProof
                | StatusCode::ErrorUnsupportedLedger
        )
    }

    /// Failures that leave the connection open for the caller to decide
    pub fn is_routing_error(&self) -> bool {
        matches!(
            self,
            StatusCode::ErrorUnknownAgentAddress | StatusCode::ErrorAgentNotReady
        )
    }
}

/// Binding between an agent address and the peer allowed to represent it
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentRecord {
    pub address: String,
    pub public_key: String,
    pub peer_public_key: String,
    pub signature: String,
    pub ledger_id: String,
    pub service_id: String,
    pub not_before: String,
    pub not_after: String,
}

impl AgentRecord {
    /// Sign a record authorizing `peer_public_key` to represent the signer's address
    pub fn issue(signer: &dyn LedgerSigner, peer_public_key: &str) -> Self {
        Self {
            address: signer.address(),
            public_key: signer.public_key(),
            peer_public_key: peer_public_key.to_string(),
            signature: signer.sign(peer_public_key.as_bytes()),
            ledger_id: signer.ledger_id().to_string(),
            ..Default::default()
        }
    }

    pub fn with_service_id(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = service_id.into();
        self
    }

    pub fn with_validity(mut self, not_before: impl Into<String>, not_after: impl Into<String>) -> Self {
        self.not_before = not_before.into();
        self.not_after = not_after.into();
        self
    }
}

impl From<proto::AgentRecord> for AgentRecord {
    fn from(r: proto::AgentRecord) -> Self {
        Self {
            address: r.address,
            public_key: r.public_key,
            peer_public_key: r.peer_public_key,
            signature: r.signature,
            ledger_id: r.ledger_id,
            service_id: r.service_id,
            not_before: r.not_before,
            not_after: r.not_after,
        }
    }
}

impl From<AgentRecord> for proto::AgentRecord {
    fn from(r: AgentRecord) -> Self {
        Self {
            service_id: r.service_id,
            ledger_id: r.ledger_id,
            address: r.address,
            public_key: r.public_key,
            peer_public_key: r.peer_public_key,
            signature: r.signature,
            not_before: r.not_before,
            not_after: r.not_after,
        }
    }
}

/// Opaque message unit routed between agents
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Envelope {
    pub to: String,
    pub sender: String,
    pub protocol_id: String,
    pub message: Vec<u8>,
    /// Optional routing context; an empty context is `None`
    pub context: Option<String>,
}

impl Envelope {
    pub fn new(to: impl Into<String>, sender: impl Into<String>, message: impl Into<Vec<u8>>) -> Self {
        Self {
            to: to.into(),
            sender: sender.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_protocol_id(mut self, protocol_id: impl Into<String>) -> Self {
        self.protocol_id = protocol_id.into();
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        self.context = (!context.is_empty()).then_some(context);
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        proto::Envelope {
            to: self.to.clone(),
            sender: self.sender.clone(),
            protocol_id: self.protocol_id.clone(),
            message: self.message.clone(),
            uri: self.context.clone().unwrap_or_default(),
        }
        .encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let e = proto::Envelope::decode(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;
        Ok(Self {
            to: e.to,
            sender: e.sender,
            protocol_id: e.protocol_id,
            message: e.message,
            context: (!e.uri.is_empty()).then_some(e.uri),
        })
    }
}

/// Status reply carried in response to registrations, lookups and envelopes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub msgs: Vec<String>,
}

impl Status {
    pub fn success() -> Self {
        Self {
            code: StatusCode::Success,
            msgs: Vec::new(),
        }
    }

    pub fn error(code: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            msgs: vec![msg.into()],
        }
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.msgs.is_empty() {
            write!(f, "{}", self.code.as_str())
        } else {
            write!(f, "{}: {}", self.code.as_str(), self.msgs.join("; "))
        }
    }
}

impl From<StatusCode> for Status {
    fn from(code: StatusCode) -> Self {
        Self {
            code,
            msgs: Vec::new(),
        }
    }
}

/// One frame's worth of ACN protocol
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcnMessage {
    Register(AgentRecord),
    LookupRequest { agent_address: String },
    LookupResponse(AgentRecord),
    Status(Status),
    EnvelopePayload {
        envelope: Vec<u8>,
        record: Option<AgentRecord>,
    },
}

impl AcnMessage {
    /// Short name for logs and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            AcnMessage::Register(_) => "register",
            AcnMessage::LookupRequest { .. } => "lookup_request",
            AcnMessage::LookupResponse(_) => "lookup_response",
            AcnMessage::Status(_) => "status",
            AcnMessage::EnvelopePayload { .. } => "envelope",
        }
    }

    pub fn envelope(envelope: &Envelope, record: Option<AgentRecord>) -> Self {
        AcnMessage::EnvelopePayload {
            envelope: envelope.to_bytes(),
            record,
        }
    }

    pub(crate) fn into_proto(self, version: &str) -> proto::AcnMessage {
        let performative = match self {
            AcnMessage::Register(record) => Performative::Register(proto::Register {
                record: Some(record.into()),
            }),
            AcnMessage::LookupRequest { agent_address } => {
                Performative::LookupRequest(proto::LookupRequest { agent_address })
            }
            AcnMessage::LookupResponse(record) => {
                Performative::LookupResponse(proto::LookupResponse {
                    record: Some(record.into()),
                })
            }
            AcnMessage::Status(status) => Performative::Status(proto::Status {
                code: status.code as i32,
                msgs: status.msgs,
            }),
            AcnMessage::EnvelopePayload { envelope, record } => {
                Performative::AeaEnvelope(proto::AeaEnvelope {
                    envelope,
                    record: record.map(Into::into),
                })
            }
        };
        proto::AcnMessage {
            version: version.to_string(),
            performative: Some(performative),
        }
    }

    pub(crate) fn from_proto(msg: proto::AcnMessage) -> Result<Self, CodecError> {
        let performative = msg.performative.ok_or(CodecError::EmptyPayload)?;
        Ok(match performative {
            Performative::Register(r) => {
                let record = r
                    .record
                    .ok_or_else(|| CodecError::Malformed("register without record".into()))?;
                AcnMessage::Register(record.into())
            }
            Performative::LookupRequest(r) => AcnMessage::LookupRequest {
                agent_address: r.agent_address,
            },
            Performative::LookupResponse(r) => {
                let record = r
                    .record
                    .ok_or_else(|| CodecError::Malformed("lookup response without record".into()))?;
                AcnMessage::LookupResponse(record.into())
            }
            Performative::Status(s) => {
                let code = StatusCode::try_from(s.code)
                    .map_err(|_| CodecError::Malformed(format!("unknown status code {}", s.code)))?;
                AcnMessage::Status(Status { code, msgs: s.msgs })
            }
            Performative::AeaEnvelope(e) => AcnMessage::EnvelopePayload {
                envelope: e.envelope,
                record: e.record.map(Into::into),
            },
        })
    }
}

impl From<Status> for AcnMessage {
    fn from(status: Status) -> Self {
        AcnMessage::Status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::{LedgerId, LedgerKeyPair};

    #[test]
    fn test_status_code_classes() {
        assert!(StatusCode::Success.is_success());
        assert!(StatusCode::ErrorInvalidProof.is_authentication_error());
        assert!(StatusCode::ErrorUnsupportedLedger.is_authentication_error());
        assert!(StatusCode::ErrorAgentNotReady.is_routing_error());
        assert!(!StatusCode::ErrorGeneric.is_authentication_error());
        assert_eq!(StatusCode::ErrorInvalidProof.as_str(), "ERROR_INVALID_PROOF");
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::success().to_string(), "SUCCESS");
        let status = Status::error(StatusCode::ErrorUnknownAgentAddress, "fetch1x");
        assert_eq!(status.to_string(), "ERROR_UNKNOWN_AGENT_ADDRESS: fetch1x");
    }

    #[test]
    fn test_issue_record() {
        let agent = LedgerKeyPair::generate(LedgerId::Fetchai);
        let record = AgentRecord::issue(&agent, "02abcdef").with_service_id("acn");

        assert_eq!(record.address, agent.address());
        assert_eq!(record.peer_public_key, "02abcdef");
        assert_eq!(record.ledger_id, "fetchai");
        assert_eq!(record.service_id, "acn");
        assert!(LedgerId::Fetchai.verify_signature(
            b"02abcdef",
            &record.signature,
            &record.public_key
        ));
    }

    #[test]
    fn test_envelope_bytes() {
        let envelope = Envelope::new("addrB", "addrA", b"hello".to_vec())
            .with_protocol_id("fetchai/default:1.0.0")
            .with_context("");
        assert!(envelope.context.is_none());

        let decoded = Envelope::from_bytes(&envelope.to_bytes()).unwrap();
        assert_eq!(decoded, envelope);

        let with_context = envelope.with_context("tcp://127.0.0.1");
        let decoded = Envelope::from_bytes(&with_context.to_bytes()).unwrap();
        assert_eq!(decoded.context.as_deref(), Some("tcp://127.0.0.1"));
    }

    #[test]
    fn test_empty_performative_rejected() {
        let msg = proto::AcnMessage {
            version: "0.1.0".into(),
            performative: None,
        };
        assert!(matches!(AcnMessage::from_proto(msg), Err(CodecError::EmptyPayload)));
    }

    #[test]
    fn test_unknown_status_code_rejected() {
        let msg = proto::AcnMessage {
            version: "0.1.0".into(),
            performative: Some(Performative::Status(proto::Status {
                code: 99,
                msgs: vec![],
            })),
        };
        assert!(matches!(AcnMessage::from_proto(msg), Err(CodecError::Malformed(_))));
    }
}
