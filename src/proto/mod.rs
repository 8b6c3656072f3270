// proto/mod.rs - Wire Schema

//! Protocol buffer messages carried on ACN streams.
//!
//! These are maintained by hand with prost derives. Field tags are part of the
//! wire contract and must never be renumbered.

/// Identity binding between an agent address and the peer that represents it.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct AgentRecord {
    #[prost(string, tag = "1")]
    pub service_id: String,
    #[prost(string, tag = "2")]
    pub ledger_id: String,
    #[prost(string, tag = "3")]
    pub address: String,
    #[prost(string, tag = "4")]
    pub public_key: String,
    #[prost(string, tag = "5")]
    pub peer_public_key: String,
    #[prost(string, tag = "6")]
    pub signature: String,
    #[prost(string, tag = "7")]
    pub not_before: String,
    #[prost(string, tag = "8")]
    pub not_after: String,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Register {
    #[prost(message, optional, tag = "1")]
    pub record: Option<AgentRecord>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct LookupRequest {
    #[prost(string, tag = "1")]
    pub agent_address: String,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct LookupResponse {
    #[prost(message, optional, tag = "1")]
    pub record: Option<AgentRecord>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct AeaEnvelope {
    #[prost(bytes = "vec", tag = "1")]
    pub envelope: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub record: Option<AgentRecord>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Status {
    #[prost(enumeration = "StatusCode", tag = "1")]
    pub code: i32,
    #[prost(string, repeated, tag = "2")]
    pub msgs: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
    Success = 0,
    ErrorUnsupportedVersion = 1,
    ErrorUnexpectedPayload = 2,
    ErrorGeneric = 3,
    ErrorDecode = 4,
    ErrorWrongAgentAddress = 10,
    ErrorWrongPublicKey = 11,
    ErrorInvalidProof = 12,
    ErrorUnsupportedLedger = 13,
    ErrorUnknownAgentAddress = 20,
    ErrorAgentNotReady = 21,
}

/// Top-level frame payload. Exactly one performative is set on the wire.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct AcnMessage {
    #[prost(string, tag = "1")]
    pub version: String,
    #[prost(oneof = "acn_message::Performative", tags = "2, 3, 4, 5, 6")]
    pub performative: Option<acn_message::Performative>,
}

pub mod acn_message {
    #[derive(Clone, PartialEq, Eq, ::prost::Oneof)]
    pub enum Performative {
        #[prost(message, tag = "2")]
        Status(super::Status),
        #[prost(message, tag = "3")]
        Register(super::Register),
        #[prost(message, tag = "4")]
        LookupRequest(super::LookupRequest),
        #[prost(message, tag = "5")]
        LookupResponse(super::LookupResponse),
        #[prost(message, tag = "6")]
        AeaEnvelope(super::AeaEnvelope),
    }
}

/// Routed message unit. `uri` carries the optional routing context.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Envelope {
    #[prost(string, tag = "1")]
    pub to: String,
    #[prost(string, tag = "2")]
    pub sender: String,
    #[prost(string, tag = "3")]
    pub protocol_id: String,
    #[prost(bytes = "vec", tag = "4")]
    pub message: Vec<u8>,
    #[prost(string, tag = "5")]
    pub uri: String,
}

// DHT RPC

/// Contact information a peer advertises about itself or others.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct PeerInfo {
    #[prost(bytes = "vec", tag = "1")]
    pub peer_id: Vec<u8>,
    #[prost(string, tag = "2")]
    pub public_key: String,
    #[prost(string, repeated, tag = "3")]
    pub addrs: Vec<String>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct FindNode {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct GetProviders {
    #[prost(string, tag = "1")]
    pub agent_address: String,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct AddProvider {
    #[prost(string, tag = "1")]
    pub agent_address: String,
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Ping {}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct DhtRequest {
    #[prost(message, optional, tag = "1")]
    pub sender: Option<PeerInfo>,
    #[prost(oneof = "dht_request::Kind", tags = "2, 3, 4, 5")]
    pub kind: Option<dht_request::Kind>,
}

pub mod dht_request {
    #[derive(Clone, PartialEq, Eq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "2")]
        FindNode(super::FindNode),
        #[prost(message, tag = "3")]
        GetProviders(super::GetProviders),
        #[prost(message, tag = "4")]
        AddProvider(super::AddProvider),
        #[prost(message, tag = "5")]
        Ping(super::Ping),
    }
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct DhtResponse {
    #[prost(message, repeated, tag = "1")]
    pub closer_peers: Vec<PeerInfo>,
    #[prost(message, repeated, tag = "2")]
    pub providers: Vec<PeerInfo>,
    #[prost(message, optional, tag = "3")]
    pub sender: Option<PeerInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_status_code_values() {
        assert_eq!(StatusCode::Success as i32, 0);
        assert_eq!(StatusCode::ErrorInvalidProof as i32, 12);
        assert_eq!(StatusCode::ErrorAgentNotReady as i32, 21);
        assert!(StatusCode::try_from(5).is_err());
    }

    #[test]
    fn test_empty_message_has_no_performative() {
        let decoded = AcnMessage::decode(&[][..]).unwrap();
        assert!(decoded.performative.is_none());
        assert!(decoded.version.is_empty());
    }
}
