// network/mod.rs - Network Layer

//! Peer-to-peer plumbing for ACN nodes.
//!
//! - `transport` - byte stream connectors and protocol-tagged peer streams
//! - `routing` - XOR keyspace and the k-bucket routing table
//! - `discovery` - DHT lookups and provider records

pub mod discovery;
pub mod routing;
pub mod transport;

pub use discovery::{Dht, DiscoveryConfig, DiscoveryError, LookupOutcome, ProviderStore};
pub use routing::{DhtKey, Distance, InsertOutcome, RoutingTable, RoutingTableEntry};
pub use transport::{
    AcnFramed, BoxedStream, Connector, MemoryConnector, MemoryListener, RelayConnector,
    TcpConnector, TransportError, acn_framed, open_stream, read_protocol_header,
    write_protocol_header, PROTOCOL_ADDRESS, PROTOCOL_DHT, PROTOCOL_ENVELOPE, PROTOCOL_REGISTER,
};
#[cfg(unix)]
pub use transport::UnixConnector;
