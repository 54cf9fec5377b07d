// ── fleetconf-netconf ──
//
// The protocol layer of the fleetconf controller: RFC 6242 message
// framing (both end-of-message and chunked modes), an owned XML element
// tree for wire payloads, inbound message classification, outbound RPC
// builders, and the SSH subprocess transport.
//
// This crate knows nothing about devices, transactions, or datastores;
// it converts byte streams to and from discrete NETCONF messages.

pub mod error;
pub mod frame;
pub mod message;
pub mod rpc;
pub mod transport;
pub mod xml;

pub use error::ProtoError;
pub use frame::{FrameReader, FrameWriter, FramingMode};
pub use message::Capabilities;
pub use transport::{Transport, TransportReader, TransportWriter};
pub use xml::XmlNode;

/// NETCONF base protocol namespace (1.0; 1.1 shares it on the wire).
pub const BASE_NAMESPACE: &str = "urn:ietf:params:xml:ns:netconf:base:1.0";

/// RFC 6022 NETCONF monitoring namespace (schema list, get-schema).
pub const MONITORING_NAMESPACE: &str = "urn:ietf:params:xml:ns:yang:ietf-netconf-monitoring";

/// Namespace of the controller's own RPC surface.
pub const CONTROLLER_NAMESPACE: &str = "http://clicon.org/controller";

/// Capability URI advertised by NETCONF 1.0 peers.
pub const CAP_BASE_10: &str = "urn:ietf:params:netconf:base:1.0";

/// Capability URI advertised by NETCONF 1.1 peers (enables chunked framing).
pub const CAP_BASE_11: &str = "urn:ietf:params:netconf:base:1.1";

/// Capability URI for RFC 6022 monitoring, required for schema retrieval.
pub const CAP_MONITORING: &str = "urn:ietf:params:xml:ns:yang:ietf-netconf-monitoring";
