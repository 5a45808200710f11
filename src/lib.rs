//! Device-side client library for an IoT cloud messaging service.
//!
//! The crate covers three concerns:
//!
//! - **Trust**: exchanging a shared secret or activation key for access
//!   tokens, and the one-time direct activation handshake
//!   ([`trust`]).
//! - **Messages**: immutable, validated envelopes with a canonical JSON
//!   wire form ([`message`]).
//! - **Dispatch**: an async engine that batches outbound messages by
//!   priority, tracks per-message delivery receipts, and routes inbound
//!   server requests to registered handlers ([`dispatch`],
//!   [`resource`]).
//!
//! [`DeviceClient`] wires the three together for one device identity;
//! [`ClientRegistry`] keeps one client per identity.

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod message;
pub mod resource;
pub mod trust;
pub mod types;
pub mod util;

pub use client::{ClientRegistry, DeviceClient};
pub use config::ClientConfig;
pub use connection::{ConnectionError, ConnectionManager};
pub use dispatch::{
    DeliveryStatus, MessageDispatcher, MessageReceipt, QueueError, ReceiptListener,
};
pub use message::{
    DataItem, DataValue, Direction, Message, Payload, Priority, Reliability, Severity,
    ValidationError,
};
pub use resource::{
    HandlerError, HttpMethod, RegistryError, ReportType, RequestHandler, Resource, ResourceStatus,
};
pub use trust::activation::{ActivationError, ActivationPolicy, ActivationResult};
pub use trust::{AccessToken, TokenError, TrustStore};
pub use types::{EndpointId, Identity};
