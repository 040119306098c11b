//! Narrow capability interface to the chat-service client library.
//!
//! Everything upstream of a worker Session is library-agnostic: a `Dialer`
//! opens authenticated `Connection`s, a `Connection` sends and emits
//! `WireEvent`s, and that is the whole surface. The production adapter wraps
//! the vendor library; tests use [`fake::FakeService`].

pub mod classify;
pub mod fake;
pub mod proxy;
pub mod traits;

pub use classify::{BlockClassifier, BlockVerdict};
pub use proxy::{ProxyEndpoint, ProxyPool, StaticProxyPool};
pub use traits::{
    Connection, Credential, DialOutcome, Dialer, PairingMaterial, ReceiptKind, SendOutcome,
    WireEvent, WireEventStream,
};
