//! Durable state for the sending core.
//!
//! The production deployment fronts a relational store; the core's contract
//! with it is small enough that these JSON-file-backed in-process stores
//! carry the same guarantees the queue semantics need (one record per
//! (campaign, recipient, template), monotonic status transitions, retry
//! caps). Each store loads at startup and flushes on a timer and at
//! shutdown.

pub mod accounts;
pub mod campaigns;
pub mod history;
pub mod queue;
pub mod sessions;

pub use accounts::AccountStore;
pub use campaigns::CampaignStore;
pub use history::ChatHistoryStore;
pub use queue::QueueStore;
pub use sessions::{SessionFiles, SessionMeta, StoredIdentity};
