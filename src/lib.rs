//! # Collection Net
//!
//! Client-side engine for a remote collection service: filtered queries,
//! blocking waits and live subscriptions over a caller-supplied transport.
//!
//! ## Core Concepts
//!
//! - **Transport**: External adapter that sends requests and routes replies back
//! - **Correlator**: Tracks every outstanding call by handle
//! - **Queries**: One-shot filtered reads and raw queries
//! - **Waits**: Block until a matching record exists or a timeout passes
//! - **Subscriptions**: Ordered per-subscription channels, explicit cancellation
//!
//! ## Example
//!
//! ```ignore
//! use collection_net::{ClientConfig, CollectionFilter, NetClient, OrderBy, ParamsOfQueryCollection};
//!
//! let client = NetClient::new(transport, ClientConfig::default());
//!
//! // Ten active accounts, oldest first
//! let accounts = client.query_collection(
//!     &ParamsOfQueryCollection::new("accounts", "id created_at")
//!         .filter(CollectionFilter::eq("status", "active"))
//!         .order(OrderBy::asc("created_at"))
//!         .limit(10),
//! )?;
//!
//! // Wait up to five seconds for a message to be finalized
//! let message = client.wait_for_collection(
//!     &ParamsOfWaitForCollection::new("messages", "id status")
//!         .filter(CollectionFilter::eq("id", id))
//!         .timeout(Duration::from_secs(5)),
//! )?;
//! ```

pub mod client;
pub mod correlator;
pub mod error;
pub mod query;
pub mod subscriptions;
pub mod transport;
pub mod types;
pub mod wait;

// Re-exports
pub use client::{ClientConfig, NetClient, DEFAULT_SERVER_WAIT_GRACE, DEFAULT_WAIT_TIMEOUT};
pub use correlator::{Deadline, EventRouter, RequestCorrelator};
pub use error::{ClientError, Result, ServerError};
pub use query::QueryEngine;
pub use subscriptions::{
    CallbackSubscription, DropReason, Subscription, SubscriptionHandle, SubscriptionManager,
    SubscriptionState,
};
pub use transport::{
    Cancellation, InboundMessage, NetMethod, ResponseType, Transport, SUBSCRIPTION_ERROR,
    SUBSCRIPTION_EVENT,
};
pub use types::*;
pub use wait::{WaitForEngine, WaitStrategy, WAIT_FOR_TIMEOUT_CODE};
