//! Transport adapter contract.
//!
//! The network transport is supplied by the caller. The client hands it an
//! [`EventRouter`] on construction and from then on the adapter pushes every
//! reply and notification through [`EventRouter::route`], from whatever thread
//! it reads the network on.

use crate::correlator::EventRouter;
use crate::error::{Result, ServerError};
use crate::types::{Handle, ResultOfSubscribeCollection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Subscription push carrying a record.
pub const SUBSCRIPTION_EVENT: u32 = 100;
/// Subscription push carrying a server-side error.
pub const SUBSCRIPTION_ERROR: u32 = 101;

/// Remote methods, with their wire names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NetMethod {
    QueryCollection,
    WaitForCollection,
    SubscribeCollection,
    Unsubscribe,
    Query,
    Suspend,
    Resume,
}

impl NetMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetMethod::QueryCollection => "net.query_collection",
            NetMethod::WaitForCollection => "net.wait_for_collection",
            NetMethod::SubscribeCollection => "net.subscribe_collection",
            NetMethod::Unsubscribe => "net.unsubscribe",
            NetMethod::Query => "net.query",
            NetMethod::Suspend => "net.suspend",
            NetMethod::Resume => "net.resume",
        }
    }
}

impl fmt::Display for NetMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of an inbound message, encoded as a numeric code on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum ResponseType {
    Success,
    Error,
    Nop,
    /// Method specific pushes (`100` and up).
    Custom(u32),
}

impl From<u32> for ResponseType {
    fn from(code: u32) -> Self {
        match code {
            0 => ResponseType::Success,
            1 => ResponseType::Error,
            2 => ResponseType::Nop,
            other => ResponseType::Custom(other),
        }
    }
}

impl From<ResponseType> for u32 {
    fn from(kind: ResponseType) -> Self {
        match kind {
            ResponseType::Success => 0,
            ResponseType::Error => 1,
            ResponseType::Nop => 2,
            ResponseType::Custom(code) => code,
        }
    }
}

/// A reply or push delivered by the transport for one handle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub response_type: ResponseType,
    pub payload: Value,
    /// Set on the last message the server will ever send for the handle.
    #[serde(default)]
    pub finished: bool,
}

impl InboundMessage {
    pub fn success(payload: Value) -> Self {
        Self {
            response_type: ResponseType::Success,
            payload,
            finished: false,
        }
    }

    pub fn error(error: &ServerError) -> Self {
        Self {
            response_type: ResponseType::Error,
            payload: serde_json::to_value(error).unwrap_or(Value::Null),
            finished: true,
        }
    }

    /// Subscription push; `record` is wrapped as `{"result": record}`.
    pub fn event(record: Value) -> Self {
        Self {
            response_type: ResponseType::Custom(SUBSCRIPTION_EVENT),
            payload: serde_json::json!({ "result": record }),
            finished: false,
        }
    }

    pub fn subscription_error(error: &ServerError) -> Self {
        Self {
            response_type: ResponseType::Custom(SUBSCRIPTION_ERROR),
            payload: serde_json::to_value(error).unwrap_or(Value::Null),
            finished: false,
        }
    }

    pub fn finished(mut self) -> Self {
        self.finished = true;
        self
    }
}

/// Request to stop producing messages for a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cancellation {
    /// Correlator handle the request was sent with.
    pub handle: Handle,
    /// Handle the server acknowledged a subscription with. `None` for
    /// single-shot calls and for subscriptions cancelled before their
    /// acknowledgement arrived.
    pub server_handle: Option<u32>,
}

impl Cancellation {
    /// The `net.unsubscribe` request naming the server's subscription, if
    /// there is one to name.
    pub fn unsubscribe_request(&self) -> Option<(NetMethod, Value)> {
        let params = ResultOfSubscribeCollection {
            handle: self.server_handle?,
        };
        Some((NetMethod::Unsubscribe, serde_json::to_value(params).ok()?))
    }
}

/// Network side of the client.
///
/// Implementations must be callable from several threads at once. `send`
/// must not call back into the client synchronously while holding locks of
/// its own that `route` would also take.
pub trait Transport: Send + Sync {
    /// Hand the adapter the inbound path. Called once, before any `send`.
    fn attach(&self, router: EventRouter);

    /// Send a request tagged with `handle`. Replies and pushes for it must be
    /// routed back with the same handle.
    fn send(&self, handle: Handle, method: NetMethod, params: Value) -> Result<()>;

    /// Tell the server to stop producing messages for `cancellation.handle`.
    /// Adapters for the net protocol send
    /// [`Cancellation::unsubscribe_request`] when it is `Some`.
    fn send_cancellation(&self, cancellation: Cancellation) -> Result<()>;
}
