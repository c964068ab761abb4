//! Subscription types for live collection updates.

use crate::correlator::RequestCorrelator;
use crate::error::{ClientError, ServerError};
use crate::types::Handle;
use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Identifier the caller uses to cancel a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub Handle);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a subscription. `Cancelled` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriptionState {
    /// Requested, not yet acknowledged by the server.
    Created = 0,
    /// Acknowledged; events are delivered in arrival order.
    Active = 1,
    Cancelled = 2,
}

impl SubscriptionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SubscriptionState::Created,
            1 => SubscriptionState::Active,
            _ => SubscriptionState::Cancelled,
        }
    }
}

/// Why a subscription ended.
#[derive(Clone, Debug, PartialEq)]
pub enum DropReason {
    /// Explicitly unsubscribed.
    Unsubscribed,
    /// The server closed the stream.
    Finished,
    /// The server refused the subscription.
    Rejected(ServerError),
    /// The event buffer overflowed (slow consumer).
    BufferOverflow,
    /// The transport connection was torn down.
    Disconnected(String),
}

impl DropReason {
    pub(crate) fn to_error(&self) -> ClientError {
        match self {
            DropReason::Rejected(err) => ClientError::Query(err.clone()),
            DropReason::Disconnected(msg) => ClientError::Transport(msg.clone()),
            DropReason::Unsubscribed | DropReason::Finished => ClientError::Closed,
            DropReason::BufferOverflow => {
                ClientError::Transport("subscription buffer overflow".to_string())
            }
        }
    }
}

/// State shared by the correlator entry and the caller's subscription.
#[derive(Debug)]
pub struct StateCell {
    state: AtomicU8,
    reason: Mutex<Option<DropReason>>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(SubscriptionState::Created as u8),
            reason: Mutex::new(None),
        }
    }

    pub fn get(&self) -> SubscriptionState {
        SubscriptionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_active(&self) -> bool {
        self.get() == SubscriptionState::Active
    }

    pub fn is_cancelled(&self) -> bool {
        self.get() == SubscriptionState::Cancelled
    }

    /// `Created -> Active`. Has no effect once cancelled.
    pub(crate) fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                SubscriptionState::Created as u8,
                SubscriptionState::Active as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Move to `Cancelled`. Only the first reason is kept.
    pub(crate) fn cancel(&self, reason: DropReason) -> bool {
        let mut slot = self.reason.lock();
        let previous = self.state.swap(SubscriptionState::Cancelled as u8, Ordering::SeqCst);
        if previous == SubscriptionState::Cancelled as u8 {
            return false;
        }
        *slot = Some(reason);
        true
    }

    pub fn drop_reason(&self) -> Option<DropReason> {
        self.reason.lock().clone()
    }
}

/// Receiving end of an active subscription.
///
/// Records are yielded in the order the server sent them. Once the
/// subscription is cancelled nothing more is yielded, including records that
/// were already queued.
pub struct Subscription {
    pub(crate) handle: SubscriptionHandle,
    pub(crate) server_handle: u32,
    pub(crate) state: Arc<StateCell>,
    pub(crate) receiver: Receiver<Value>,
    pub(crate) errors: Receiver<ClientError>,
}

impl Subscription {
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    /// Handle value the server acknowledged the subscription with.
    pub fn server_handle(&self) -> u32 {
        self.server_handle
    }

    pub fn state(&self) -> SubscriptionState {
        self.state.get()
    }

    pub fn drop_reason(&self) -> Option<DropReason> {
        self.state.drop_reason()
    }

    /// Receive the next record (blocking).
    pub fn recv(&self) -> Result<Value, RecvError> {
        if self.state.is_cancelled() {
            return Err(RecvError);
        }
        let record = self.receiver.recv()?;
        self.admit(record).ok_or(RecvError)
    }

    /// Try to receive a record (non-blocking).
    pub fn try_recv(&self) -> Result<Value, TryRecvError> {
        if self.state.is_cancelled() {
            return Err(TryRecvError::Disconnected);
        }
        let record = self.receiver.try_recv()?;
        self.admit(record).ok_or(TryRecvError::Disconnected)
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Value, RecvTimeoutError> {
        if self.state.is_cancelled() {
            return Err(RecvTimeoutError::Disconnected);
        }
        let record = self.receiver.recv_timeout(timeout)?;
        self.admit(record).ok_or(RecvTimeoutError::Disconnected)
    }

    /// Blocking iterator over records until the subscription ends.
    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        std::iter::from_fn(move || self.recv().ok())
    }

    /// Errors reported for this subscription while it stays active.
    pub fn errors(&self) -> &Receiver<ClientError> {
        &self.errors
    }

    pub(crate) fn receiver(&self) -> &Receiver<Value> {
        &self.receiver
    }

    /// Records dequeued after cancellation are dropped.
    fn admit(&self, record: Value) -> Option<Value> {
        if self.state.is_cancelled() {
            None
        } else {
            Some(record)
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("handle", &self.handle)
            .field("server_handle", &self.server_handle)
            .field("state", &self.state())
            .finish()
    }
}

/// Subscription whose records are pushed to a callback on a dedicated thread.
///
/// Dropping it cancels the subscription; the dispatcher thread exits after
/// its current callback returns.
pub struct CallbackSubscription {
    pub(crate) handle: SubscriptionHandle,
    pub(crate) state: Arc<StateCell>,
    pub(crate) errors: Receiver<ClientError>,
    pub(crate) worker: Option<JoinHandle<()>>,
    pub(crate) correlator: Arc<RequestCorrelator>,
}

impl CallbackSubscription {
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    pub fn state(&self) -> SubscriptionState {
        self.state.get()
    }

    /// Callback failures and server-side subscription errors.
    pub fn errors(&self) -> &Receiver<ClientError> {
        &self.errors
    }

    /// Wait for the dispatcher thread to exit. Returns immediately after the
    /// subscription has been cancelled and the current callback returned.
    pub fn join(mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for CallbackSubscription {
    fn drop(&mut self) {
        if self.correlator.cancel(self.handle.0) {
            tracing::debug!("Callback subscription {} dropped, cancelled", self.handle);
        }
    }
}
