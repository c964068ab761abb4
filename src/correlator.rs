//! Request correlator: handle allocation and routing of inbound messages.
//!
//! Every outstanding operation is a [`PendingCall`] in one table keyed by
//! [`Handle`]. Single-shot calls are removed when their reply arrives;
//! streaming calls stay in the table and receive pushes until cancelled.
//! Inserts, removals and lookup-and-deliver all happen under the same lock,
//! so nothing is delivered to an entry after it has been removed.

use crate::error::{ClientError, Result, ServerError};
use crate::subscriptions::{DropReason, StateCell};
use crate::transport::{
    Cancellation, InboundMessage, NetMethod, ResponseType, Transport, SUBSCRIPTION_ERROR,
    SUBSCRIPTION_EVENT,
};
use crate::types::{Handle, ResultOfSubscribeCollection};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Reply to a single-shot call, or the acknowledgement of a stream.
pub(crate) type Reply = Result<Value>;

/// Absolute deadline plus the budget it was computed from.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    /// `None` when `budget` reaches past what `Instant` can represent; such
    /// a call has no deadline.
    pub fn after(budget: Duration) -> Option<Self> {
        Instant::now()
            .checked_add(budget)
            .map(|at| Self { at, budget })
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn timeout_error(&self) -> ClientError {
        ClientError::Timeout(self.budget)
    }
}

/// Sinks of a streaming call.
pub(crate) struct StreamSink {
    /// Taken by the first success or error reply.
    ack: Option<Sender<Reply>>,
    /// Set from the acknowledgement payload.
    server_handle: Option<u32>,
    events: Sender<Value>,
    errors: Sender<ClientError>,
    state: Arc<StateCell>,
}

impl StreamSink {
    pub(crate) fn new(events: Sender<Value>, errors: Sender<ClientError>, state: Arc<StateCell>) -> Self {
        Self {
            ack: None,
            server_handle: None,
            events,
            errors,
            state,
        }
    }

    fn close(self, reason: DropReason) {
        if let Some(ack) = self.ack {
            let _ = ack.send(Err(reason.to_error()));
        }
        if let DropReason::Disconnected(ref msg) = reason {
            let _ = self.errors.send(ClientError::Transport(msg.clone()));
        }
        self.state.cancel(reason);
    }
}

/// An outstanding operation.
pub(crate) enum PendingCall {
    Single { reply: Sender<Reply> },
    Stream(StreamSink),
}

impl PendingCall {
    fn cancellation(&self, handle: Handle) -> Cancellation {
        let server_handle = match self {
            PendingCall::Single { .. } => None,
            PendingCall::Stream(sink) => sink.server_handle,
        };
        Cancellation {
            handle,
            server_handle,
        }
    }
}

/// State shared between the correlator and every [`EventRouter`].
struct Shared {
    pending: Mutex<HashMap<Handle, PendingCall>>,
    next_handle: AtomicU32,
    closed: AtomicBool,
    /// Used to cancel streams dropped while routing. Weak because the
    /// transport holds a router, which holds this.
    transport: Weak<dyn Transport>,
}

/// Outcome of routing one message, acted on after the table lock is released.
enum Routed {
    Done,
    /// Stream removed locally; the server still has to be told.
    Orphaned(DropReason, Cancellation),
}

impl Shared {
    fn route(&self, handle: Handle, message: InboundMessage) {
        let outcome = {
            let mut pending = self.pending.lock();
            let Some(call) = pending.get_mut(&handle) else {
                tracing::debug!(
                    "Dropping {:?} message for unknown handle {}",
                    message.response_type,
                    handle
                );
                return;
            };

            match call {
                PendingCall::Single { .. } => Self::route_single(&mut pending, handle, message),
                PendingCall::Stream(sink) => {
                    let finished = message.finished;
                    let outcome = Self::route_stream(sink, handle, message);
                    match outcome {
                        StreamStep::Keep if finished => {
                            if let Some(PendingCall::Stream(sink)) = pending.remove(&handle) {
                                tracing::debug!("Stream {} finished by server", handle);
                                sink.close(DropReason::Finished);
                            }
                            Routed::Done
                        }
                        StreamStep::Keep => Routed::Done,
                        StreamStep::Remove(reason) => {
                            let orphaned = matches!(
                                reason,
                                DropReason::BufferOverflow | DropReason::Unsubscribed
                            );
                            let Some(removed) = pending.remove(&handle) else {
                                return;
                            };
                            let cancellation = removed.cancellation(handle);
                            if let PendingCall::Stream(sink) = removed {
                                sink.close(reason.clone());
                            }
                            if orphaned {
                                Routed::Orphaned(reason, cancellation)
                            } else {
                                Routed::Done
                            }
                        }
                    }
                }
            }
        };

        if let Routed::Orphaned(reason, cancellation) = outcome {
            tracing::warn!("Subscription {} dropped: {:?}", handle, reason);
            if let Some(transport) = self.transport.upgrade() {
                if let Err(e) = transport.send_cancellation(cancellation) {
                    tracing::warn!("Failed to cancel dropped subscription {}: {}", handle, e);
                }
            }
        }
    }

    fn route_single(
        pending: &mut HashMap<Handle, PendingCall>,
        handle: Handle,
        message: InboundMessage,
    ) -> Routed {
        let reply = match message.response_type {
            ResponseType::Success => Ok(message.payload),
            ResponseType::Error => Err(ClientError::Query(ServerError::from_payload(message.payload))),
            other => {
                tracing::trace!("Ignoring {:?} message for single-shot call {}", other, handle);
                return Routed::Done;
            }
        };

        if let Some(PendingCall::Single { reply: tx }) = pending.remove(&handle) {
            tracing::trace!("Resolving call {}", handle);
            // Receiver is gone if the caller gave up waiting.
            let _ = tx.send(reply);
        }
        Routed::Done
    }

    fn route_stream(sink: &mut StreamSink, handle: Handle, message: InboundMessage) -> StreamStep {
        match message.response_type {
            ResponseType::Success => {
                if let Some(ack) = sink.ack.take() {
                    sink.server_handle =
                        serde_json::from_value::<ResultOfSubscribeCollection>(message.payload.clone())
                            .ok()
                            .map(|result| result.handle);
                    sink.state.activate();
                    tracing::trace!("Stream {} acknowledged", handle);
                    let _ = ack.send(Ok(message.payload));
                }
                StreamStep::Keep
            }
            ResponseType::Error => {
                let error = ServerError::from_payload(message.payload);
                match sink.ack.take() {
                    Some(ack) => {
                        let _ = ack.send(Err(ClientError::Query(error.clone())));
                        StreamStep::Remove(DropReason::Rejected(error))
                    }
                    None => {
                        let _ = sink.errors.send(ClientError::Query(error));
                        StreamStep::Keep
                    }
                }
            }
            ResponseType::Custom(SUBSCRIPTION_EVENT) => {
                let record = unwrap_result(message.payload);
                match sink.events.try_send(record) {
                    Ok(()) => StreamStep::Keep,
                    Err(TrySendError::Full(_)) => StreamStep::Remove(DropReason::BufferOverflow),
                    // Consumer dropped its subscription without unsubscribing.
                    Err(TrySendError::Disconnected(_)) => StreamStep::Remove(DropReason::Unsubscribed),
                }
            }
            ResponseType::Custom(SUBSCRIPTION_ERROR) => {
                let error = ServerError::from_payload(message.payload);
                tracing::warn!("Subscription {} reported error: {}", handle, error);
                let _ = sink.errors.send(ClientError::Query(error));
                StreamStep::Keep
            }
            other => {
                tracing::trace!("Ignoring {:?} message for stream {}", other, handle);
                StreamStep::Keep
            }
        }
    }

    fn teardown(&self, reason: &str) -> usize {
        let drained: Vec<(Handle, PendingCall)> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (handle, call) in drained {
            match call {
                PendingCall::Single { reply } => {
                    let _ = reply.send(Err(ClientError::Transport(reason.to_string())));
                }
                PendingCall::Stream(sink) => {
                    tracing::debug!("Cancelling stream {} on teardown", handle);
                    sink.close(DropReason::Disconnected(reason.to_string()));
                }
            }
        }
        count
    }
}

enum StreamStep {
    Keep,
    Remove(DropReason),
}

/// Subscription pushes carry the record as `{"result": record}`.
fn unwrap_result(mut payload: Value) -> Value {
    if let Value::Object(ref mut map) = payload {
        if let Some(record) = map.remove("result") {
            return record;
        }
    }
    payload
}

/// Inbound path handed to the transport.
///
/// Cheap to clone and callable from any thread.
#[derive(Clone)]
pub struct EventRouter {
    shared: Arc<Shared>,
}

impl EventRouter {
    /// Deliver a reply or push for `handle`. Unknown handles are ignored.
    pub fn route(&self, handle: Handle, message: InboundMessage) {
        self.shared.route(handle, message);
    }

    /// The connection was torn down: fail every outstanding call and cancel
    /// every subscription.
    pub fn connection_lost(&self, reason: &str) {
        let count = self.shared.teardown(reason);
        tracing::info!("Connection lost ({}), {} pending calls failed", reason, count);
    }
}

/// Owns the pending-call table and the transport.
pub struct RequestCorrelator {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
}

impl RequestCorrelator {
    /// Create a correlator and attach its router to `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            transport: Arc::downgrade(&transport),
        });
        transport.attach(EventRouter {
            shared: Arc::clone(&shared),
        });
        Self { shared, transport }
    }

    pub fn router(&self) -> EventRouter {
        EventRouter {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of outstanding calls and live streams.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Number of live streams.
    pub fn stream_count(&self) -> usize {
        self.shared
            .pending
            .lock()
            .values()
            .filter(|call| matches!(call, PendingCall::Stream(_)))
            .count()
    }

    pub fn is_registered(&self, handle: Handle) -> bool {
        self.shared.pending.lock().contains_key(&handle)
    }

    fn register(&self, call: PendingCall) -> Result<Handle> {
        let mut pending = self.shared.pending.lock();
        // Checked under the lock so a concurrent shutdown either sees the
        // entry or makes us refuse it.
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        let handle = loop {
            let candidate = Handle(self.shared.next_handle.fetch_add(1, Ordering::SeqCst));
            // 0 is never handed out; occupied values are skipped after wrap-around.
            if candidate.0 != 0 && !pending.contains_key(&candidate) {
                break candidate;
            }
        };
        pending.insert(handle, call);
        tracing::trace!("Registered pending call {}", handle);
        Ok(handle)
    }

    fn send(&self, handle: Handle, method: NetMethod, params: Value) -> Result<()> {
        tracing::trace!("Sending {} as {}", method, handle);
        if let Err(e) = self.transport.send(handle, method, params) {
            let call = self.shared.pending.lock().remove(&handle);
            if let Some(PendingCall::Stream(sink)) = call {
                sink.state.cancel(DropReason::Disconnected(e.to_string()));
            }
            return Err(match e {
                ClientError::Transport(_) => e,
                other => ClientError::Transport(other.to_string()),
            });
        }
        Ok(())
    }

    /// Send a single-shot request and block until its reply, transport
    /// teardown or `deadline`.
    pub fn dispatch(&self, method: NetMethod, params: Value, deadline: Option<Deadline>) -> Result<Value> {
        let (tx, rx) = bounded(1);
        let handle = self.register(PendingCall::Single { reply: tx })?;
        self.send(handle, method, params)?;
        self.wait_reply(handle, &rx, deadline)
    }

    /// Send a streaming request. Returns as soon as the request is sent; the
    /// receiver yields the server's acknowledgement.
    pub(crate) fn dispatch_stream(
        &self,
        method: NetMethod,
        params: Value,
        mut sink: StreamSink,
    ) -> Result<(Handle, Receiver<Reply>)> {
        let (ack_tx, ack_rx) = bounded(1);
        sink.ack = Some(ack_tx);
        let handle = self.register(PendingCall::Stream(sink))?;
        self.send(handle, method, params)?;
        Ok((handle, ack_rx))
    }

    /// Block on a reply channel. On deadline expiry the call is cancelled.
    pub(crate) fn wait_reply(
        &self,
        handle: Handle,
        rx: &Receiver<Reply>,
        deadline: Option<Deadline>,
    ) -> Result<Value> {
        let Some(deadline) = deadline else {
            return rx.recv().unwrap_or(Err(ClientError::Closed));
        };
        match rx.recv_deadline(deadline.at()) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => {
                // A reply racing with the deadline is discarded with the call.
                tracing::debug!("Call {} timed out after {:?}", handle, deadline.budget);
                self.cancel(handle);
                Err(deadline.timeout_error())
            }
            Err(RecvTimeoutError::Disconnected) => Err(ClientError::Closed),
        }
    }

    /// Remove the pending call for `handle` and tell the transport to stop
    /// producing messages for it. Returns false if nothing was registered.
    pub fn cancel(&self, handle: Handle) -> bool {
        let removed = self.shared.pending.lock().remove(&handle);
        let Some(call) = removed else {
            return false;
        };
        let cancellation = call.cancellation(handle);
        if let PendingCall::Stream(sink) = call {
            sink.close(DropReason::Unsubscribed);
        }
        if let Err(e) = self.transport.send_cancellation(cancellation) {
            tracing::warn!("Failed to send cancellation for {}: {}", handle, e);
        }
        true
    }

    /// Refuse new calls and fail everything outstanding.
    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let cancellations: Vec<Cancellation> = self
            .shared
            .pending
            .lock()
            .iter()
            .map(|(handle, call)| call.cancellation(*handle))
            .collect();
        for cancellation in cancellations {
            if let Err(e) = self.transport.send_cancellation(cancellation) {
                tracing::debug!(
                    "Cancellation of {} on shutdown failed: {}",
                    cancellation.handle,
                    e
                );
            }
        }
        let count = self.shared.teardown("client closed");
        tracing::info!("Correlator shut down, {} pending calls failed", count);
    }
}
