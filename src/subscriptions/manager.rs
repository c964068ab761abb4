//! Subscription engine: opening, dispatching and cancelling watches.

use crate::correlator::{Deadline, RequestCorrelator, StreamSink};
use crate::error::{ClientError, Result};
use crate::transport::NetMethod;
use crate::types::{ParamsOfSubscribeCollection, ResultOfSubscribeCollection};
use crossbeam_channel::{bounded, unbounded, Sender};
use serde_json::Value;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::types::{CallbackSubscription, StateCell, Subscription, SubscriptionHandle};

/// Opens and cancels subscriptions on top of a shared correlator.
#[derive(Clone)]
pub struct SubscriptionManager {
    correlator: Arc<RequestCorrelator>,
    /// Max queued records per subscription (None = unbounded).
    buffer_size: Option<usize>,
    /// How long to wait for the server to acknowledge (None = forever).
    ack_timeout: Option<Duration>,
}

impl SubscriptionManager {
    pub fn new(correlator: Arc<RequestCorrelator>) -> Self {
        Self {
            correlator,
            buffer_size: None,
            ack_timeout: None,
        }
    }

    /// Bound the per-subscription queue. A subscription whose queue fills up
    /// is dropped with [`DropReason::BufferOverflow`](super::DropReason).
    /// A size of 0 is treated as 1.
    pub fn with_buffer_size(correlator: Arc<RequestCorrelator>, buffer_size: Option<usize>) -> Self {
        Self {
            correlator,
            buffer_size,
            ack_timeout: None,
        }
    }

    pub fn with_ack_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Create a subscription.
    ///
    /// Returns once the server has acknowledged it, so the returned
    /// subscription is always `Active`.
    pub fn subscribe(&self, params: &ParamsOfSubscribeCollection) -> Result<Subscription> {
        self.open(params, self.ack_deadline()).map(|(sub, _)| sub)
    }

    /// Create a subscription whose records are handed to `callback` on a
    /// dedicated thread.
    ///
    /// A failing or panicking callback is reported as
    /// [`ClientError::Callback`] on the error sink; the subscription stays
    /// active and the next record is delivered as usual.
    pub fn subscribe_with<F, E>(
        &self,
        params: &ParamsOfSubscribeCollection,
        callback: F,
    ) -> Result<CallbackSubscription>
    where
        F: FnMut(Value) -> std::result::Result<(), E> + Send + 'static,
        E: Display,
    {
        let (subscription, errors_tx) = self.open(params, self.ack_deadline())?;
        let handle = subscription.handle;
        let state = Arc::clone(&subscription.state);
        let errors = subscription.errors.clone();

        let worker = thread::Builder::new()
            .name(format!("subscription-{}", handle))
            .spawn(move || run_callback(subscription, errors_tx, callback))
            .map_err(|e| {
                self.correlator.cancel(handle.0);
                ClientError::Callback(format!("failed to spawn dispatcher: {}", e))
            })?;

        Ok(CallbackSubscription {
            handle,
            state,
            errors,
            worker: Some(worker),
            correlator: Arc::clone(&self.correlator),
        })
    }

    /// Cancel a subscription. Calling it again, or for an unknown handle,
    /// does nothing.
    ///
    /// A record being handed to a callback while this runs may still finish
    /// its callback; no record is yielded after this returns.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        if self.correlator.cancel(handle.0) {
            tracing::debug!("Unsubscribed {}", handle);
        }
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.correlator.stream_count()
    }

    fn ack_deadline(&self) -> Option<Deadline> {
        self.ack_timeout.and_then(Deadline::after)
    }

    pub(crate) fn open(
        &self,
        params: &ParamsOfSubscribeCollection,
        deadline: Option<Deadline>,
    ) -> Result<(Subscription, Sender<ClientError>)> {
        let (events_tx, events_rx) = match self.buffer_size {
            // A zero-capacity channel would overflow on every push.
            Some(size) => bounded(size.max(1)),
            None => unbounded(),
        };
        let (errors_tx, errors_rx) = unbounded();
        let state = Arc::new(StateCell::new());

        let sink = StreamSink::new(events_tx, errors_tx.clone(), Arc::clone(&state));
        let (handle, ack) = self.correlator.dispatch_stream(
            NetMethod::SubscribeCollection,
            serde_json::to_value(params)?,
            sink,
        )?;

        let reply = self.correlator.wait_reply(handle, &ack, deadline)?;
        let server_handle = match serde_json::from_value::<ResultOfSubscribeCollection>(reply) {
            Ok(result) => result.handle,
            Err(e) => {
                self.correlator.cancel(handle);
                return Err(ClientError::UnexpectedResponse(format!(
                    "subscription acknowledgement: {}",
                    e
                )));
            }
        };

        tracing::debug!(
            "Subscribed to {} as {} (server handle {})",
            params.collection,
            handle,
            server_handle
        );

        Ok((
            Subscription {
                handle: SubscriptionHandle(handle),
                server_handle,
                state,
                receiver: events_rx,
                errors: errors_rx,
            },
            errors_tx,
        ))
    }
}

fn run_callback<F, E>(subscription: Subscription, errors: Sender<ClientError>, mut callback: F)
where
    F: FnMut(Value) -> std::result::Result<(), E>,
    E: Display,
{
    let handle = subscription.handle;
    while let Ok(record) = subscription.recv() {
        let failure = match panic::catch_unwind(AssertUnwindSafe(|| callback(record))) {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(payload) => panic_message(payload.as_ref()),
        };
        tracing::warn!("Callback for subscription {} failed: {}", handle, failure);
        let _ = errors.send(ClientError::Callback(failure));
    }
    tracing::trace!("Dispatcher for subscription {} exiting", handle);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("callback panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("callback panicked: {}", msg)
    } else {
        "callback panicked".to_string()
    }
}
