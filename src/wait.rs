//! Wait-for engine: block until a matching record exists or a deadline passes.
//!
//! With [`WaitStrategy::Watch`] the engine subscribes to the filter first and
//! only then queries for an existing match. Any record that becomes visible
//! after the query's snapshot is therefore already covered by the
//! subscription; the first of the two to produce a record wins and the
//! subscription is cancelled, which discards any duplicate.

use crate::correlator::{Deadline, RequestCorrelator};
use crate::error::{ClientError, Result};
use crate::query::{decode_reply, QueryEngine};
use crate::subscriptions::{DropReason, SubscriptionManager};
use crate::transport::NetMethod;
use crate::types::{ParamsOfWaitForCollection, ResultOfWaitForCollection};
use crossbeam_channel::{at, never, select, Receiver};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Server error code for an expired `net.wait_for_collection`.
pub const WAIT_FOR_TIMEOUT_CODE: i64 = 607;

/// Where the waiting happens.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Subscribe, query, then race the subscription against the deadline.
    #[default]
    Watch,
    /// Forward `net.wait_for_collection` and let the server wait.
    Server,
}

#[derive(Clone)]
pub struct WaitForEngine {
    correlator: Arc<RequestCorrelator>,
    queries: QueryEngine,
    subscriptions: SubscriptionManager,
    strategy: WaitStrategy,
    default_timeout: Duration,
    /// Extra time granted to the server beyond the wait timeout.
    server_grace: Duration,
}

impl WaitForEngine {
    pub fn new(
        correlator: Arc<RequestCorrelator>,
        queries: QueryEngine,
        subscriptions: SubscriptionManager,
    ) -> Self {
        Self {
            correlator,
            queries,
            subscriptions,
            strategy: WaitStrategy::default(),
            default_timeout: crate::client::DEFAULT_WAIT_TIMEOUT,
            server_grace: crate::client::DEFAULT_SERVER_WAIT_GRACE,
        }
    }

    pub fn with_strategy(mut self, strategy: WaitStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_server_grace(mut self, grace: Duration) -> Self {
        self.server_grace = grace;
        self
    }

    /// First record matching the filter, waiting up to the request's timeout
    /// (or the engine default) for one to appear.
    pub fn wait_for_collection(&self, params: &ParamsOfWaitForCollection) -> Result<Value> {
        let timeout = params.timeout_or(self.default_timeout);
        match self.strategy {
            WaitStrategy::Watch => self.watch(params, timeout),
            WaitStrategy::Server => self.server_side(params, timeout),
        }
    }

    fn watch(&self, params: &ParamsOfWaitForCollection, timeout: Duration) -> Result<Value> {
        let query = params.as_query();
        // None: too far out to represent, wait without a timer.
        let deadline = Deadline::after(timeout);

        if deadline.map_or(false, |d| d.is_expired()) {
            // Zero timeout: a single check, no subscription.
            return self
                .queries
                .query_collection_until(&query, None)?
                .into_iter()
                .next()
                .ok_or(ClientError::Timeout(timeout));
        }

        let (subscription, _errors_tx) = self
            .subscriptions
            .open(&params.as_subscription(), deadline)?;
        let handle = subscription.handle();

        let outcome = match self.queries.query_collection_until(&query, deadline) {
            Ok(records) => match records.into_iter().next() {
                Some(found) => Ok(found),
                None => race(subscription.receiver(), subscription.errors(), deadline, || {
                    subscription.drop_reason()
                }),
            },
            Err(e) => Err(e),
        };

        self.subscriptions.unsubscribe(handle);
        if outcome.is_ok() {
            tracing::trace!("Wait on {} satisfied", params.collection);
        }
        outcome
    }

    fn server_side(&self, params: &ParamsOfWaitForCollection, timeout: Duration) -> Result<Value> {
        let mut wire = params.clone();
        wire.timeout = Some(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));

        let deadline = Deadline::after(timeout.saturating_add(self.server_grace));
        let reply = self
            .correlator
            .dispatch(NetMethod::WaitForCollection, serde_json::to_value(&wire)?, deadline)
            .map_err(|e| match e {
                ClientError::Query(ref err) if err.code == WAIT_FOR_TIMEOUT_CODE => {
                    ClientError::Timeout(timeout)
                }
                ClientError::Timeout(_) => ClientError::Timeout(timeout),
                other => other,
            })?;
        let result: ResultOfWaitForCollection = decode_reply(NetMethod::WaitForCollection, reply)?;
        Ok(result.result)
    }
}

/// First record from the subscription, first error, or the deadline.
fn race<F>(
    records: &Receiver<Value>,
    errors: &Receiver<ClientError>,
    deadline: Option<Deadline>,
    drop_reason: F,
) -> Result<Value>
where
    F: Fn() -> Option<DropReason>,
{
    let timer = deadline.map_or_else(never, |d| at(d.at()));
    let mut errors_open = true;
    loop {
        let errors = if errors_open { errors.clone() } else { never() };
        select! {
            recv(records) -> msg => {
                return match msg {
                    Ok(record) => Ok(record),
                    Err(_) => Err(drop_reason()
                        .map(|reason| reason.to_error())
                        .unwrap_or(ClientError::Closed)),
                };
            }
            recv(errors) -> msg => match msg {
                Ok(e) => return Err(e),
                Err(_) => errors_open = false,
            },
            recv(timer) -> _ => {
                return Err(deadline.map_or(ClientError::Closed, |d| d.timeout_error()));
            }
        }
    }
}
