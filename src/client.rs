//! Main client struct tying all engines together.

use crate::correlator::{Deadline, EventRouter, RequestCorrelator};
use crate::error::Result;
use crate::query::QueryEngine;
use crate::subscriptions::{CallbackSubscription, Subscription, SubscriptionHandle, SubscriptionManager};
use crate::transport::{NetMethod, Transport};
use crate::types::{
    ParamsOfQuery, ParamsOfQueryCollection, ParamsOfSubscribeCollection, ParamsOfWaitForCollection,
};
use crate::wait::{WaitForEngine, WaitStrategy};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

/// Wait-for timeout used when the request does not carry one.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(40);

/// Extra time given to the server beyond a server-side wait's own timeout.
pub const DEFAULT_SERVER_WAIT_GRACE: Duration = Duration::from_secs(1);

/// Client configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Deadline for one-shot requests and subscription acknowledgements
    /// (None = wait for the reply or teardown).
    pub request_timeout: Option<Duration>,

    /// Wait-for timeout when the request carries none.
    pub wait_timeout: Duration,

    /// How wait-for requests are served.
    pub wait_strategy: WaitStrategy,

    /// Extra time granted to server-side waits.
    pub server_wait_grace: Duration,

    /// Max queued records per subscription (None = unbounded).
    /// Subscriptions that overflow are dropped.
    pub subscription_buffer: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: None,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            wait_strategy: WaitStrategy::Watch,
            server_wait_grace: DEFAULT_SERVER_WAIT_GRACE,
            subscription_buffer: None,
        }
    }
}

/// The collection client.
///
/// Provides a unified interface for:
/// - One-shot filtered queries and raw queries
/// - Blocking waits for a matching record
/// - Long-lived subscriptions and their cancellation
///
/// Each client owns its own correlator, so several clients can share a
/// process without seeing each other's handles. Dropping the client fails
/// every outstanding call and cancels every subscription.
pub struct NetClient {
    config: ClientConfig,
    correlator: Arc<RequestCorrelator>,
    queries: QueryEngine,
    waits: WaitForEngine,
    subscriptions: SubscriptionManager,
}

impl NetClient {
    /// Create a client on top of `transport`.
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let correlator = Arc::new(RequestCorrelator::new(transport));
        let queries = QueryEngine::new(Arc::clone(&correlator), config.request_timeout);
        let subscriptions =
            SubscriptionManager::with_buffer_size(Arc::clone(&correlator), config.subscription_buffer)
                .with_ack_timeout(config.request_timeout);
        let waits = WaitForEngine::new(Arc::clone(&correlator), queries.clone(), subscriptions.clone())
            .with_strategy(config.wait_strategy)
            .with_default_timeout(config.wait_timeout)
            .with_server_grace(config.server_wait_grace);

        Self {
            config,
            correlator,
            queries,
            waits,
            subscriptions,
        }
    }

    pub fn with_defaults(transport: Arc<dyn Transport>) -> Self {
        Self::new(transport, ClientConfig::default())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Inbound path, also handed to the transport on construction.
    pub fn router(&self) -> EventRouter {
        self.correlator.router()
    }

    // --- Queries ---

    /// Records matching `params.filter`, ordered by `params.order` and
    /// limited to `params.limit`. No match yields an empty vector.
    pub fn query_collection(&self, params: &ParamsOfQueryCollection) -> Result<Vec<Value>> {
        self.queries.query_collection(params)
    }

    pub fn query_collection_as<T: DeserializeOwned>(
        &self,
        params: &ParamsOfQueryCollection,
    ) -> Result<Vec<T>> {
        self.queries.query_collection_as(params)
    }

    /// Raw pass-through query.
    pub fn query(&self, params: &ParamsOfQuery) -> Result<Value> {
        self.queries.query(params)
    }

    // --- Waiting ---

    /// Existing record matching the filter, or the first one to appear
    /// before the timeout.
    pub fn wait_for_collection(&self, params: &ParamsOfWaitForCollection) -> Result<Value> {
        self.waits.wait_for_collection(params)
    }

    // --- Subscriptions ---

    pub fn subscribe_collection(&self, params: &ParamsOfSubscribeCollection) -> Result<Subscription> {
        self.subscriptions.subscribe(params)
    }

    pub fn subscribe_collection_with<F, E>(
        &self,
        params: &ParamsOfSubscribeCollection,
        callback: F,
    ) -> Result<CallbackSubscription>
    where
        F: FnMut(Value) -> std::result::Result<(), E> + Send + 'static,
        E: Display,
    {
        self.subscriptions.subscribe_with(params, callback)
    }

    /// Cancel a subscription. Safe to call more than once.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.subscriptions.unsubscribe(handle);
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.subscription_count()
    }

    /// Outstanding calls plus live subscriptions.
    pub fn pending_calls(&self) -> usize {
        self.correlator.pending_count()
    }

    // --- Network activity ---

    /// Ask the server side to stop all network activity.
    pub fn suspend(&self) -> Result<()> {
        self.control(NetMethod::Suspend)
    }

    /// Resume network activity after [`suspend`](Self::suspend).
    pub fn resume(&self) -> Result<()> {
        self.control(NetMethod::Resume)
    }

    fn control(&self, method: NetMethod) -> Result<()> {
        self.correlator.dispatch(
            method,
            Value::Object(Default::default()),
            self.config.request_timeout.and_then(Deadline::after),
        )?;
        tracing::debug!("{} acknowledged", method);
        Ok(())
    }

    /// Fail every outstanding call, cancel every subscription and refuse
    /// further requests.
    pub fn close(&self) {
        self.correlator.shutdown();
    }
}

impl Drop for NetClient {
    fn drop(&mut self) {
        self.close();
    }
}
