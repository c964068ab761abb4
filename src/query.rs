//! Collection query engine: one-shot filtered reads and raw queries.

use crate::correlator::{Deadline, RequestCorrelator};
use crate::error::{ClientError, Result};
use crate::transport::NetMethod;
use crate::types::{ParamsOfQuery, ParamsOfQueryCollection, ResultOfQuery, ResultOfQueryCollection};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Issues one-shot queries. Stateless beyond the shared correlator; no retries.
#[derive(Clone)]
pub struct QueryEngine {
    correlator: Arc<RequestCorrelator>,
    request_timeout: Option<Duration>,
}

impl QueryEngine {
    pub fn new(correlator: Arc<RequestCorrelator>, request_timeout: Option<Duration>) -> Self {
        Self {
            correlator,
            request_timeout,
        }
    }

    /// Records matching the filter, ordered and limited server-side.
    /// No match yields an empty vector.
    pub fn query_collection(&self, params: &ParamsOfQueryCollection) -> Result<Vec<Value>> {
        self.query_collection_until(params, self.request_timeout.and_then(Deadline::after))
    }

    /// [`query_collection`](Self::query_collection) with each record decoded
    /// into `T`.
    pub fn query_collection_as<T: DeserializeOwned>(
        &self,
        params: &ParamsOfQueryCollection,
    ) -> Result<Vec<T>> {
        self.query_collection(params)?
            .into_iter()
            .map(|record| serde_json::from_value(record).map_err(ClientError::from))
            .collect()
    }

    /// Raw pass-through query.
    pub fn query(&self, params: &ParamsOfQuery) -> Result<Value> {
        let reply = self.correlator.dispatch(
            NetMethod::Query,
            serde_json::to_value(params)?,
            self.request_timeout.and_then(Deadline::after),
        )?;
        let result: ResultOfQuery = decode_reply(NetMethod::Query, reply)?;
        Ok(result.result)
    }

    pub(crate) fn query_collection_until(
        &self,
        params: &ParamsOfQueryCollection,
        deadline: Option<Deadline>,
    ) -> Result<Vec<Value>> {
        let reply = self.correlator.dispatch(
            NetMethod::QueryCollection,
            serde_json::to_value(params)?,
            deadline,
        )?;
        let result: ResultOfQueryCollection = decode_reply(NetMethod::QueryCollection, reply)?;
        tracing::trace!(
            "Query on {} returned {} records",
            params.collection,
            result.result.len()
        );
        Ok(result.result)
    }
}

pub(crate) fn decode_reply<T: DeserializeOwned>(method: NetMethod, reply: Value) -> Result<T> {
    serde_json::from_value(reply)
        .map_err(|e| ClientError::UnexpectedResponse(format!("{}: {}", method, e)))
}
