//! In-memory collection server used as the transport in integration tests.

#![allow(dead_code)]

use collection_net::{
    Cancellation, ClientConfig, ClientError, EventRouter, Handle, InboundMessage, NetClient, NetMethod,
    ParamsOfQueryCollection, ParamsOfSubscribeCollection, ParamsOfWaitForCollection, Result,
    ServerError, SortDirection, Transport, WAIT_FOR_TIMEOUT_CODE,
};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const UNKNOWN_COLLECTION: i64 = 601;
pub const INVALID_FILTER: i64 = 602;

/// Server handles are offset from the client's handles so that mixing the
/// two up is caught.
pub const SERVER_HANDLE_OFFSET: u32 = 1000;

struct Watch {
    server_handle: u32,
    collection: String,
    filter: Option<Value>,
    fields: Vec<String>,
}

/// Serves queries and subscriptions from in-memory collections. Replies are
/// routed synchronously from inside `send`; inserts push to matching
/// subscriptions from the inserting thread.
#[derive(Default)]
pub struct FakeServer {
    router: Mutex<Option<EventRouter>>,
    collections: Mutex<HashMap<String, Vec<Value>>>,
    watches: Mutex<HashMap<Handle, Watch>>,
    sent: Mutex<Vec<(NetMethod, Value)>>,
    cancelled: Mutex<Vec<Handle>>,
    /// Server handles named by `net.unsubscribe` requests.
    unsubscribed: Mutex<Vec<u32>>,
    offline: AtomicBool,
    suspended: AtomicBool,
    /// Leave subscription requests unacknowledged.
    silent_subscribe: AtomicBool,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_collection(self: &Arc<Self>, name: &str) -> Arc<Self> {
        self.collections.lock().entry(name.to_string()).or_default();
        Arc::clone(self)
    }

    /// Store a record and push it to every matching subscription.
    pub fn insert(&self, collection: &str, record: Value) {
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .push(record.clone());

        let targets: Vec<(Handle, Value)> = self
            .watches
            .lock()
            .iter()
            .filter(|(_, watch)| watch.collection == collection)
            .filter(|(_, watch)| matches_filter(&record, watch.filter.as_ref()).unwrap_or(false))
            .map(|(handle, watch)| (*handle, project(&record, &watch.fields)))
            .collect();

        for (handle, projected) in targets {
            self.route(handle, InboundMessage::event(projected));
        }
    }

    pub fn route(&self, handle: Handle, message: InboundMessage) {
        let router = self.router.lock().clone();
        if let Some(router) = router {
            router.route(handle, message);
        }
    }

    pub fn drop_connection(&self, reason: &str) {
        self.watches.lock().clear();
        let router = self.router.lock().clone();
        if let Some(router) = router {
            router.connection_lost(reason);
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_silent_subscribe(&self, silent: bool) {
        self.silent_subscribe.store(silent, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn watch_handles(&self) -> Vec<Handle> {
        let mut handles: Vec<Handle> = self.watches.lock().keys().copied().collect();
        handles.sort();
        handles
    }

    pub fn cancelled(&self) -> Vec<Handle> {
        self.cancelled.lock().clone()
    }

    pub fn unsubscribed(&self) -> Vec<u32> {
        self.unsubscribed.lock().clone()
    }

    pub fn sent_methods(&self) -> Vec<NetMethod> {
        self.sent.lock().iter().map(|(method, _)| *method).collect()
    }

    pub fn last_params(&self, method: NetMethod) -> Option<Value> {
        self.sent
            .lock()
            .iter()
            .rev()
            .find(|(m, _)| *m == method)
            .map(|(_, params)| params.clone())
    }

    fn handle_query(&self, params: Value) -> InboundMessage {
        let params: ParamsOfQueryCollection = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return error(INVALID_FILTER, &e.to_string()),
        };
        let collections = self.collections.lock();
        let Some(records) = collections.get(&params.collection) else {
            return error(UNKNOWN_COLLECTION, "unknown collection");
        };
        let filter = params.filter.as_ref().map(|f| Value::Object(f.0.clone()));

        let mut found = Vec::new();
        for record in records {
            match matches_filter(record, filter.as_ref()) {
                Ok(true) => found.push(record.clone()),
                Ok(false) => {}
                Err(msg) => return error(INVALID_FILTER, &msg),
            }
        }

        found.sort_by(|a, b| {
            for order in &params.order {
                let ord = compare(&a[&order.path], &b[&order.path]);
                let ord = match order.direction {
                    SortDirection::Asc => ord,
                    SortDirection::Desc => ord.reverse(),
                };
                if ord != CmpOrdering::Equal {
                    return ord;
                }
            }
            CmpOrdering::Equal
        });
        if let Some(limit) = params.limit {
            found.truncate(limit as usize);
        }

        let fields = params.result.fields().to_vec();
        let projected: Vec<Value> = found.iter().map(|r| project(r, &fields)).collect();
        InboundMessage::success(json!({ "result": projected }))
    }

    fn handle_subscribe(&self, handle: Handle, params: Value) -> Option<InboundMessage> {
        let params: ParamsOfSubscribeCollection = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return Some(error(INVALID_FILTER, &e.to_string())),
        };
        if !self.collections.lock().contains_key(&params.collection) {
            return Some(error(UNKNOWN_COLLECTION, "unknown collection"));
        }
        let filter = params.filter.as_ref().map(|f| Value::Object(f.0.clone()));
        if let Err(msg) = matches_filter(&json!({}), filter.as_ref()) {
            return Some(error(INVALID_FILTER, &msg));
        }
        let server_handle = handle.0 + SERVER_HANDLE_OFFSET;
        self.watches.lock().insert(
            handle,
            Watch {
                server_handle,
                collection: params.collection,
                filter,
                fields: params.result.fields().to_vec(),
            },
        );
        if self.silent_subscribe.load(Ordering::SeqCst) {
            return None;
        }
        Some(InboundMessage::success(json!({ "handle": server_handle })))
    }

    fn handle_wait(&self, params: Value) -> InboundMessage {
        let params: ParamsOfWaitForCollection = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => return error(INVALID_FILTER, &e.to_string()),
        };
        match self.handle_query(serde_json::to_value(params.as_query()).unwrap_or_default()) {
            msg if msg.response_type == collection_net::ResponseType::Success => {
                match msg.payload["result"].get(0) {
                    Some(found) => InboundMessage::success(json!({ "result": found })),
                    None => error(WAIT_FOR_TIMEOUT_CODE, "wait for operation timed out"),
                }
            }
            err => err,
        }
    }
}

impl Transport for FakeServer {
    fn attach(&self, router: EventRouter) {
        *self.router.lock() = Some(router);
    }

    fn send(&self, handle: Handle, method: NetMethod, params: Value) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("connection refused".to_string()));
        }
        self.sent.lock().push((method, params.clone()));

        let reply = match method {
            NetMethod::QueryCollection => Some(self.handle_query(params)),
            NetMethod::SubscribeCollection => self.handle_subscribe(handle, params),
            NetMethod::WaitForCollection => Some(self.handle_wait(params)),
            NetMethod::Query => Some(InboundMessage::success(json!({
                "result": {"data": {"echo": params}}
            }))),
            NetMethod::Suspend => {
                self.suspended.store(true, Ordering::SeqCst);
                Some(InboundMessage::success(json!({})))
            }
            NetMethod::Resume => {
                self.suspended.store(false, Ordering::SeqCst);
                Some(InboundMessage::success(json!({})))
            }
            NetMethod::Unsubscribe => None,
        };

        if let Some(reply) = reply {
            self.route(handle, reply);
        }
        Ok(())
    }

    fn send_cancellation(&self, cancellation: Cancellation) -> Result<()> {
        let mut watches = self.watches.lock();
        match cancellation.unsubscribe_request() {
            Some((NetMethod::Unsubscribe, params)) => {
                // The server only knows its own handles.
                let server_handle = params["handle"].as_u64().unwrap_or_default() as u32;
                watches.retain(|_, watch| watch.server_handle != server_handle);
                self.unsubscribed.lock().push(server_handle);
            }
            _ => {
                watches.remove(&cancellation.handle);
            }
        }
        drop(watches);
        self.cancelled.lock().push(cancellation.handle);
        Ok(())
    }
}

fn error(code: i64, message: &str) -> InboundMessage {
    InboundMessage::error(&ServerError {
        code,
        message: message.to_string(),
        data: Value::Null,
    })
}

fn compare(a: &Value, b: &Value) -> CmpOrdering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(CmpOrdering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Null, Value::Null) => CmpOrdering::Equal,
        (Value::Null, _) => CmpOrdering::Less,
        (_, Value::Null) => CmpOrdering::Greater,
        _ => CmpOrdering::Equal,
    }
}

/// Evaluate a `{field: {op: value}}` filter. Unknown operators are errors.
fn matches_filter(record: &Value, filter: Option<&Value>) -> std::result::Result<bool, String> {
    let Some(Value::Object(fields)) = filter else {
        return Ok(true);
    };
    let mut all = true;
    for (field, expr) in fields {
        let Value::Object(ops) = expr else {
            return Err(format!("expression for {} must be an object", field));
        };
        for (op, operand) in ops {
            let actual = &record[field];
            let ok = match op.as_str() {
                "eq" => actual == operand,
                "ne" => actual != operand,
                "gt" => compare(actual, operand) == CmpOrdering::Greater,
                "lt" => compare(actual, operand) == CmpOrdering::Less,
                "ge" => compare(actual, operand) != CmpOrdering::Less,
                "le" => compare(actual, operand) != CmpOrdering::Greater,
                "in" => operand.as_array().map_or(false, |set| set.contains(actual)),
                "notIn" => operand.as_array().map_or(true, |set| !set.contains(actual)),
                other => return Err(format!("unknown operator {}", other)),
            };
            all &= ok;
        }
    }
    Ok(all)
}

fn project(record: &Value, fields: &[String]) -> Value {
    if fields.is_empty() {
        return record.clone();
    }
    let mut out = Map::new();
    for field in fields {
        if let Some(value) = record.get(field) {
            out.insert(field.clone(), value.clone());
        }
    }
    Value::Object(out)
}

pub fn client(server: &Arc<FakeServer>) -> NetClient {
    NetClient::new(server.clone(), ClientConfig::default())
}

pub fn client_with(server: &Arc<FakeServer>, config: ClientConfig) -> NetClient {
    NetClient::new(server.clone(), config)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
