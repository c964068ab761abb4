//! Core request and result types for the collection client.
//!
//! Field names in these types are part of the wire contract and are kept
//! verbatim (`collection`, `filter`, `result`, `order`, `limit`, `timeout`).

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// Correlation identifier for an outstanding request or subscription.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(pub u32);

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.0)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-side predicate: field name to comparison expression.
///
/// The client never interprets the filter, it is passed through as-is.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionFilter(pub Map<String, Value>);

impl CollectionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `{field: {eq: value}}`
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new().with(field, "eq", value)
    }

    /// Add a comparison for `field`. Several operators on the same field are
    /// merged into one expression object.
    pub fn with(mut self, field: impl Into<String>, op: &str, value: impl Into<Value>) -> Self {
        let entry = self
            .0
            .entry(field.into())
            .or_insert_with(|| Value::Object(Map::new()));
        match entry {
            Value::Object(expr) => {
                expr.insert(op.to_string(), value.into());
            }
            other => {
                let mut expr = Map::new();
                expr.insert(op.to_string(), value.into());
                *other = Value::Object(expr);
            }
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for CollectionFilter {
    fn from(map: Map<String, Value>) -> Self {
        CollectionFilter(map)
    }
}

/// Ordered list of fields the caller wants back for each record.
///
/// Sent on the wire as the space separated `result` string.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResultProjection(Vec<String>);

impl ResultProjection {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ResultProjection(fields.into_iter().map(Into::into).collect())
    }

    pub fn fields(&self) -> &[String] {
        &self.0
    }

    pub fn to_wire(&self) -> String {
        self.0.join(" ")
    }
}

impl From<&str> for ResultProjection {
    fn from(s: &str) -> Self {
        ResultProjection::new(s.split_whitespace())
    }
}

impl Serialize for ResultProjection {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_wire())
    }
}

impl<'de> Deserialize<'de> for ResultProjection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer).map_err(de::Error::custom)?;
        Ok(ResultProjection::from(s.as_str()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    #[serde(rename = "ASC")]
    Asc,
    #[serde(rename = "DESC")]
    Desc,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub path: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// One-shot filtered read of a collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamsOfQueryCollection {
    pub collection: String,
    pub filter: Option<CollectionFilter>,
    pub result: ResultProjection,
    #[serde(default)]
    pub order: Vec<OrderBy>,
    pub limit: Option<u32>,
}

impl ParamsOfQueryCollection {
    pub fn new(collection: impl Into<String>, result: impl Into<ResultProjection>) -> Self {
        Self {
            collection: collection.into(),
            filter: None,
            result: result.into(),
            order: Vec::new(),
            limit: None,
        }
    }

    pub fn filter(mut self, filter: CollectionFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn order(mut self, order: OrderBy) -> Self {
        self.order.push(order);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultOfQueryCollection {
    pub result: Vec<Value>,
}

/// Blocking query: returns the first record matching `filter`, waiting at
/// most `timeout` milliseconds for one to appear.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamsOfWaitForCollection {
    pub collection: String,
    pub filter: Option<CollectionFilter>,
    pub result: ResultProjection,
    pub timeout: Option<u32>,
}

impl ParamsOfWaitForCollection {
    pub fn new(collection: impl Into<String>, result: impl Into<ResultProjection>) -> Self {
        Self {
            collection: collection.into(),
            filter: None,
            result: result.into(),
            timeout: None,
        }
    }

    pub fn filter(mut self, filter: CollectionFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        self
    }

    /// Effective timeout, falling back to `default` when none was given.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout
            .map(|ms| Duration::from_millis(u64::from(ms)))
            .unwrap_or(default)
    }

    /// The direct query issued before (or instead of) watching.
    pub fn as_query(&self) -> ParamsOfQueryCollection {
        ParamsOfQueryCollection {
            collection: self.collection.clone(),
            filter: self.filter.clone(),
            result: self.result.clone(),
            order: Vec::new(),
            limit: Some(1),
        }
    }

    /// The transient watch used while waiting.
    pub fn as_subscription(&self) -> ParamsOfSubscribeCollection {
        ParamsOfSubscribeCollection {
            collection: self.collection.clone(),
            filter: self.filter.clone(),
            result: self.result.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultOfWaitForCollection {
    pub result: Value,
}

/// Long-lived watch for inserts and updates matching `filter`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamsOfSubscribeCollection {
    pub collection: String,
    pub filter: Option<CollectionFilter>,
    pub result: ResultProjection,
}

impl ParamsOfSubscribeCollection {
    pub fn new(collection: impl Into<String>, result: impl Into<ResultProjection>) -> Self {
        Self {
            collection: collection.into(),
            filter: None,
            result: result.into(),
        }
    }

    pub fn filter(mut self, filter: CollectionFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultOfSubscribeCollection {
    pub handle: u32,
}

/// Raw pass-through query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamsOfQuery {
    pub query: String,
    pub variables: Option<Value>,
}

impl ParamsOfQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: None,
        }
    }

    pub fn variables(mut self, variables: Value) -> Self {
        self.variables = Some(variables);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultOfQuery {
    pub result: Value,
}
