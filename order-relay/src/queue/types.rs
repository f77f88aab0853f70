//! Message and routing types for the headers-exchange protocol.
//!
//! Orders are routed by comparing message headers against queue binding
//! arguments, never by routing-key string:
//!
//! ```text
//! headers {object_type, routing_key} ──▶ headers exchange ──(x-match: all)──▶ queue
//! ```

use std::collections::BTreeMap;
use std::fmt;

use lapin::types::{AMQPValue, FieldTable};
use serde_json::Value;

use super::error::BrokerError;

/// Default queue name for order events.
pub const ORDERS_QUEUE: &str = "orders";

/// Default `object_type` header value.
pub const DEFAULT_OBJECT_TYPE: &str = "order";

/// Default `routing_key` header value.
pub const DEFAULT_ROUTING_KEY: &str = "store";

/// Header carrying the kind of object in the body.
pub const OBJECT_TYPE_HEADER: &str = "object_type";

/// Header naming the destination system.
pub const ROUTING_KEY_HEADER: &str = "routing_key";

/// Binding argument selecting all/any matching.
pub const X_MATCH_ARGUMENT: &str = "x-match";

/// Content type of every published body.
pub const JSON_CONTENT_TYPE: &str = "application/json";

// =============================================================================
// Routing Headers
// =============================================================================

/// Headers attached to a published message.
///
/// `object_type` and `routing_key` are always present; any extra string
/// headers travel with the message but do not take part in the binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingHeaders {
    pub object_type: String,
    pub routing_key: String,
    pub extra: BTreeMap<String, String>,
}

impl RoutingHeaders {
    pub fn new(object_type: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            routing_key: routing_key.into(),
            extra: BTreeMap::new(),
        }
    }

    /// Add an extra header. The two routing headers cannot be overwritten this way.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        match key.as_str() {
            OBJECT_TYPE_HEADER => self.object_type = value.into(),
            ROUTING_KEY_HEADER => self.routing_key = value.into(),
            _ => {
                self.extra.insert(key, value.into());
            }
        }
        self
    }

    /// All headers as a flat string map, routing headers included.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = self.extra.clone();
        map.insert(OBJECT_TYPE_HEADER.to_string(), self.object_type.clone());
        map.insert(ROUTING_KEY_HEADER.to_string(), self.routing_key.clone());
        map
    }
}

impl Default for RoutingHeaders {
    fn default() -> Self {
        Self::new(DEFAULT_OBJECT_TYPE, DEFAULT_ROUTING_KEY)
    }
}

impl From<&RoutingHeaders> for FieldTable {
    fn from(headers: &RoutingHeaders) -> Self {
        string_table(headers.to_map())
    }
}

// =============================================================================
// Binding Arguments
// =============================================================================

/// How binding arguments are compared with message headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XMatch {
    /// Every match key must be present with an equal value.
    #[default]
    All,
    /// At least one match key must be present with an equal value.
    Any,
}

impl XMatch {
    pub fn as_str(&self) -> &'static str {
        match self {
            XMatch::All => "all",
            XMatch::Any => "any",
        }
    }
}

impl fmt::Display for XMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arguments of a queue binding on a headers exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingArguments {
    pub x_match: XMatch,
    pub matches: BTreeMap<String, String>,
}

impl BindingArguments {
    /// `x-match: all` over the two routing headers.
    pub fn all(headers: &RoutingHeaders) -> Self {
        Self {
            x_match: XMatch::All,
            matches: routing_matches(headers),
        }
    }

    /// `x-match: any` over the two routing headers.
    pub fn any(headers: &RoutingHeaders) -> Self {
        Self {
            x_match: XMatch::Any,
            matches: routing_matches(headers),
        }
    }

    /// Whether a message carrying `headers` routes through this binding.
    ///
    /// Keys starting with `x-` are broker directives and never compared.
    pub fn matches(&self, headers: &BTreeMap<String, String>) -> bool {
        let mut keys = self.matches.iter().filter(|(k, _)| !k.starts_with("x-"));
        let hit = |(k, v): (&String, &String)| headers.get(k) == Some(v);

        match self.x_match {
            XMatch::All => keys.all(hit),
            XMatch::Any => keys.any(hit),
        }
    }
}

impl From<&BindingArguments> for FieldTable {
    fn from(arguments: &BindingArguments) -> Self {
        let mut table = string_table(arguments.matches.clone());
        table.insert(
            X_MATCH_ARGUMENT.into(),
            AMQPValue::LongString(arguments.x_match.as_str().into()),
        );
        table
    }
}

fn routing_matches(headers: &RoutingHeaders) -> BTreeMap<String, String> {
    BTreeMap::from([
        (OBJECT_TYPE_HEADER.to_string(), headers.object_type.clone()),
        (ROUTING_KEY_HEADER.to_string(), headers.routing_key.clone()),
    ])
}

fn string_table(entries: BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in entries {
        table.insert(key.into(), AMQPValue::LongString(value.into()));
    }
    table
}

// =============================================================================
// Envelope
// =============================================================================

/// A JSON payload addressed to a headers exchange and a bound queue.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    pub exchange: String,
    pub payload: Value,
    pub headers: RoutingHeaders,
    pub queue: String,
}

impl MessageEnvelope {
    /// Envelope with the default routing headers and the `orders` queue.
    pub fn new(exchange: impl Into<String>, payload: Value) -> Self {
        Self {
            exchange: exchange.into(),
            payload,
            headers: RoutingHeaders::default(),
            queue: ORDERS_QUEUE.to_string(),
        }
    }

    pub fn with_headers(mut self, headers: RoutingHeaders) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Serialize the payload into a persistent outgoing message.
    pub fn to_outgoing(&self) -> Result<OutgoingMessage, BrokerError> {
        Ok(OutgoingMessage {
            body: serde_json::to_vec(&self.payload)?,
            headers: self.headers.clone(),
            persistent: true,
        })
    }
}

/// Bytes and properties handed to the broker for one publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub headers: RoutingHeaders,
    pub persistent: bool,
}
