//! Messages, deliveries and the headers that carry cascade state.
//!
//! All retry state lives in three headers on the message itself:
//! - [`RETRIED_COUNT`]: number of prior retry attempts (decimal, default 0).
//! - [`ORIGINAL_EXCHANGE`] / [`ORIGINAL_ROUTING_KEY`]: where the message returns after its
//!   backoff; written on the first failure and preserved afterwards.
//!
//! The per-message TTL is the broker-native expiration field, carried on
//! [`OutboundMessage::expiration`] rather than in the header map.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Header holding the number of prior retry attempts.
pub const RETRIED_COUNT: &str = "x-retried-count";
/// Header holding the exchange the message was first received on.
pub const ORIGINAL_EXCHANGE: &str = "x-original-exchange";
/// Header holding the routing key the message was first received with.
pub const ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";

/// A header the cascade depends on could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("header `{name}` has malformed value `{value}`")]
    Malformed { name: &'static str, value: String },
}

/// String headers of a message. Keys are unique; order is irrelevant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Insert or replace a header, returning the previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(name.into(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Prior retry attempts recorded on the message; `0` when the header is absent.
    pub fn retried_count(&self) -> Result<u32, HeaderError> {
        match self.get(RETRIED_COUNT) {
            None => Ok(0),
            Some(raw) => raw.trim().parse::<u32>().map_err(|_| HeaderError::Malformed {
                name: RETRIED_COUNT,
                value: raw.to_string(),
            }),
        }
    }

    /// Destination recorded on first failure, if both halves are present.
    ///
    /// Empty strings are valid: the default exchange has an empty name.
    pub fn original_route(&self) -> Option<Destination> {
        let exchange = self.get(ORIGINAL_EXCHANGE)?;
        let routing_key = self.get(ORIGINAL_ROUTING_KEY)?;
        Some(Destination::new(exchange, routing_key))
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl IntoIterator for Headers {
    type Item = (String, String);
    type IntoIter = btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Exchange plus routing key. Publishing to a queue by name uses the default exchange (`""`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub exchange: String,
    pub routing_key: String,
}

impl Destination {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self { exchange: exchange.into(), routing_key: routing_key.into() }
    }

    /// Address a queue directly through the default exchange.
    pub fn queue(name: impl Into<String>) -> Self {
        Self::new("", name)
    }

    pub fn is_default_exchange(&self) -> bool {
        self.exchange.is_empty()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_default_exchange() {
            write!(f, "(default)/{}", self.routing_key)
        } else {
            write!(f, "{}/{}", self.exchange, self.routing_key)
        }
    }
}

/// Broker-assigned identifier of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One instance of a message handed to a consumer.
///
/// A delivery is never mutated by the cascade; it is acknowledged or rejected, and any
/// rescheduled copy is a fresh [`OutboundMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    /// Exchange the message arrived through.
    pub exchange: String,
    /// Routing key the message arrived with.
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub expiration: Option<String>,
    pub redelivered: bool,
}

impl Delivery {
    pub fn new(tag: DeliveryTag, received_from: Destination, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            exchange: received_from.exchange,
            routing_key: received_from.routing_key,
            payload: payload.into(),
            headers: Headers::new(),
            expiration: None,
            redelivered: false,
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// The exchange/routing key this delivery was received through.
    pub fn received_from(&self) -> Destination {
        Destination::new(self.exchange.clone(), self.routing_key.clone())
    }

    /// Payload as UTF-8, lossily.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// A message about to be published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub headers: Headers,
    /// Per-message TTL in milliseconds, as the broker expects it.
    pub expiration: Option<String>,
}

impl OutboundMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self { payload: payload.into(), ..Self::default() }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_expiration(mut self, expiration: impl Into<String>) -> Self {
        self.expiration = Some(expiration.into());
        self
    }

    /// Copy of a delivery's payload and headers, without an expiration.
    pub fn from_delivery(delivery: &Delivery) -> Self {
        Self {
            payload: delivery.payload.clone(),
            headers: delivery.headers.clone(),
            expiration: None,
        }
    }

    /// Expiration parsed as milliseconds, if present and well formed.
    pub fn expiration_millis(&self) -> Option<u64> {
        self.expiration.as_deref().and_then(|raw| raw.trim().parse().ok())
    }
}
