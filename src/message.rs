//! NIP-01 wire frames exchanged with relays.

use std::fmt;

use serde::{
    de::{self, IgnoredAny, SeqAccess, Visitor},
    Deserialize, Deserializer, Serialize,
};
use serde_json::{json, Value};

use crate::{error::Result, event::Event};

/// Subscription filter sent inside a `REQ` frame. Unset fields are omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    /// `#h` tag filter (group id).
    #[serde(rename = "#h", default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,
    /// `#d` tag filter (replaceable identifier).
    #[serde(rename = "#d", default, skip_serializing_if = "Option::is_none")]
    pub identifiers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u32>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn authors<S: Into<String>>(mut self, authors: impl IntoIterator<Item = S>) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn groups<S: Into<String>>(mut self, groups: impl IntoIterator<Item = S>) -> Self {
        self.groups = Some(groups.into_iter().map(Into::into).collect());
        self
    }

    pub fn identifiers<S: Into<String>>(mut self, ids: impl IntoIterator<Item = S>) -> Self {
        self.identifiers = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Frames sent from client to relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// `["REQ", sub_id, filter...]`
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },
    /// `["CLOSE", sub_id]`
    Close(String),
    /// `["EVENT", event]`
    Event(Box<Event>),
}

impl ClientMessage {
    /// Serialize to a compact JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        let value = match self {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = vec![json!("REQ"), json!(subscription_id)];
                for f in filters {
                    arr.push(serde_json::to_value(f)?);
                }
                Value::Array(arr)
            }
            ClientMessage::Close(sub) => json!(["CLOSE", sub]),
            ClientMessage::Event(ev) => json!(["EVENT", ev]),
        };
        Ok(value.to_string())
    }
}

/// Frames received from a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", sub_id, event]`
    Event {
        subscription_id: String,
        event: Box<Event>,
    },
    /// `["EOSE", sub_id]`
    Eose(String),
    /// `["NOTICE", message]`
    Notice(String),
    /// `["OK", event_id, accepted, message]`
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    /// Any other well-formed array frame.
    Unknown(String),
}

impl RelayMessage {
    /// Decode a text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl<'de> Deserialize<'de> for RelayMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_seq(RelayMessageVisitor)
    }
}

struct RelayMessageVisitor;

fn required<'de, A, T>(
    seq: &mut A,
    index: usize,
    visitor: &RelayMessageVisitor,
) -> std::result::Result<T, A::Error>
where
    A: SeqAccess<'de>,
    T: Deserialize<'de>,
{
    seq.next_element()?
        .ok_or_else(|| de::Error::invalid_length(index, visitor))
}

impl<'de> Visitor<'de> for RelayMessageVisitor {
    type Value = RelayMessage;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a relay message array")
    }

    fn visit_seq<A: SeqAccess<'de>>(
        self,
        mut seq: A,
    ) -> std::result::Result<RelayMessage, A::Error> {
        let label: String = required(&mut seq, 0, &self)?;
        let msg = match label.as_str() {
            "EVENT" => RelayMessage::Event {
                subscription_id: required(&mut seq, 1, &self)?,
                event: Box::new(required(&mut seq, 2, &self)?),
            },
            "EOSE" => RelayMessage::Eose(required(&mut seq, 1, &self)?),
            "NOTICE" => RelayMessage::Notice(required(&mut seq, 1, &self)?),
            "OK" => RelayMessage::Ok {
                event_id: required(&mut seq, 1, &self)?,
                accepted: required(&mut seq, 2, &self)?,
                message: seq.next_element()?.unwrap_or_default(),
            },
            _ => RelayMessage::Unknown(label),
        };
        // drain trailing elements so extra fields never fail the frame
        while seq.next_element::<IgnoredAny>()?.is_some() {}
        Ok(msg)
    }
}
