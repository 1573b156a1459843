//! Nostr event model, canonical serialization and signing.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{crypto, error::Result, keys::KeyPair};

/// User profile metadata (NIP-01).
pub const KIND_USER_METADATA: u32 = 0;
/// Group chat message (NIP-29).
pub const KIND_CHAT_MESSAGE: u32 = 9;
/// Request to join a group.
pub const KIND_JOIN_REQUEST: u32 = 9021;
/// Request to leave a group.
pub const KIND_LEAVE_REQUEST: u32 = 9022;
/// Replaceable list of groups the author has joined (NIP-51).
pub const KIND_JOINED_GROUPS: u32 = 10009;
/// Relay-generated group metadata.
pub const KIND_GROUP_METADATA: u32 = 39000;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. Tags used by groups include:
///
/// - `h` – group the event belongs to
/// - `d` – group identifier on relay-generated metadata
/// - `group` – joined group entry: `["group", id, relay_url]`
/// - `channel` – named channel inside a group
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved, including
/// empty ones. For example, `["h", "abc"]` is represented as
/// `Tag(vec!["h".into(), "abc".into()])`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(fields.into_iter().map(Into::into).collect())
    }

    /// Tag discriminator (first element).
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First value after the discriminator.
    pub fn value(&self) -> Option<&str> {
        self.get(1)
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }
}

/// Nostr event exchanged with relays.
///
/// `id` and `sig` are absent until the event is signed:
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "79be...",
///   "created_at": 1700000000,
///   "kind": 9,
///   "tags": [["h", "abc"], ["channel", "dev"]],
///   "content": "hello",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Author public key (hex, x-only).
    pub pubkey: String,
    /// Unix timestamp of creation, chosen by the author.
    pub created_at: u64,
    /// Kind number, e.g. `9` or `10009`.
    pub kind: u32,
    /// Ordered tags; order is part of the event id.
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Event content body.
    #[serde(default)]
    pub content: String,
    /// Schnorr signature over the event id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

impl Event {
    /// Build an unsigned event.
    pub fn new(
        pubkey: impl Into<String>,
        created_at: u64,
        kind: u32,
        tags: Vec<Tag>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            pubkey: pubkey.into(),
            created_at,
            kind,
            tags,
            content: content.into(),
            sig: None,
        }
    }

    /// Serialize `[0, pubkey, created_at, kind, tags, content]` without whitespace.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let arr = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ]);
        Ok(serde_json::to_vec(&arr)?)
    }

    /// SHA-256 of the canonical serialization.
    pub fn hash(&self) -> Result<[u8; 32]> {
        Ok(crypto::sha256(&self.canonical_bytes()?))
    }

    /// Hex event id derived from the other fields.
    pub fn calculate_id(&self) -> Result<String> {
        Ok(hex::encode(self.hash()?))
    }

    /// Return a signed copy authored by `keys`.
    ///
    /// The copy's `pubkey` is always the key pair's x-only public key.
    pub fn sign(&self, keys: &KeyPair) -> Result<Event> {
        let mut signed = self.clone();
        signed.pubkey = keys.public_key_hex();
        let hash = signed.hash()?;
        let sig = keys.sign(&hash)?;
        signed.id = Some(hex::encode(hash));
        signed.sig = Some(hex::encode(sig));
        Ok(signed)
    }

    /// Check the id against the fields and the signature against `pubkey`.
    ///
    /// Never panics or errors; anything malformed is simply not valid.
    pub fn verify(&self) -> bool {
        let (Some(id), Some(sig)) = (&self.id, &self.sig) else {
            return false;
        };
        let Ok(hash) = self.hash() else {
            return false;
        };
        if hex::encode(hash) != *id {
            return false;
        }
        let (Ok(sig), Ok(pubkey)) = (hex::decode(sig), hex::decode(&self.pubkey)) else {
            return false;
        };
        crypto::verify(&sig, &hash, &pubkey)
    }

    /// Serialize to the wire JSON object.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a wire JSON object.
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn has_tag(&self, name: &str) -> bool {
        self.tag(name).is_some()
    }

    /// First tag named `name`; empty tags never match.
    pub fn tag(&self, name: &str) -> Option<&Tag> {
        self.tags.iter().find(|t| t.name() == Some(name))
    }

    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Tag> + 'a {
        self.tags.iter().filter(move |t| t.name() == Some(name))
    }

    /// Value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tag(name).and_then(Tag::value)
    }

    /// Group id from the `h` tag, falling back to `d`.
    pub fn group_id(&self) -> Option<&str> {
        self.tag_value("h").or_else(|| self.tag_value("d"))
    }
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
