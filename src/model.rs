//! Typed views over group, profile and chat events.

use serde::{Deserialize, Serialize};

use crate::event::{
    Event, KIND_CHAT_MESSAGE, KIND_GROUP_METADATA, KIND_JOIN_REQUEST, KIND_LEAVE_REQUEST,
    KIND_USER_METADATA,
};

/// Channel that holds messages without a `channel` tag.
pub const GENERAL_CHANNEL: &str = "general";

/// Group metadata advertised by a group relay (kind 39000).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMetadata {
    pub id: String,
    pub name: Option<String>,
    pub about: Option<String>,
    pub picture: Option<String>,
    pub is_public: bool,
    pub is_open: bool,
}

impl GroupMetadata {
    /// Parse a kind-39000 event. Returns `None` for other kinds or when the
    /// `d` tag is missing.
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.kind != KIND_GROUP_METADATA {
            return None;
        }
        let id = event.tag_value("d")?.to_string();
        let text = |name: &str| event.tag_value(name).map(str::to_string);
        Some(Self {
            id,
            name: text("name"),
            about: text("about"),
            picture: text("picture"),
            is_public: !event.has_tag("private"),
            is_open: !event.has_tag("closed"),
        })
    }
}

/// Profile published as kind 0 JSON content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nip05: Option<String>,
}

impl UserMetadata {
    /// Parse a kind-0 event into `(pubkey, metadata)`.
    pub fn from_event(event: &Event) -> Option<(String, Self)> {
        if event.kind != KIND_USER_METADATA {
            return None;
        }
        let meta = serde_json::from_str(&event.content).ok()?;
        Some((event.pubkey.clone(), meta))
    }

    /// Best label for display: name, then display name.
    pub fn label(&self) -> Option<&str> {
        self.name.as_deref().or(self.display_name.as_deref())
    }
}

/// Chat message, join or leave as shown in a group timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMessage {
    pub id: String,
    pub pubkey: String,
    pub content: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
}

impl GroupMessage {
    /// Accepts events of kinds 9, 9021 and 9022 that carry an id.
    pub fn from_event(event: &Event) -> Option<Self> {
        if !matches!(
            event.kind,
            KIND_CHAT_MESSAGE | KIND_JOIN_REQUEST | KIND_LEAVE_REQUEST
        ) {
            return None;
        }
        Some(Self {
            id: event.id.clone()?,
            pubkey: event.pubkey.clone(),
            content: event.content.clone(),
            created_at: event.created_at,
            kind: event.kind,
            tags: event.tags.iter().map(|t| t.0.clone()).collect(),
        })
    }

    /// Named channel, or [`GENERAL_CHANNEL`] when untagged.
    pub fn channel(&self) -> &str {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some("channel") && t.len() >= 2)
            .map(|t| t[1].as_str())
            .unwrap_or(GENERAL_CHANNEL)
    }

    pub fn in_channel(&self, channel: &str) -> bool {
        self.channel() == channel
    }

    /// Short label for the timeline.
    pub fn label(&self) -> &'static str {
        match self.kind {
            KIND_CHAT_MESSAGE => "message",
            KIND_JOIN_REQUEST => "join",
            KIND_LEAVE_REQUEST => "leave",
            _ => "event",
        }
    }
}

/// Messages from `messages` that belong to `channel`.
pub fn filter_channel<'a>(
    messages: &'a [GroupMessage],
    channel: &'a str,
) -> impl Iterator<Item = &'a GroupMessage> + 'a {
    messages.iter().filter(move |m| m.in_channel(channel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;

    fn message(id: &str, tags: Vec<Tag>) -> GroupMessage {
        let mut ev = Event::new("ab", 1, KIND_CHAT_MESSAGE, tags, "hi");
        ev.id = Some(id.into());
        GroupMessage::from_event(&ev).unwrap()
    }

    #[test]
    fn channel_scoping() {
        let dev = message("1", vec![Tag::new(["h", "g"]), Tag::new(["channel", "dev"])]);
        let general = message("2", vec![Tag::new(["h", "g"])]);
        let all = vec![dev.clone(), general.clone()];

        let in_general: Vec<_> = filter_channel(&all, GENERAL_CHANNEL).collect();
        assert_eq!(in_general, vec![&general]);
        let in_dev: Vec<_> = filter_channel(&all, "dev").collect();
        assert_eq!(in_dev, vec![&dev]);
    }

    #[test]
    fn message_requires_id_and_kind() {
        let ev = Event::new("ab", 1, KIND_CHAT_MESSAGE, vec![], "hi");
        assert!(GroupMessage::from_event(&ev).is_none());
        let mut other = Event::new("ab", 1, 1, vec![], "hi");
        other.id = Some("x".into());
        assert!(GroupMessage::from_event(&other).is_none());
        let mut join = Event::new("ab", 1, KIND_JOIN_REQUEST, vec![], "/join");
        join.id = Some("y".into());
        assert_eq!(GroupMessage::from_event(&join).unwrap().label(), "join");
    }

    #[test]
    fn group_metadata_flags() {
        let ev = Event::new(
            "ab",
            1,
            KIND_GROUP_METADATA,
            vec![
                Tag::new(["d", "rust"]),
                Tag::new(["name", "Rustaceans"]),
                Tag::new(["about", "crabs"]),
                Tag::new(["private"]),
            ],
            "",
        );
        let meta = GroupMetadata::from_event(&ev).unwrap();
        assert_eq!(meta.id, "rust");
        assert_eq!(meta.name.as_deref(), Some("Rustaceans"));
        assert_eq!(meta.about.as_deref(), Some("crabs"));
        assert!(meta.picture.is_none());
        assert!(!meta.is_public);
        assert!(meta.is_open);

        let no_d = Event::new("ab", 1, KIND_GROUP_METADATA, vec![], "");
        assert!(GroupMetadata::from_event(&no_d).is_none());
    }

    #[test]
    fn user_metadata_content() {
        let ev = Event::new(
            "ab",
            1,
            KIND_USER_METADATA,
            vec![],
            r#"{"display_name":"Ann","nip05":"ann@x","lud16":"ignored"}"#,
        );
        let (pk, meta) = UserMetadata::from_event(&ev).unwrap();
        assert_eq!(pk, "ab");
        assert_eq!(meta.label(), Some("Ann"));
        assert_eq!(meta.nip05.as_deref(), Some("ann@x"));

        let bad = Event::new("ab", 1, KIND_USER_METADATA, vec![], "not json");
        assert!(UserMetadata::from_event(&bad).is_none());
    }
}
