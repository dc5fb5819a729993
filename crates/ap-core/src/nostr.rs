use anyhow::{anyhow, Result};
use nostr_sdk::prelude::{
    Event as NostrEvent, EventBuilder, JsonUtil, Keys, Kind, Tag, TagKind, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire and storage representation of a signed event. Field order matches the
/// canonical JSON object layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl RawEvent {
    pub fn tag_values(&self, name: &str) -> Vec<String> {
        self.tags
            .iter()
            .filter_map(|tag| {
                if tag.first().map(|v| v.as_str()) == Some(name) {
                    tag.get(1).cloned()
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn first_tag_value(&self, name: &str) -> Option<String> {
        self.tags.iter().find_map(|tag| {
            if tag.first().map(|v| v.as_str()) == Some(name) {
                tag.get(1).cloned()
            } else {
                None
            }
        })
    }

    /// True when a tag with this key exists, value or not. Bare marker tags
    /// like `private` and `-` are looked up this way.
    pub fn has_tag(&self, name: &str) -> bool {
        self.tags
            .iter()
            .any(|tag| tag.first().map(|v| v.as_str()) == Some(name))
    }

    /// Find a tag whose key and first value both match.
    pub fn tag_with_value(&self, name: &str, value: &str) -> Option<&Vec<String>> {
        self.tags.iter().find(|tag| {
            tag.first().map(|v| v.as_str()) == Some(name)
                && tag.get(1).map(|v| v.as_str()) == Some(value)
        })
    }

    pub fn d_tag(&self) -> Option<String> {
        self.first_tag_value("d")
    }
}

/// Standard kind-range classification.

pub fn is_replaceable_kind(kind: u16) -> bool {
    kind == 0 || kind == 3 || (10000..20000).contains(&kind)
}

pub fn is_ephemeral_kind(kind: u16) -> bool {
    (20000..30000).contains(&kind)
}

pub fn is_addressable_kind(kind: u16) -> bool {
    (30000..40000).contains(&kind)
}

pub fn parse_event(value: &Value) -> Result<RawEvent> {
    serde_json::from_value(value.clone()).map_err(|err| anyhow!("invalid event json: {err}"))
}

/// Check the content-addressed id and Schnorr signature.
pub fn verify_event(raw: &RawEvent) -> Result<()> {
    let event = to_nostr_event(raw)?;
    event
        .verify()
        .map_err(|err| anyhow!("event verify failed: {err}"))?;
    Ok(())
}

pub fn to_nostr_event(raw: &RawEvent) -> Result<NostrEvent> {
    let json = serde_json::to_string(raw)?;
    NostrEvent::from_json(json).map_err(|err| anyhow!("failed to parse nostr event: {err}"))
}

/// Build and sign an event dated now.
pub fn build_signed_event(
    keys: &Keys,
    kind: u16,
    tags: Vec<Vec<String>>,
    content: String,
) -> Result<RawEvent> {
    sign_event_parts(keys, kind, None, tags, content)
}

/// Build and sign an event with an explicit created_at, used when the relay
/// re-publishes a projection record that must carry the source timestamp.
pub fn build_signed_event_at(
    keys: &Keys,
    kind: u16,
    created_at: i64,
    tags: Vec<Vec<String>>,
    content: String,
) -> Result<RawEvent> {
    sign_event_parts(keys, kind, Some(created_at), tags, content)
}

fn sign_event_parts(
    keys: &Keys,
    kind: u16,
    created_at: Option<i64>,
    tags: Vec<Vec<String>>,
    content: String,
) -> Result<RawEvent> {
    let mut event_tags = Vec::new();
    for tag in tags {
        if tag.is_empty() {
            continue;
        }
        let kind = TagKind::from(tag[0].as_str());
        let values = if tag.len() > 1 {
            tag[1..].to_vec()
        } else {
            Vec::new()
        };
        event_tags.push(Tag::custom(kind, values));
    }
    let mut builder = EventBuilder::new(Kind::Custom(kind), content, event_tags);
    if let Some(created_at) = created_at {
        builder = builder.custom_created_at(Timestamp::from(created_at.max(0) as u64));
    }
    let signed = builder.to_event(keys)?;
    let value = serde_json::to_value(&signed)?;
    parse_event(&value)
}

pub fn now() -> i64 {
    Timestamp::now().as_u64() as i64
}
