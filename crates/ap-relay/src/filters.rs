//! Subscription filters: parsing from the wire representation and matching
//! against events for live delivery. Store-side translation to SQL lives in
//! the event store.

use anyhow::{anyhow, Result};
use ap_core::nostr::RawEvent;
use serde_json::Value;
use std::collections::HashMap;

const MAX_FILTERS: usize = 20;

#[derive(Clone, Debug, Default)]
pub struct Filter {
    pub ids: Option<Vec<String>>,
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u16>>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<u64>,
    /// `"limit": 0` on the wire: the client wants live events only.
    pub limit_zero: bool,
    pub search: Option<String>,
    pub tags: HashMap<String, Vec<String>>,
}

impl Filter {
    pub fn kinds_include(&self, kind: u16) -> bool {
        self.kinds
            .as_ref()
            .map(|kinds| kinds.contains(&kind))
            .unwrap_or(false)
    }

    pub fn tag(mut self, key: &str, values: Vec<String>) -> Self {
        self.tags.insert(key.to_string(), values);
        self
    }

    /// Exact in-memory match, used for live broadcast dispatch and for
    /// relay-generated events that never hit the store.
    pub fn matches(&self, event: &RawEvent) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|author| author == &event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (key, values) in &self.tags {
            let event_values = event.tag_values(key);
            if !values.iter().any(|value| event_values.contains(value)) {
                return false;
            }
        }
        true
    }
}

pub fn parse_filters(values: &[Value]) -> Result<Vec<Filter>> {
    if values.is_empty() {
        return Err(anyhow!("missing filters"));
    }
    if values.len() > MAX_FILTERS {
        return Err(anyhow!("too many filters"));
    }

    values.iter().map(parse_filter).collect()
}

pub fn parse_filter(value: &Value) -> Result<Filter> {
    let map = value
        .as_object()
        .ok_or_else(|| anyhow!("filter must be an object"))?;

    let ids = parse_string_list(map.get("ids"))?;
    let authors = parse_string_list(map.get("authors"))?;
    let kinds = parse_kind_list(map.get("kinds"))?;
    let since = map.get("since").and_then(|v| v.as_i64());
    let until = map.get("until").and_then(|v| v.as_i64());
    let raw_limit = map.get("limit").and_then(|v| v.as_u64());
    let limit_zero = raw_limit == Some(0);
    let limit = raw_limit.filter(|limit| *limit > 0);
    let search = map
        .get("search")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    let mut tags = HashMap::new();
    for (key, value) in map {
        if !key.starts_with('#') {
            continue;
        }
        let tag = key.trim_start_matches('#').to_string();
        let values = parse_string_list(Some(value))?.unwrap_or_default();
        tags.insert(tag, values);
    }

    Ok(Filter {
        ids,
        authors,
        kinds,
        since,
        until,
        limit,
        limit_zero,
        search,
        tags,
    })
}

fn parse_string_list(value: Option<&Value>) -> Result<Option<Vec<String>>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let list = value
        .as_array()
        .ok_or_else(|| anyhow!("expected array"))?
        .iter()
        .filter_map(|item| item.as_str().map(|s| s.to_string()))
        .collect::<Vec<_>>();
    Ok(Some(list))
}

fn parse_kind_list(value: Option<&Value>) -> Result<Option<Vec<u16>>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let list = value
        .as_array()
        .ok_or_else(|| anyhow!("expected array"))?
        .iter()
        .filter_map(|item| item.as_u64().and_then(|v| u16::try_from(v).ok()))
        .collect::<Vec<_>>();
    Ok(Some(list))
}
