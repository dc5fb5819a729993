//! Group state derived from the event log, plus the admission predicates the
//! pipeline runs against it.

use anyhow::Result;
use ap_core::nostr::{self, RawEvent};
use nostr_sdk::prelude::PublicKey;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::filters::Filter;
use crate::kinds::{
    self, GROUP_ADMINS, GROUP_CREATE_GROUP, GROUP_CREATE_INVITE, GROUP_DELETE_GROUP,
    GROUP_JOIN_REQUEST, GROUP_LEAVE_REQUEST, GROUP_MEMBERS, GROUP_METADATA, GROUP_PUT_USER,
    GROUP_REMOVE_USER, METADATA_KINDS, RELAY_SENTINEL_GROUP,
};
use crate::management::ManagementEngine;
use crate::store::EventStore;
use crate::tenant::TenantConfig;

/// The group id an event addresses: the `d` tag for relay-generated state
/// kinds, the `h` tag for everything else.
pub fn group_id_of(event: &RawEvent) -> String {
    let tag_name = if kinds::is_metadata_kind(event.kind) {
        "d"
    } else {
        "h"
    };
    event.first_tag_value(tag_name).unwrap_or_default()
}

/// Whether a create/edit content payload asks for a private group.
pub fn is_private_group_content(content: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(content)
        .ok()
        .and_then(|data| data.get("private").and_then(|v| v.as_bool()))
        .unwrap_or(false)
}

#[derive(Clone)]
struct GroupMeta {
    event: RawEvent,
    private: bool,
    hidden: bool,
    closed: bool,
}

impl GroupMeta {
    fn from_event(event: RawEvent) -> Self {
        let private = event.has_tag("private");
        let hidden = event.has_tag("hidden");
        let closed = event.has_tag("closed");
        Self {
            event,
            private,
            hidden,
            closed,
        }
    }
}

#[derive(Default)]
struct MemberSet {
    members: RwLock<HashSet<String>>,
}

pub struct GroupEngine {
    config: Arc<TenantConfig>,
    store: Arc<EventStore>,
    management: Arc<ManagementEngine>,

    metadata: RwLock<HashMap<String, GroupMeta>>,
    memberships: RwLock<HashMap<String, Arc<MemberSet>>>,
    creators: RwLock<HashMap<String, String>>,
    warmed: AtomicBool,
}

impl GroupEngine {
    pub fn new(
        config: Arc<TenantConfig>,
        store: Arc<EventStore>,
        management: Arc<ManagementEngine>,
    ) -> Self {
        Self {
            config,
            store,
            management,
            metadata: RwLock::new(HashMap::new()),
            memberships: RwLock::new(HashMap::new()),
            creators: RwLock::new(HashMap::new()),
            warmed: AtomicBool::new(false),
        }
    }

    fn is_warmed(&self) -> bool {
        self.warmed.load(Ordering::Acquire)
    }

    /// Replay the log into the in-memory projections. The warmed flag flips
    /// only after every pass has finished, so partial state is never served.
    pub async fn warm(&self) -> Result<()> {
        let meta_filter = Filter {
            kinds: Some(vec![GROUP_METADATA]),
            ..Default::default()
        };
        {
            let mut metadata = self.metadata.write().await;
            for event in self.store.query(&meta_filter, 0).await? {
                let Some(h) = event.d_tag() else { continue };
                if h.is_empty() {
                    continue;
                }
                metadata.insert(h, GroupMeta::from_event(event));
            }
        }

        // Query order is newest-first; overwriting on each hit leaves the
        // earliest create event as the recorded creator.
        let create_filter = Filter {
            kinds: Some(vec![GROUP_CREATE_GROUP]),
            ..Default::default()
        };
        {
            let mut creators = self.creators.write().await;
            for event in self.store.query(&create_filter, 0).await? {
                let h = group_id_of(&event);
                if h.is_empty() {
                    continue;
                }
                creators.insert(h, event.pubkey.clone());
            }
        }

        // Membership is a replay of put/remove mutations in ascending
        // (created_at, ingress) order.
        let member_filter = Filter {
            kinds: Some(vec![GROUP_PUT_USER, GROUP_REMOVE_USER]),
            ..Default::default()
        };
        let mut mutations = self.store.query(&member_filter, 0).await?;
        mutations.reverse();
        for event in mutations {
            let h = group_id_of(&event);
            if h.is_empty() {
                continue;
            }
            for hex in event.tag_values("p") {
                let Ok(pubkey) = PublicKey::from_hex(&hex) else {
                    continue;
                };
                let set = self.member_set(&h).await;
                let mut members = set.members.write().await;
                if event.kind == GROUP_PUT_USER {
                    members.insert(pubkey.to_hex());
                } else {
                    members.remove(&pubkey.to_hex());
                }
            }
        }

        self.warmed.store(true, Ordering::Release);
        Ok(())
    }

    async fn member_set(&self, h: &str) -> Arc<MemberSet> {
        {
            let memberships = self.memberships.read().await;
            if let Some(set) = memberships.get(h) {
                return Arc::clone(set);
            }
        }
        let mut memberships = self.memberships.write().await;
        Arc::clone(memberships.entry(h.to_string()).or_default())
    }

    // Metadata

    pub async fn get_metadata(&self, h: &str) -> Result<Option<RawEvent>> {
        if self.is_warmed() {
            let metadata = self.metadata.read().await;
            return Ok(metadata.get(h).map(|meta| meta.event.clone()));
        }

        let filter = Filter {
            kinds: Some(vec![GROUP_METADATA]),
            limit: Some(1),
            ..Default::default()
        }
        .tag("d", vec![h.to_string()]);

        Ok(self.store.query(&filter, 0).await?.into_iter().next())
    }

    /// Re-derive and publish the group metadata record from a create or edit
    /// event: `h` becomes `d`, visibility booleans in the content become bare
    /// tags, content is copied as-is.
    pub async fn update_metadata(&self, event: &RawEvent) -> Result<()> {
        let mut tags: Vec<Vec<String>> = Vec::new();
        let mut h = String::new();

        for tag in &event.tags {
            if tag.len() >= 2 && tag[0] == "h" {
                h = tag[1].clone();
                tags.push(vec!["d".to_string(), tag[1].clone()]);
            } else {
                tags.push(tag.clone());
            }
        }

        if let Ok(data) = serde_json::from_str::<serde_json::Value>(&event.content) {
            for flag in ["private", "closed", "hidden"] {
                if data.get(flag).and_then(|v| v.as_bool()).unwrap_or(false) {
                    tags.push(vec![flag.to_string()]);
                }
            }
        }

        let metadata_event = self
            .store
            .sign_and_store(
                GROUP_METADATA,
                event.created_at,
                tags,
                event.content.clone(),
                true,
            )
            .await?;

        if !h.is_empty() {
            self.metadata
                .write()
                .await
                .insert(h, GroupMeta::from_event(metadata_event));
        }

        Ok(())
    }

    // Deletion

    /// Purge everything the group id reaches, keeping only the delete-group
    /// tombstone. The projections are dropped even when the purge scan hits
    /// storage errors.
    pub async fn delete_group(&self, h: &str) {
        let filters = [
            Filter {
                kinds: Some(METADATA_KINDS.to_vec()),
                ..Default::default()
            }
            .tag("d", vec![h.to_string()]),
            Filter::default().tag("h", vec![h.to_string()]),
        ];

        for filter in filters {
            match self.store.query(&filter, 0).await {
                Ok(events) => {
                    for event in events {
                        if event.kind == GROUP_DELETE_GROUP {
                            continue;
                        }
                        if let Err(err) = self.store.delete(&event.id).await {
                            tracing::warn!(group = %h, id = %event.id, error = %err, "group purge delete failed");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(group = %h, error = %err, "group purge scan failed");
                }
            }
        }

        self.metadata.write().await.remove(h);
        self.memberships.write().await.remove(h);
        self.creators.write().await.remove(h);
    }

    // Admins

    /// Per-group admins are not modeled; this intentionally ignores `h` and
    /// answers the relay-level admin question.
    pub fn is_admin(&self, _h: &str, pubkey: &str) -> bool {
        self.management.is_admin(pubkey)
    }

    pub async fn get_admins(&self, h: &str) -> Vec<String> {
        // Private groups without relay admin access are administered by their
        // creator alone.
        if h != RELAY_SENTINEL_GROUP
            && self.is_private_group(h).await
            && !self.config.groups.private_relay_admin_access
        {
            return match self.get_creator(h).await {
                Some(creator) => vec![creator],
                None => Vec::new(),
            };
        }
        self.management.get_admins()
    }

    pub async fn update_admins_list(&self, h: &str) -> Result<()> {
        let mut tags = vec![vec!["-".to_string()], vec!["d".to_string(), h.to_string()]];
        for pubkey in self.get_admins(h).await {
            tags.push(vec!["p".to_string(), pubkey]);
        }

        self.store
            .sign_and_store(GROUP_ADMINS, nostr::now(), tags, String::new(), true)
            .await?;
        Ok(())
    }

    // Membership

    pub async fn add_member(&self, h: &str, pubkey: &str) -> Result<()> {
        self.store
            .sign_and_store(
                GROUP_PUT_USER,
                nostr::now(),
                vec![
                    vec!["p".to_string(), pubkey.to_string()],
                    vec!["h".to_string(), h.to_string()],
                ],
                String::new(),
                true,
            )
            .await?;

        let set = self.member_set(h).await;
        set.members.write().await.insert(pubkey.to_string());
        Ok(())
    }

    pub async fn remove_member(&self, h: &str, pubkey: &str) -> Result<()> {
        self.store
            .sign_and_store(
                GROUP_REMOVE_USER,
                nostr::now(),
                vec![
                    vec!["p".to_string(), pubkey.to_string()],
                    vec!["h".to_string(), h.to_string()],
                ],
                String::new(),
                true,
            )
            .await?;

        let memberships = self.memberships.read().await;
        if let Some(set) = memberships.get(h) {
            set.members.write().await.remove(pubkey);
        }
        Ok(())
    }

    /// Record an externally-sourced membership mutation in the cache without
    /// emitting new events. Used by the post-persistence side-effect hook.
    pub async fn apply_membership_event(&self, h: &str, event: &RawEvent) {
        for hex in event.tag_values("p") {
            let Ok(pubkey) = PublicKey::from_hex(&hex) else {
                continue;
            };
            if event.kind == GROUP_PUT_USER {
                let set = self.member_set(h).await;
                set.members.write().await.insert(pubkey.to_hex());
            } else {
                let memberships = self.memberships.read().await;
                if let Some(set) = memberships.get(h) {
                    set.members.write().await.remove(&pubkey.to_hex());
                }
            }
        }
    }

    pub async fn is_member(&self, h: &str, pubkey: &str) -> bool {
        if self.is_warmed() {
            let memberships = self.memberships.read().await;
            let Some(set) = memberships.get(h) else {
                return false;
            };
            return set.members.read().await.contains(pubkey);
        }

        let filter = Filter {
            kinds: Some(vec![GROUP_PUT_USER, GROUP_REMOVE_USER]),
            limit: Some(1),
            ..Default::default()
        }
        .tag("p", vec![pubkey.to_string()])
        .tag("h", vec![h.to_string()]);

        match self.store.query(&filter, 0).await {
            Ok(events) => events
                .first()
                .map(|event| event.kind == GROUP_PUT_USER)
                .unwrap_or(false),
            Err(err) => {
                tracing::warn!(error = %err, "membership lookup failed");
                false
            }
        }
    }

    pub async fn get_members(&self, h: &str) -> Vec<String> {
        if self.is_warmed() {
            let memberships = self.memberships.read().await;
            let Some(set) = memberships.get(h) else {
                return Vec::new();
            };
            return set.members.read().await.iter().cloned().collect();
        }

        let filter = Filter {
            kinds: Some(vec![GROUP_PUT_USER, GROUP_REMOVE_USER]),
            ..Default::default()
        }
        .tag("h", vec![h.to_string()]);

        let mut mutations = match self.store.query(&filter, 0).await {
            Ok(events) => events,
            Err(err) => {
                tracing::warn!(error = %err, "membership replay failed");
                return Vec::new();
            }
        };
        mutations.reverse();

        let mut members = HashSet::new();
        for event in mutations {
            for hex in event.tag_values("p") {
                let Ok(pubkey) = PublicKey::from_hex(&hex) else {
                    continue;
                };
                if event.kind == GROUP_PUT_USER {
                    members.insert(pubkey.to_hex());
                } else {
                    members.remove(&pubkey.to_hex());
                }
            }
        }
        members.into_iter().collect()
    }

    pub async fn update_members_list(&self, h: &str) -> Result<()> {
        let mut tags = vec![vec!["-".to_string()], vec!["d".to_string(), h.to_string()]];
        for pubkey in self.get_members(h).await {
            tags.push(vec!["p".to_string(), pubkey]);
        }

        self.store
            .sign_and_store(GROUP_MEMBERS, nostr::now(), tags, String::new(), true)
            .await?;
        Ok(())
    }

    // Invite codes

    pub async fn validate_invite_code(&self, h: &str, code: &str) -> bool {
        if code.is_empty() {
            return false;
        }

        let filter = Filter {
            kinds: Some(vec![GROUP_CREATE_INVITE]),
            ..Default::default()
        }
        .tag("h", vec![h.to_string()]);

        match self.store.query(&filter, 0).await {
            Ok(invites) => invites
                .iter()
                .any(|invite| invite.tag_with_value("code", code).is_some()),
            Err(err) => {
                tracing::warn!(error = %err, "invite code lookup failed");
                false
            }
        }
    }

    pub fn invite_code_of(event: &RawEvent) -> String {
        event.first_tag_value("code").unwrap_or_default()
    }

    // Flags and creator

    pub async fn is_private_group(&self, h: &str) -> bool {
        if self.is_warmed() {
            let metadata = self.metadata.read().await;
            return metadata.get(h).map(|meta| meta.private).unwrap_or(false);
        }

        match self.get_metadata(h).await {
            Ok(Some(meta)) => meta.has_tag("private"),
            _ => false,
        }
    }

    pub async fn get_creator(&self, h: &str) -> Option<String> {
        if self.is_warmed() {
            return self.creators.read().await.get(h).cloned();
        }

        let filter = Filter {
            kinds: Some(vec![GROUP_CREATE_GROUP]),
            limit: Some(1),
            ..Default::default()
        }
        .tag("h", vec![h.to_string()]);

        match self.store.query(&filter, 0).await {
            Ok(events) => events.into_iter().next().map(|event| event.pubkey),
            Err(err) => {
                tracing::warn!(error = %err, "creator lookup failed");
                None
            }
        }
    }

    pub async fn record_creator(&self, h: &str, pubkey: &str) {
        self.creators
            .write()
            .await
            .insert(h.to_string(), pubkey.to_string());
    }

    pub async fn is_creator(&self, h: &str, pubkey: &str) -> bool {
        self.get_creator(h).await.as_deref() == Some(pubkey)
    }

    // Access

    pub async fn has_access(&self, h: &str, pubkey: &str) -> bool {
        // Private groups without relay admin access admit members and the
        // creator only.
        if self.is_private_group(h).await && !self.config.groups.private_relay_admin_access {
            return self.is_member(h, pubkey).await || self.is_creator(h, pubkey).await;
        }
        self.management.can_manage(pubkey).await
            || self.is_admin(h, pubkey)
            || self.is_member(h, pubkey).await
    }

    pub fn is_group_event(&self, event: &RawEvent) -> bool {
        if kinds::is_metadata_kind(event.kind) || kinds::is_moderation_kind(event.kind) {
            return true;
        }
        if event.kind == GROUP_JOIN_REQUEST || event.kind == GROUP_LEAVE_REQUEST {
            return true;
        }
        !group_id_of(event).is_empty()
    }

    pub async fn can_read(&self, viewer: Option<&str>, event: &RawEvent) -> bool {
        if !self.config.groups.enabled {
            return false;
        }

        let h = group_id_of(event);

        // Relay-level state (h = "_"), including the relay admins list, is
        // always readable.
        if h == RELAY_SENTINEL_GROUP {
            return true;
        }

        let meta = match self.get_metadata(&h).await {
            Ok(Some(meta)) => meta,
            _ => return false,
        };

        let viewer = viewer.unwrap_or_default();

        if meta.has_tag("hidden") && !self.has_access(&h, viewer).await {
            return false;
        }

        if event.kind == GROUP_METADATA || event.kind == GROUP_DELETE_GROUP {
            return true;
        }

        if meta.has_tag("private") && !self.has_access(&h, viewer).await {
            return false;
        }

        // Public groups on an open relay are readable by any authenticated
        // user.
        if self.config.policy.open && !meta.has_tag("private") {
            return true;
        }

        self.has_access(&h, viewer).await
    }

    /// The write decision table, first matching row wins. `None` accepts.
    pub async fn check_write(&self, event: &RawEvent) -> Option<String> {
        if !self.config.groups.enabled {
            return Some("invalid: groups are not enabled".to_string());
        }

        if kinds::is_metadata_kind(event.kind) {
            return Some("invalid: group metadata cannot be set directly".to_string());
        }

        let h = group_id_of(event);
        let meta = match self.get_metadata(&h).await {
            Ok(meta) => meta,
            Err(err) => {
                tracing::warn!(error = %err, "metadata lookup failed");
                None
            }
        };

        if event.kind == GROUP_CREATE_GROUP {
            if meta.is_some() {
                return Some("invalid: that group already exists".to_string());
            }
            if self.config.groups.admin_create_only
                && !self.management.can_manage(&event.pubkey).await
            {
                return Some("restricted: only admins can create groups".to_string());
            }
            if self.config.groups.private_admin_only
                && !self.management.can_manage(&event.pubkey).await
                && is_private_group_content(&event.content)
            {
                return Some("restricted: only admins can create private groups".to_string());
            }
            // Creation stands on its own; the moderation checks below do not
            // apply to it.
            return None;
        }

        let Some(meta) = meta else {
            return Some("invalid: group not found".to_string());
        };

        if kinds::is_moderation_kind(event.kind) {
            if self.is_private_group(&h).await && !self.config.groups.private_relay_admin_access {
                if !self.is_creator(&h, &event.pubkey).await {
                    return Some(
                        "restricted: only the group creator can manage private groups".to_string(),
                    );
                }
            } else if !self.management.can_manage(&event.pubkey).await
                && !self.is_creator(&h, &event.pubkey).await
            {
                return Some("restricted: you are not authorized to manage groups".to_string());
            }
        }

        if event.kind == GROUP_JOIN_REQUEST {
            if self.is_member(&h, &event.pubkey).await {
                return Some("duplicate: already a member".to_string());
            }

            let is_private = meta.has_tag("private");
            let is_hidden = meta.has_tag("hidden");

            if is_private || is_hidden {
                let code = Self::invite_code_of(event);
                if !self.validate_invite_code(&h, &code).await {
                    if is_hidden {
                        // Do not reveal that the group exists.
                        return Some("invalid: group not found".to_string());
                    }
                    return Some(
                        "restricted: valid invite code required to join this group".to_string(),
                    );
                }
            }

            return None;
        }

        if meta.has_tag("hidden") && !self.has_access(&h, &event.pubkey).await {
            return Some("invalid: group not found".to_string());
        }

        if event.kind == GROUP_LEAVE_REQUEST {
            if !self.is_member(&h, &event.pubkey).await {
                return Some("duplicate: not currently a member".to_string());
            }
            return None;
        }

        if meta.has_tag("closed") && !self.has_access(&h, &event.pubkey).await {
            return Some("restricted: you are not a member of that group".to_string());
        }

        None
    }
}

#[cfg(test)]
impl GroupEngine {
    pub(crate) fn test_mark_warmed(&self) {
        self.warmed.store(true, Ordering::Release);
    }

    pub(crate) async fn test_seed_group(&self, h: &str, private: bool, hidden: bool, closed: bool) {
        let mut tags = vec![vec!["d".to_string(), h.to_string()]];
        if private {
            tags.push(vec!["private".to_string()]);
        }
        if hidden {
            tags.push(vec!["hidden".to_string()]);
        }
        if closed {
            tags.push(vec!["closed".to_string()]);
        }
        let event = RawEvent {
            id: String::new(),
            pubkey: String::new(),
            created_at: 0,
            kind: GROUP_METADATA,
            tags,
            content: String::new(),
            sig: String::new(),
        };
        self.metadata
            .write()
            .await
            .insert(h.to_string(), GroupMeta::from_event(event));
    }

    pub(crate) async fn test_seed_member(&self, h: &str, pubkey: &str) {
        let set = self.member_set(h).await;
        set.members.write().await.insert(pubkey.to_string());
    }

    pub(crate) async fn test_metadata_len(&self) -> usize {
        self.metadata.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Instance;
    use crate::kinds::{GROUP_CREATE_GROUP, GROUP_EDIT_METADATA, GROUP_METADATA};
    use crate::testing;
    use ap_core::nostr::build_signed_event;
    use nostr_sdk::prelude::Keys;

    fn h_tag(h: &str) -> Vec<Vec<String>> {
        vec![vec!["h".to_string(), h.to_string()]]
    }

    fn event(keys: &Keys, kind: u16, tags: Vec<Vec<String>>, content: &str) -> RawEvent {
        build_signed_event(keys, kind, tags, content.to_string()).expect("signed event")
    }

    fn open_instance() -> (std::sync::Arc<Instance>, Keys, Keys) {
        let testing::TestTenant {
            config,
            relay_keys: _,
            owner_keys,
        } = testing::tenant(|file| {
            file.policy.open = true;
        });
        let member = Keys::generate();
        (testing::warmed_instance(config), owner_keys, member)
    }

    #[test]
    fn group_id_comes_from_d_for_state_kinds_and_h_otherwise() {
        let keys = Keys::generate();
        let state = event(
            &keys,
            GROUP_METADATA,
            vec![vec!["d".to_string(), "pub".to_string()]],
            "",
        );
        assert_eq!(group_id_of(&state), "pub");

        let chat = event(&keys, 9, h_tag("pub"), "hi");
        assert_eq!(group_id_of(&chat), "pub");

        let bare = event(&keys, 9, Vec::new(), "hi");
        assert_eq!(group_id_of(&bare), "");
    }

    #[test]
    fn private_content_flag_parses_loosely() {
        assert!(is_private_group_content(r#"{"name":"P","private":true}"#));
        assert!(!is_private_group_content(r#"{"private":false}"#));
        assert!(!is_private_group_content(r#"{"name":"P"}"#));
        assert!(!is_private_group_content("not json"));
        assert!(!is_private_group_content(r#"{"private":"yes"}"#));
    }

    #[tokio::test]
    async fn group_events_are_recognized_by_kind_or_tag() {
        let (instance, _, member) = open_instance();
        let groups = &instance.groups;

        assert!(groups.is_group_event(&event(&member, GROUP_JOIN_REQUEST, h_tag("pub"), "")));
        assert!(groups.is_group_event(&event(&member, GROUP_PUT_USER, Vec::new(), "")));
        assert!(groups.is_group_event(&event(&member, GROUP_METADATA, Vec::new(), "")));
        assert!(groups.is_group_event(&event(&member, 9, h_tag("pub"), "hi")));
        assert!(!groups.is_group_event(&event(&member, 1, Vec::new(), "hi")));
    }

    #[tokio::test]
    async fn write_rejected_when_groups_disabled() {
        let testing::TestTenant { config, .. } = testing::tenant(|file| {
            file.groups.enabled = false;
        });
        let instance = testing::warmed_instance(config);
        let author = Keys::generate();

        let rejection = instance
            .groups
            .check_write(&event(&author, 9, h_tag("pub"), "hi"))
            .await;
        assert_eq!(rejection.as_deref(), Some("invalid: groups are not enabled"));
    }

    #[tokio::test]
    async fn state_kinds_cannot_be_written_directly() {
        let (instance, owner, _) = open_instance();
        let rejection = instance
            .groups
            .check_write(&event(
                &owner,
                GROUP_METADATA,
                vec![vec!["d".to_string(), "pub".to_string()]],
                "",
            ))
            .await;
        assert_eq!(
            rejection.as_deref(),
            Some("invalid: group metadata cannot be set directly")
        );
    }

    #[tokio::test]
    async fn create_rejected_when_group_exists() {
        let (instance, owner, _) = open_instance();
        instance.groups.test_seed_group("pub", false, false, false).await;

        let rejection = instance
            .groups
            .check_write(&event(&owner, GROUP_CREATE_GROUP, h_tag("pub"), "{}"))
            .await;
        assert_eq!(rejection.as_deref(), Some("invalid: that group already exists"));
    }

    #[tokio::test]
    async fn create_accepted_for_fresh_group() {
        let (instance, _, member) = open_instance();
        let accepted = instance
            .groups
            .check_write(&event(&member, GROUP_CREATE_GROUP, h_tag("fresh"), "{}"))
            .await;
        assert_eq!(accepted, None);
    }

    #[tokio::test]
    async fn admin_create_only_restricts_creation() {
        let testing::TestTenant {
            config, owner_keys, ..
        } = testing::tenant(|file| {
            file.groups.admin_create_only = true;
        });
        let instance = testing::warmed_instance(config);
        let stranger = Keys::generate();

        let rejection = instance
            .groups
            .check_write(&event(&stranger, GROUP_CREATE_GROUP, h_tag("fresh"), "{}"))
            .await;
        assert_eq!(
            rejection.as_deref(),
            Some("restricted: only admins can create groups")
        );

        let accepted = instance
            .groups
            .check_write(&event(&owner_keys, GROUP_CREATE_GROUP, h_tag("fresh"), "{}"))
            .await;
        assert_eq!(accepted, None);
    }

    #[tokio::test]
    async fn private_admin_only_restricts_private_creation_only() {
        let testing::TestTenant { config, .. } = testing::tenant(|file| {
            file.groups.private_admin_only = true;
        });
        let instance = testing::warmed_instance(config);
        let stranger = Keys::generate();

        let rejection = instance
            .groups
            .check_write(&event(
                &stranger,
                GROUP_CREATE_GROUP,
                h_tag("fresh"),
                r#"{"name":"P","private":true}"#,
            ))
            .await;
        assert_eq!(
            rejection.as_deref(),
            Some("restricted: only admins can create private groups")
        );

        let accepted = instance
            .groups
            .check_write(&event(
                &stranger,
                GROUP_CREATE_GROUP,
                h_tag("fresh"),
                r#"{"name":"P"}"#,
            ))
            .await;
        assert_eq!(accepted, None);
    }

    #[tokio::test]
    async fn writes_to_unknown_groups_are_rejected() {
        let (instance, _, member) = open_instance();
        let rejection = instance
            .groups
            .check_write(&event(&member, 9, h_tag("nowhere"), "hi"))
            .await;
        assert_eq!(rejection.as_deref(), Some("invalid: group not found"));
    }

    #[tokio::test]
    async fn moderation_requires_manage_capability_or_creator() {
        let (instance, owner, member) = open_instance();
        instance.groups.test_seed_group("pub", false, false, false).await;

        let kick = |keys: &Keys| {
            event(
                keys,
                GROUP_REMOVE_USER,
                vec![
                    vec!["p".to_string(), Keys::generate().public_key().to_hex()],
                    vec!["h".to_string(), "pub".to_string()],
                ],
                "",
            )
        };

        let rejection = instance.groups.check_write(&kick(&member)).await;
        assert_eq!(
            rejection.as_deref(),
            Some("restricted: you are not authorized to manage groups")
        );

        let accepted = instance.groups.check_write(&kick(&owner)).await;
        assert_eq!(accepted, None);
    }

    #[tokio::test]
    async fn private_groups_are_creator_moderated_by_default() {
        let (instance, owner, creator) = open_instance();
        instance.groups.test_seed_group("priv", true, false, false).await;
        instance
            .groups
            .record_creator("priv", &creator.public_key().to_hex())
            .await;
        // The creator stays in the membership projection after creation.
        instance
            .groups
            .test_seed_member("priv", &creator.public_key().to_hex())
            .await;

        let edit = |keys: &Keys| event(keys, GROUP_EDIT_METADATA, h_tag("priv"), "{}");

        // Even the relay owner is shut out when private_relay_admin_access is
        // off.
        let rejection = instance.groups.check_write(&edit(&owner)).await;
        assert_eq!(
            rejection.as_deref(),
            Some("restricted: only the group creator can manage private groups")
        );

        let accepted = instance.groups.check_write(&edit(&creator)).await;
        assert_eq!(accepted, None);
    }

    #[tokio::test]
    async fn relay_admin_moderates_private_groups_when_access_enabled() {
        let testing::TestTenant {
            config, owner_keys, ..
        } = testing::tenant(|file| {
            file.groups.private_relay_admin_access = true;
        });
        let instance = testing::warmed_instance(config);
        instance.groups.test_seed_group("priv", true, false, false).await;

        let accepted = instance
            .groups
            .check_write(&event(&owner_keys, GROUP_EDIT_METADATA, h_tag("priv"), "{}"))
            .await;
        assert_eq!(accepted, None);
    }

    #[tokio::test]
    async fn join_rejected_when_already_member() {
        let (instance, _, member) = open_instance();
        instance.groups.test_seed_group("pub", false, false, false).await;
        instance
            .groups
            .test_seed_member("pub", &member.public_key().to_hex())
            .await;

        let rejection = instance
            .groups
            .check_write(&event(&member, GROUP_JOIN_REQUEST, h_tag("pub"), ""))
            .await;
        assert_eq!(rejection.as_deref(), Some("duplicate: already a member"));
    }

    #[tokio::test]
    async fn join_to_public_group_is_open() {
        let (instance, _, member) = open_instance();
        instance.groups.test_seed_group("pub", false, false, false).await;

        let accepted = instance
            .groups
            .check_write(&event(&member, GROUP_JOIN_REQUEST, h_tag("pub"), ""))
            .await;
        assert_eq!(accepted, None);
    }

    #[tokio::test]
    async fn join_to_private_group_needs_invite() {
        let (instance, _, member) = open_instance();
        instance.groups.test_seed_group("priv", true, false, false).await;

        let mut tags = h_tag("priv");
        tags.push(vec!["code".to_string(), "WRONG".to_string()]);
        let rejection = instance
            .groups
            .check_write(&event(&member, GROUP_JOIN_REQUEST, tags, ""))
            .await;
        assert_eq!(
            rejection.as_deref(),
            Some("restricted: valid invite code required to join this group")
        );
    }

    #[tokio::test]
    async fn join_to_hidden_group_masks_existence() {
        let (instance, _, member) = open_instance();
        instance.groups.test_seed_group("ghost", true, true, false).await;

        let rejection = instance
            .groups
            .check_write(&event(&member, GROUP_JOIN_REQUEST, h_tag("ghost"), ""))
            .await;
        assert_eq!(rejection.as_deref(), Some("invalid: group not found"));
    }

    #[tokio::test]
    async fn hidden_group_posts_look_like_missing_group() {
        let (instance, _, member) = open_instance();
        instance.groups.test_seed_group("ghost", false, true, false).await;

        let rejection = instance
            .groups
            .check_write(&event(&member, 9, h_tag("ghost"), "hi"))
            .await;
        assert_eq!(rejection.as_deref(), Some("invalid: group not found"));

        instance
            .groups
            .test_seed_member("ghost", &member.public_key().to_hex())
            .await;
        let accepted = instance
            .groups
            .check_write(&event(&member, 9, h_tag("ghost"), "hi"))
            .await;
        assert_eq!(accepted, None);
    }

    #[tokio::test]
    async fn leave_requires_membership() {
        let (instance, _, member) = open_instance();
        instance.groups.test_seed_group("pub", false, false, false).await;

        let rejection = instance
            .groups
            .check_write(&event(&member, GROUP_LEAVE_REQUEST, h_tag("pub"), ""))
            .await;
        assert_eq!(rejection.as_deref(), Some("duplicate: not currently a member"));

        instance
            .groups
            .test_seed_member("pub", &member.public_key().to_hex())
            .await;
        let accepted = instance
            .groups
            .check_write(&event(&member, GROUP_LEAVE_REQUEST, h_tag("pub"), ""))
            .await;
        assert_eq!(accepted, None);
    }

    #[tokio::test]
    async fn closed_groups_reject_non_members() {
        let (instance, _, member) = open_instance();
        instance.groups.test_seed_group("club", false, false, true).await;

        let rejection = instance
            .groups
            .check_write(&event(&member, 9, h_tag("club"), "hi"))
            .await;
        assert_eq!(
            rejection.as_deref(),
            Some("restricted: you are not a member of that group")
        );

        instance
            .groups
            .test_seed_member("club", &member.public_key().to_hex())
            .await;
        let accepted = instance
            .groups
            .check_write(&event(&member, 9, h_tag("club"), "hi"))
            .await;
        assert_eq!(accepted, None);
    }

    #[tokio::test]
    async fn relay_sentinel_state_is_world_readable() {
        let (instance, _, member) = open_instance();
        let admins_list = event(
            instance.config.keys(),
            GROUP_ADMINS,
            vec![vec!["-".to_string()], vec!["d".to_string(), "_".to_string()]],
            "",
        );
        assert!(instance.groups.can_read(None, &admins_list).await);
        assert!(
            instance
                .groups
                .can_read(Some(&member.public_key().to_hex()), &admins_list)
                .await
        );
    }

    #[tokio::test]
    async fn read_visibility_follows_group_flags() {
        let (instance, _, member) = open_instance();
        let member_pk = member.public_key().to_hex();
        let stranger = Keys::generate().public_key().to_hex();

        instance.groups.test_seed_group("pub", false, false, false).await;
        instance.groups.test_seed_group("priv", true, false, false).await;
        instance.groups.test_seed_group("ghost", true, true, false).await;
        instance.groups.test_seed_member("priv", &member_pk).await;
        instance.groups.test_seed_member("ghost", &member_pk).await;

        let chat = |h: &str| event(&member, 9, h_tag(h), "hi");

        // Open relay: public group content is readable by any viewer.
        assert!(instance.groups.can_read(Some(&stranger), &chat("pub")).await);

        // Private group content requires access.
        assert!(!instance.groups.can_read(Some(&stranger), &chat("priv")).await);
        assert!(instance.groups.can_read(Some(&member_pk), &chat("priv")).await);

        // Hidden groups are invisible wholesale, metadata included.
        let ghost_meta = event(
            instance.config.keys(),
            GROUP_METADATA,
            vec![vec!["d".to_string(), "ghost".to_string()]],
            "",
        );
        assert!(!instance.groups.can_read(Some(&stranger), &chat("ghost")).await);
        assert!(!instance.groups.can_read(Some(&stranger), &ghost_meta).await);
        assert!(instance.groups.can_read(Some(&member_pk), &ghost_meta).await);

        // Unknown groups read as nothing.
        assert!(!instance.groups.can_read(Some(&member_pk), &chat("nowhere")).await);
    }

    #[tokio::test]
    async fn metadata_and_tombstones_are_readable_for_visible_groups() {
        let (instance, _, _) = open_instance();
        let stranger = Keys::generate().public_key().to_hex();
        instance.groups.test_seed_group("priv", true, false, false).await;

        let meta = event(
            instance.config.keys(),
            GROUP_METADATA,
            vec![vec!["d".to_string(), "priv".to_string()]],
            "",
        );
        let tombstone = event(
            instance.config.keys(),
            GROUP_DELETE_GROUP,
            h_tag("priv"),
            "",
        );

        assert!(instance.groups.can_read(Some(&stranger), &meta).await);
        assert!(instance.groups.can_read(Some(&stranger), &tombstone).await);
    }

    #[tokio::test]
    async fn closed_relay_requires_group_access_to_read() {
        let testing::TestTenant { config, .. } = testing::tenant(|file| {
            file.policy.open = false;
        });
        let instance = testing::warmed_instance(config);
        let member = Keys::generate().public_key().to_hex();
        let stranger = Keys::generate().public_key().to_hex();

        instance.groups.test_seed_group("pub", false, false, false).await;
        instance.groups.test_seed_member("pub", &member).await;

        let chat = event(&Keys::generate(), 9, h_tag("pub"), "hi");
        assert!(!instance.groups.can_read(Some(&stranger), &chat).await);
        assert!(instance.groups.can_read(Some(&member), &chat).await);
    }

    #[tokio::test]
    async fn reads_denied_when_groups_disabled() {
        let testing::TestTenant { config, .. } = testing::tenant(|file| {
            file.groups.enabled = false;
        });
        let instance = testing::warmed_instance(config);
        let chat = event(&Keys::generate(), 9, h_tag("pub"), "hi");
        assert!(!instance.groups.can_read(None, &chat).await);
    }

    #[tokio::test]
    async fn private_group_admins_collapse_to_creator() {
        let (instance, _, creator) = open_instance();
        let creator_pk = creator.public_key().to_hex();
        instance.groups.test_seed_group("priv", true, false, false).await;
        instance.groups.record_creator("priv", &creator_pk).await;

        assert_eq!(instance.groups.get_admins("priv").await, vec![creator_pk]);

        // Relay-level admins include the owner and the relay itself.
        let relay_admins = instance.groups.get_admins("_").await;
        assert!(relay_admins.contains(&instance.config.owner_pubkey().to_string()));
        assert!(relay_admins.contains(&instance.config.self_pubkey()));
    }

    #[tokio::test]
    async fn deleting_a_group_drops_every_projection() {
        let (instance, _, member) = open_instance();
        let member_pk = member.public_key().to_hex();
        instance.groups.test_seed_group("pub", false, false, false).await;
        instance.groups.test_seed_member("pub", &member_pk).await;
        instance.groups.record_creator("pub", &member_pk).await;

        // The purge scan runs against the store; a failing scan still must
        // not leave projections behind.
        instance.groups.delete_group("pub").await;

        assert_eq!(instance.groups.test_metadata_len().await, 0);
        assert!(!instance.groups.is_member("pub", &member_pk).await);
        assert_eq!(instance.groups.get_creator("pub").await, None);
    }
}
