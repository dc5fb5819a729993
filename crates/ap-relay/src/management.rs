//! Relay-level membership and ban books.
//!
//! The banned-pubkeys and banned-events books are application-specific data
//! events, kept independently of the members list. Membership is a canonical
//! replaceable members-list event plus add/remove marker events.
//!
//! `ban_pubkey` and `allow_pubkey` keep the ban and membership books in sync
//! and should be preferred over the lower-level calls. Every action is
//! idempotent and does nothing when conditions are already correct.

use anyhow::Result;
use ap_core::nostr::{self, RawEvent};
use nostr_sdk::prelude::PublicKey;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::filters::Filter;
use crate::kinds::{
    BANNED_EVENTS_D, BANNED_PUBKEYS_D, RELAY_ADD_MEMBER, RELAY_INVITE, RELAY_MEMBERS,
    RELAY_REMOVE_MEMBER,
};
use crate::store::EventStore;
use crate::tenant::TenantConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdReason {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubkeyReason {
    pub pubkey: String,
    pub reason: String,
}

pub struct ManagementEngine {
    config: Arc<TenantConfig>,
    store: Arc<EventStore>,
    relay_members: RwLock<HashSet<String>>,
    banned_pubkeys: RwLock<HashMap<String, String>>,
    banned_events: RwLock<HashMap<String, String>>,
    warmed: AtomicBool,
}

impl ManagementEngine {
    pub fn new(config: Arc<TenantConfig>, store: Arc<EventStore>) -> Self {
        Self {
            config,
            store,
            relay_members: RwLock::new(HashSet::new()),
            banned_pubkeys: RwLock::new(HashMap::new()),
            banned_events: RwLock::new(HashMap::new()),
            warmed: AtomicBool::new(false),
        }
    }

    fn is_warmed(&self) -> bool {
        self.warmed.load(Ordering::Acquire)
    }

    pub async fn warm(&self) -> Result<()> {
        let members_list = self.store.get_or_create_relay_members_list().await?;
        {
            let mut members = self.relay_members.write().await;
            for hex in members_list.tag_values("member") {
                if let Ok(pubkey) = PublicKey::from_hex(&hex) {
                    members.insert(pubkey.to_hex());
                }
            }
        }

        let banned = self
            .store
            .get_or_create_application_data(BANNED_PUBKEYS_D)
            .await?;
        {
            let mut banned_pubkeys = self.banned_pubkeys.write().await;
            for tag in &banned.tags {
                if tag.first().map(|v| v.as_str()) == Some("banned") && tag.len() >= 2 {
                    if let Ok(pubkey) = PublicKey::from_hex(&tag[1]) {
                        let reason = tag.get(2).cloned().unwrap_or_default();
                        banned_pubkeys.insert(pubkey.to_hex(), reason);
                    }
                }
            }
        }

        let banned = self
            .store
            .get_or_create_application_data(BANNED_EVENTS_D)
            .await?;
        {
            let mut banned_events = self.banned_events.write().await;
            for tag in &banned.tags {
                if tag.first().map(|v| v.as_str()) == Some("event") && tag.len() >= 2 {
                    let reason = tag.get(2).cloned().unwrap_or_default();
                    banned_events.insert(tag[1].clone(), reason);
                }
            }
        }

        self.warmed.store(true, Ordering::Release);
        Ok(())
    }

    // Banned events

    pub async fn get_banned_event_items(&self) -> Result<Vec<IdReason>> {
        if self.is_warmed() {
            let banned = self.banned_events.read().await;
            return Ok(banned
                .iter()
                .map(|(id, reason)| IdReason {
                    id: id.clone(),
                    reason: reason.clone(),
                })
                .collect());
        }

        let event = self
            .store
            .get_or_create_application_data(BANNED_EVENTS_D)
            .await?;
        Ok(event
            .tags
            .iter()
            .filter(|tag| tag.first().map(|v| v.as_str()) == Some("event") && tag.len() >= 2)
            .map(|tag| IdReason {
                id: tag[1].clone(),
                reason: tag.get(2).cloned().unwrap_or_default(),
            })
            .collect())
    }

    /// Banning an event deletes it and remembers the ban.
    pub async fn ban_event(&self, id: &str, reason: &str) -> Result<()> {
        self.store.delete(id).await?;

        let mut event = self
            .store
            .get_or_create_application_data(BANNED_EVENTS_D)
            .await?;
        event
            .tags
            .push(vec!["event".to_string(), id.to_string(), reason.to_string()]);
        self.store
            .sign_and_store(event.kind, nostr::now(), event.tags, event.content, false)
            .await?;

        self.banned_events
            .write()
            .await
            .insert(id.to_string(), reason.to_string());
        Ok(())
    }

    pub async fn allow_event(&self, id: &str) -> Result<()> {
        let mut event = self
            .store
            .get_or_create_application_data(BANNED_EVENTS_D)
            .await?;
        event.tags.retain(|tag| {
            !(tag.first().map(|v| v.as_str()) == Some("event")
                && tag.get(1).map(|v| v.as_str()) == Some(id))
        });
        self.store
            .sign_and_store(event.kind, nostr::now(), event.tags, event.content, false)
            .await?;

        self.banned_events.write().await.remove(id);
        Ok(())
    }

    pub async fn event_is_banned(&self, id: &str) -> bool {
        if self.is_warmed() {
            return self.banned_events.read().await.contains_key(id);
        }

        match self
            .store
            .get_or_create_application_data(BANNED_EVENTS_D)
            .await
        {
            Ok(event) => event.tag_with_value("event", id).is_some(),
            Err(err) => {
                tracing::warn!(error = %err, "banned events lookup failed");
                false
            }
        }
    }

    // Banned pubkeys

    pub async fn get_banned_pubkey_items(&self) -> Result<Vec<PubkeyReason>> {
        if self.is_warmed() {
            let banned = self.banned_pubkeys.read().await;
            return Ok(banned
                .iter()
                .map(|(pubkey, reason)| PubkeyReason {
                    pubkey: pubkey.clone(),
                    reason: reason.clone(),
                })
                .collect());
        }

        let event = self
            .store
            .get_or_create_application_data(BANNED_PUBKEYS_D)
            .await?;
        Ok(event
            .tags
            .iter()
            .filter(|tag| tag.first().map(|v| v.as_str()) == Some("banned") && tag.len() >= 2)
            .map(|tag| PubkeyReason {
                pubkey: tag[1].clone(),
                reason: tag.get(2).cloned().unwrap_or_default(),
            })
            .collect())
    }

    pub async fn add_banned_pubkey(&self, pubkey: &str, reason: &str) -> Result<()> {
        let mut event = self
            .store
            .get_or_create_application_data(BANNED_PUBKEYS_D)
            .await?;

        if event.tag_with_value("banned", pubkey).is_none() {
            event.tags.push(vec![
                "banned".to_string(),
                pubkey.to_string(),
                reason.to_string(),
            ]);
            self.store
                .sign_and_store(event.kind, nostr::now(), event.tags, event.content, false)
                .await?;
        }

        self.banned_pubkeys
            .write()
            .await
            .insert(pubkey.to_string(), reason.to_string());
        Ok(())
    }

    pub async fn remove_banned_pubkey(&self, pubkey: &str) -> Result<()> {
        let mut event = self
            .store
            .get_or_create_application_data(BANNED_PUBKEYS_D)
            .await?;

        if event.tag_with_value("banned", pubkey).is_some() {
            event.tags.retain(|tag| {
                !(tag.first().map(|v| v.as_str()) == Some("banned")
                    && tag.get(1).map(|v| v.as_str()) == Some(pubkey))
            });
            self.store
                .sign_and_store(event.kind, nostr::now(), event.tags, event.content, false)
                .await?;
        }

        self.banned_pubkeys.write().await.remove(pubkey);
        Ok(())
    }

    pub async fn pubkey_is_banned(&self, pubkey: &str) -> bool {
        if self.is_warmed() {
            return self.banned_pubkeys.read().await.contains_key(pubkey);
        }

        match self
            .store
            .get_or_create_application_data(BANNED_PUBKEYS_D)
            .await
        {
            Ok(event) => event.tag_with_value("banned", pubkey).is_some(),
            Err(err) => {
                tracing::warn!(error = %err, "banned pubkeys lookup failed");
                false
            }
        }
    }

    // Admins

    /// Relay-level admin test: the configured owner or the relay itself.
    pub fn is_admin(&self, pubkey: &str) -> bool {
        self.config.is_owner(pubkey) || self.config.is_self(pubkey)
    }

    pub fn get_admins(&self) -> Vec<String> {
        let mut admins = vec![
            self.config.owner_pubkey().to_string(),
            self.config.self_pubkey(),
        ];

        for role in self.config.roles.values() {
            if role.can_manage {
                for hex in &role.pubkeys {
                    if let Ok(pubkey) = PublicKey::from_hex(hex) {
                        admins.push(pubkey.to_hex());
                    }
                }
            }
        }

        let mut seen = HashSet::new();
        admins.retain(|pubkey| seen.insert(pubkey.clone()));
        admins
    }

    // Capabilities: the "member" role applies to every relay member, so the
    // capability checks live here where membership is known.

    pub async fn can_invite(&self, pubkey: &str) -> bool {
        let is_member = self.is_member(pubkey).await;
        self.config.can_invite(pubkey, is_member)
    }

    pub async fn can_manage(&self, pubkey: &str) -> bool {
        let is_member = self.is_member(pubkey).await;
        self.config.can_manage(pubkey, is_member)
    }

    // Membership

    pub async fn get_members(&self) -> Vec<String> {
        if self.is_warmed() {
            return self.relay_members.read().await.iter().cloned().collect();
        }

        match self.store.get_or_create_relay_members_list().await {
            Ok(event) => event.tag_values("member"),
            Err(err) => {
                tracing::warn!(error = %err, "members list lookup failed");
                Vec::new()
            }
        }
    }

    pub async fn is_member(&self, pubkey: &str) -> bool {
        if self.is_warmed() {
            return self.relay_members.read().await.contains(pubkey);
        }

        match self.store.get_or_create_relay_members_list().await {
            Ok(event) => event.tag_with_value("member", pubkey).is_some(),
            Err(err) => {
                tracing::warn!(error = %err, "members list lookup failed");
                false
            }
        }
    }

    pub async fn add_member(&self, pubkey: &str) -> Result<()> {
        let mut members_event = self.store.get_or_create_relay_members_list().await?;

        if members_event.tag_with_value("member", pubkey).is_none() {
            self.store
                .sign_and_store(
                    RELAY_ADD_MEMBER,
                    nostr::now(),
                    vec![vec!["-".to_string()], vec!["p".to_string(), pubkey.to_string()]],
                    String::new(),
                    true,
                )
                .await?;

            members_event
                .tags
                .push(vec!["member".to_string(), pubkey.to_string()]);
            self.store
                .sign_and_store(
                    RELAY_MEMBERS,
                    nostr::now(),
                    members_event.tags,
                    members_event.content,
                    true,
                )
                .await?;
        }

        self.relay_members.write().await.insert(pubkey.to_string());
        Ok(())
    }

    pub async fn remove_member(&self, pubkey: &str) -> Result<()> {
        let mut members_event = self.store.get_or_create_relay_members_list().await?;

        if members_event.tag_with_value("member", pubkey).is_some() {
            self.store
                .sign_and_store(
                    RELAY_REMOVE_MEMBER,
                    nostr::now(),
                    vec![vec!["-".to_string()], vec!["p".to_string(), pubkey.to_string()]],
                    String::new(),
                    true,
                )
                .await?;

            members_event.tags.retain(|tag| {
                !(tag.first().map(|v| v.as_str()) == Some("member")
                    && tag.get(1).map(|v| v.as_str()) == Some(pubkey))
            });
            self.store
                .sign_and_store(
                    RELAY_MEMBERS,
                    nostr::now(),
                    members_event.tags,
                    members_event.content,
                    true,
                )
                .await?;
        }

        self.relay_members.write().await.remove(pubkey);
        Ok(())
    }

    // Banning

    /// Ban and purge: drop membership, record the ban, then delete every
    /// event this pubkey authored.
    pub async fn ban_pubkey(&self, pubkey: &str, reason: &str) -> Result<()> {
        self.remove_member(pubkey).await?;
        self.add_banned_pubkey(pubkey, reason).await?;

        let filter = Filter {
            authors: Some(vec![pubkey.to_string()]),
            ..Default::default()
        };
        let to_delete: Vec<String> = self
            .store
            .query(&filter, 0)
            .await?
            .into_iter()
            .map(|event| event.id)
            .collect();
        for id in to_delete {
            self.store.delete(&id).await?;
        }

        Ok(())
    }

    // Allowing

    pub async fn get_allowed_pubkey_items(&self) -> Vec<PubkeyReason> {
        self.get_members()
            .await
            .into_iter()
            .map(|pubkey| PubkeyReason {
                pubkey,
                reason: "relay member".to_string(),
            })
            .collect()
    }

    pub async fn allow_pubkey(&self, pubkey: &str) -> Result<()> {
        self.add_member(pubkey).await?;
        self.remove_banned_pubkey(pubkey).await?;
        Ok(())
    }

    // Joining

    /// Admission decision for a relay join request. `None` accepts.
    pub async fn validate_join_request(&self, event: &RawEvent) -> Option<String> {
        if self.is_member(&event.pubkey).await {
            return None;
        }

        if self.pubkey_is_banned(&event.pubkey).await {
            return Some("invalid: you have been banned from this relay".to_string());
        }

        if self.config.policy.public_join {
            return None;
        }

        let Some(claim) = event.first_tag_value("claim") else {
            return Some("invalid: no claim tag".to_string());
        };

        let filter = Filter {
            kinds: Some(vec![RELAY_INVITE]),
            ..Default::default()
        };
        match self.store.query(&filter, 0).await {
            Ok(invites) => {
                if invites
                    .iter()
                    .any(|invite| invite.tag_with_value("claim", &claim).is_some())
                {
                    return None;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "invite lookup failed");
            }
        }

        Some("invalid: failed to validate invite code".to_string())
    }

    /// The persisted invite for this pubkey, minting one on first use.
    pub async fn generate_invite(&self, pubkey: &str) -> Result<RawEvent> {
        let filter = Filter {
            kinds: Some(vec![RELAY_INVITE]),
            limit: Some(1),
            ..Default::default()
        }
        .tag("p", vec![pubkey.to_string()]);

        if let Some(event) = self.store.query(&filter, 0).await?.into_iter().next() {
            return Ok(event);
        }

        let claim: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();

        self.store
            .sign_and_store(
                RELAY_INVITE,
                nostr::now(),
                vec![
                    vec!["claim".to_string(), claim],
                    vec!["p".to_string(), pubkey.to_string()],
                ],
                String::new(),
                false,
            )
            .await
    }
}

#[cfg(test)]
impl ManagementEngine {
    pub(crate) fn test_mark_warmed(&self) {
        self.warmed.store(true, Ordering::Release);
    }

    pub(crate) async fn test_seed_member(&self, pubkey: &str) {
        self.relay_members.write().await.insert(pubkey.to_string());
    }

    pub(crate) async fn test_seed_banned_pubkey(&self, pubkey: &str, reason: &str) {
        self.banned_pubkeys
            .write()
            .await
            .insert(pubkey.to_string(), reason.to_string());
    }

    pub(crate) async fn test_seed_banned_event(&self, id: &str, reason: &str) {
        self.banned_events
            .write()
            .await
            .insert(id.to_string(), reason.to_string());
    }
}
