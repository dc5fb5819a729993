//! One virtual relay: the composition root wiring config, store and engines
//! together, plus the per-connection admission hooks.

use anyhow::Result;
use ap_core::nostr::RawEvent;
use nostr_sdk::prelude::PublicKey;
use serde_json::json;
use sqlx::{Pool, Postgres};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::filters::Filter;
use crate::groups::{group_id_of, GroupEngine};
use crate::kinds::{
    APPLICATION_DATA, GIFT_WRAP, GROUP_CREATE_GROUP, GROUP_DELETE_GROUP, GROUP_EDIT_METADATA,
    GROUP_JOIN_REQUEST, GROUP_LEAVE_REQUEST, GROUP_PUT_USER, GROUP_REMOVE_USER,
    INTERNAL_DATA_PREFIX, RELAY_ADD_MEMBER, RELAY_INVITE, RELAY_JOIN, RELAY_LEAVE, RELAY_MEMBERS,
    RELAY_REMOVE_MEMBER, RELAY_SENTINEL_GROUP, ZAP_RECEIPT,
};
use crate::management::ManagementEngine;
use crate::store::EventStore;
use crate::tenant::TenantConfig;

pub struct Instance {
    pub config: Arc<TenantConfig>,
    pub store: Arc<EventStore>,
    pub management: Arc<ManagementEngine>,
    pub groups: Arc<GroupEngine>,
    pub broadcast: broadcast::Sender<RawEvent>,
}

impl Instance {
    /// Wire config, store and engines together without touching the
    /// database.
    pub(crate) fn compose(pool: Pool<Postgres>, config: Arc<TenantConfig>) -> Arc<Self> {
        let (broadcast_tx, _) = broadcast::channel(1024);
        let store = Arc::new(EventStore::new(
            pool,
            &config.schema,
            config.keys().clone(),
            broadcast_tx.clone(),
        ));
        let management = Arc::new(ManagementEngine::new(Arc::clone(&config), Arc::clone(&store)));
        let groups = Arc::new(GroupEngine::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&management),
        ));

        Arc::new(Self {
            config,
            store,
            management,
            groups,
            broadcast: broadcast_tx,
        })
    }

    /// Build, warm and enable one tenant. Failures here abort this tenant
    /// only; the caller keeps other instances serving.
    pub async fn boot(pool: Pool<Postgres>, config: TenantConfig) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let instance = Self::compose(pool, Arc::clone(&config));

        instance.store.init().await?;
        instance.management.warm().await?;
        instance.groups.warm().await?;

        if config.groups.enabled {
            // Publish the relay-level admins list so clients can query it as
            // a group-admins record with d = "_".
            if let Err(err) = instance.groups.update_admins_list(RELAY_SENTINEL_GROUP).await {
                tracing::warn!(host = %config.host, error = %err, "failed to publish relay admin list");
            }
        }

        instance.management.allow_pubkey(&config.self_pubkey()).await?;
        instance.management.allow_pubkey(config.owner_pubkey()).await?;
        for pubkey in config.role_pubkeys() {
            instance.management.allow_pubkey(&pubkey).await?;
        }

        Ok(instance)
    }

    // Utility predicates

    pub async fn strip_signature(&self, viewer: Option<&str>, mut event: RawEvent) -> RawEvent {
        if !self.config.policy.strip_signatures {
            return event;
        }
        let can_manage = match viewer {
            Some(pubkey) => self.management.can_manage(pubkey).await,
            None => false,
        };
        if !can_manage {
            event.sig = "0".repeat(128);
        }
        event
    }

    /// Zap receipts and gift wraps are accepted on behalf of the tagged
    /// recipient when that recipient is a relay member.
    pub async fn allow_recipient_event(&self, event: &RawEvent) -> bool {
        if event.kind != ZAP_RECEIPT && event.kind != GIFT_WRAP {
            return false;
        }
        let Some(recipient) = event.first_tag_value("p") else {
            return false;
        };
        if PublicKey::from_hex(&recipient).is_err() {
            return false;
        }
        self.management.is_member(&recipient).await
    }

    /// Relay bookkeeping records are never accepted from or served to
    /// clients.
    pub fn is_internal_event(&self, event: &RawEvent) -> bool {
        event.kind == APPLICATION_DATA
            && event
                .d_tag()
                .map(|d| d.starts_with(INTERNAL_DATA_PREFIX))
                .unwrap_or(false)
    }

    pub fn is_read_only_event(&self, event: &RawEvent) -> bool {
        [RELAY_ADD_MEMBER, RELAY_REMOVE_MEMBER, RELAY_MEMBERS].contains(&event.kind)
    }

    pub fn is_write_only_event(&self, event: &RawEvent) -> bool {
        [RELAY_JOIN, RELAY_LEAVE].contains(&event.kind)
    }

    pub fn prevent_broadcast(&self, event: &RawEvent) -> bool {
        self.is_write_only_event(event)
    }

    // Requests

    pub async fn on_request(&self, viewer: Option<&str>) -> Option<String> {
        let Some(pubkey) = viewer else {
            return Some("auth-required: authentication is required for access".to_string());
        };

        if !self.config.policy.open && !self.management.is_member(pubkey).await {
            return Some("restricted: you are not a member of this relay".to_string());
        }

        None
    }

    pub async fn query_stored(&self, viewer: Option<&str>, filter: &Filter) -> Result<Vec<RawEvent>> {
        let mut results = Vec::new();
        let viewer_pk = viewer.unwrap_or_default();

        let mut generated = Vec::new();
        if filter.kinds_include(RELAY_INVITE) && self.management.can_invite(viewer_pk).await {
            generated.push(self.management.generate_invite(viewer_pk).await?);
        }

        for event in generated {
            if !filter.matches(&event) {
                continue;
            }
            results.push(self.strip_signature(viewer, event).await);
        }

        for event in self.store.query(filter, 1000).await? {
            if event.kind == RELAY_INVITE {
                continue;
            }
            if self.is_internal_event(&event) {
                continue;
            }
            if self.is_write_only_event(&event) {
                continue;
            }
            if self.groups.is_group_event(&event) && !self.groups.can_read(viewer, &event).await {
                continue;
            }
            results.push(self.strip_signature(viewer, event).await);
        }

        Ok(results)
    }

    // Event publishing

    pub async fn on_event(&self, viewer: Option<&str>, event: &RawEvent) -> Option<String> {
        if self.allow_recipient_event(event).await {
            return None;
        }

        let Some(pubkey) = viewer else {
            return Some("auth-required: authentication is required for access".to_string());
        };
        if pubkey != event.pubkey {
            return Some("restricted: you cannot publish events on behalf of others".to_string());
        }

        if event.kind == RELAY_JOIN {
            return self.management.validate_join_request(event).await;
        }

        if !self.config.policy.open && !self.management.is_member(pubkey).await {
            return Some("restricted: you are not a member of this relay".to_string());
        }

        if self.is_internal_event(event) || self.is_read_only_event(event) {
            return Some("invalid: this event's kind is not accepted".to_string());
        }

        if self.groups.is_group_event(event) {
            if let Some(reason) = self.groups.check_write(event).await {
                return Some(reason);
            }
        }

        if self.management.event_is_banned(&event.id).await {
            return Some("restricted: this event has been banned from this relay".to_string());
        }

        None
    }

    /// Post-persistence side effects: maintain the projections and republish
    /// the derived list events. Failures are logged; the write itself has
    /// already been accepted.
    pub async fn on_event_saved(&self, event: &RawEvent) {
        let h = group_id_of(event);

        let result: Result<()> = async {
            match event.kind {
                GROUP_JOIN_REQUEST if self.config.groups.auto_join => {
                    self.groups.add_member(&h, &event.pubkey).await?;
                    self.groups.update_members_list(&h).await?;
                }
                GROUP_LEAVE_REQUEST => {
                    self.groups.remove_member(&h, &event.pubkey).await?;
                    self.groups.update_members_list(&h).await?;
                }
                GROUP_PUT_USER | GROUP_REMOVE_USER => {
                    // Externally-sourced membership mutations only touch the
                    // cache; the triggering event is already the log record.
                    self.groups.apply_membership_event(&h, event).await;
                    self.groups.update_members_list(&h).await?;
                }
                GROUP_CREATE_GROUP => {
                    self.groups.record_creator(&h, &event.pubkey).await;
                    self.groups.update_metadata(event).await?;
                    if self.config.groups.auto_join {
                        self.groups.add_member(&h, &event.pubkey).await?;
                    }
                    self.groups.update_members_list(&h).await?;
                    self.groups.update_admins_list(&h).await?;
                }
                GROUP_EDIT_METADATA => {
                    self.groups.update_metadata(event).await?;
                    self.groups.update_admins_list(&h).await?;
                }
                GROUP_DELETE_GROUP => {
                    self.groups.delete_group(&h).await;
                }
                _ => {}
            }
            Ok(())
        }
        .await;

        if let Err(err) = result {
            tracing::warn!(kind = event.kind, error = %err, "event side effects failed");
        }
    }

    /// Join/leave signals are not persisted; they only move relay
    /// membership.
    pub async fn on_ephemeral_event(&self, event: &RawEvent) {
        let result = match event.kind {
            RELAY_JOIN => self.management.add_member(&event.pubkey).await,
            RELAY_LEAVE => self.management.remove_member(&event.pubkey).await,
            _ => Ok(()),
        };

        if let Err(err) = result {
            tracing::warn!(kind = event.kind, error = %err, "ephemeral side effects failed");
        }
    }

    /// The NIP-11 relay information document.
    pub fn info_document(&self) -> serde_json::Value {
        let mut nips = vec![1, 11, 42];
        if self.config.groups.enabled {
            nips.push(29);
        }

        json!({
            "name": self.config.info.name,
            "description": self.config.info.description,
            "icon": self.config.info.icon,
            "pubkey": self.config.owner_pubkey(),
            "software": "https://github.com/coracle-social/apiary",
            "version": env!("CARGO_PKG_VERSION"),
            "supported_nips": nips,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::{APPLICATION_DATA, BANNED_PUBKEYS_D, GIFT_WRAP, RELAY_MEMBERS};
    use crate::testing;
    use ap_core::nostr::build_signed_event;
    use nostr_sdk::prelude::Keys;

    fn event(keys: &Keys, kind: u16, tags: Vec<Vec<String>>, content: &str) -> RawEvent {
        build_signed_event(keys, kind, tags, content.to_string()).expect("signed event")
    }

    fn note(keys: &Keys) -> RawEvent {
        event(keys, 1, Vec::new(), "hello")
    }

    #[tokio::test]
    async fn requests_require_authentication() {
        let testing::TestTenant { config, .. } = testing::tenant(|file| {
            file.policy.open = true;
        });
        let instance = testing::warmed_instance(config);

        assert_eq!(
            instance.on_request(None).await.as_deref(),
            Some("auth-required: authentication is required for access")
        );
        assert_eq!(
            instance
                .on_request(Some(&Keys::generate().public_key().to_hex()))
                .await,
            None
        );
    }

    #[tokio::test]
    async fn closed_relay_requests_require_membership() {
        let testing::TestTenant { config, .. } = testing::tenant(|_| {});
        let instance = testing::warmed_instance(config);
        let member = Keys::generate().public_key().to_hex();
        instance.management.test_seed_member(&member).await;

        assert_eq!(
            instance
                .on_request(Some(&Keys::generate().public_key().to_hex()))
                .await
                .as_deref(),
            Some("restricted: you are not a member of this relay")
        );
        assert_eq!(instance.on_request(Some(&member)).await, None);
    }

    #[tokio::test]
    async fn events_require_auth_and_author_binding() {
        let testing::TestTenant { config, .. } = testing::tenant(|file| {
            file.policy.open = true;
        });
        let instance = testing::warmed_instance(config);
        let author = Keys::generate();
        let note = note(&author);

        assert_eq!(
            instance.on_event(None, &note).await.as_deref(),
            Some("auth-required: authentication is required for access")
        );

        let somebody_else = Keys::generate().public_key().to_hex();
        assert_eq!(
            instance.on_event(Some(&somebody_else), &note).await.as_deref(),
            Some("restricted: you cannot publish events on behalf of others")
        );

        assert_eq!(
            instance
                .on_event(Some(&author.public_key().to_hex()), &note)
                .await,
            None
        );
    }

    #[tokio::test]
    async fn closed_relay_events_require_membership() {
        let testing::TestTenant { config, .. } = testing::tenant(|_| {});
        let instance = testing::warmed_instance(config);
        let author = Keys::generate();
        let note = note(&author);
        let author_pk = author.public_key().to_hex();

        assert_eq!(
            instance.on_event(Some(&author_pk), &note).await.as_deref(),
            Some("restricted: you are not a member of this relay")
        );

        instance.management.test_seed_member(&author_pk).await;
        assert_eq!(instance.on_event(Some(&author_pk), &note).await, None);
    }

    #[tokio::test]
    async fn relay_join_is_routed_to_join_validation() {
        let testing::TestTenant { config, .. } = testing::tenant(|file| {
            file.policy.public_join = true;
        });
        let instance = testing::warmed_instance(config);
        let joiner = Keys::generate();
        let join = event(&joiner, RELAY_JOIN, Vec::new(), "");

        // Not a member yet: accepted purely through the join policy.
        assert_eq!(
            instance
                .on_event(Some(&joiner.public_key().to_hex()), &join)
                .await,
            None
        );
    }

    #[tokio::test]
    async fn reserved_kinds_are_rejected() {
        let testing::TestTenant { config, .. } = testing::tenant(|file| {
            file.policy.open = true;
        });
        let instance = testing::warmed_instance(config);
        let author = Keys::generate();
        let author_pk = author.public_key().to_hex();

        let internal = event(
            &author,
            APPLICATION_DATA,
            vec![vec!["d".to_string(), BANNED_PUBKEYS_D.to_string()]],
            "",
        );
        assert_eq!(
            instance.on_event(Some(&author_pk), &internal).await.as_deref(),
            Some("invalid: this event's kind is not accepted")
        );

        let read_only = event(&author, RELAY_MEMBERS, vec![vec!["-".to_string()]], "");
        assert_eq!(
            instance.on_event(Some(&author_pk), &read_only).await.as_deref(),
            Some("invalid: this event's kind is not accepted")
        );
    }

    #[tokio::test]
    async fn group_events_route_through_the_write_table() {
        let testing::TestTenant { config, .. } = testing::tenant(|file| {
            file.policy.open = true;
        });
        let instance = testing::warmed_instance(config);
        instance.groups.test_seed_group("pub", false, false, false).await;
        let author = Keys::generate();

        let create = event(
            &author,
            GROUP_CREATE_GROUP,
            vec![vec!["h".to_string(), "pub".to_string()]],
            "{}",
        );
        assert_eq!(
            instance
                .on_event(Some(&author.public_key().to_hex()), &create)
                .await
                .as_deref(),
            Some("invalid: that group already exists")
        );
    }

    #[tokio::test]
    async fn banned_events_are_refused() {
        let testing::TestTenant { config, .. } = testing::tenant(|file| {
            file.policy.open = true;
        });
        let instance = testing::warmed_instance(config);
        let author = Keys::generate();
        let note = note(&author);
        instance
            .management
            .test_seed_banned_event(&note.id, "illegal")
            .await;

        assert_eq!(
            instance
                .on_event(Some(&author.public_key().to_hex()), &note)
                .await
                .as_deref(),
            Some("restricted: this event has been banned from this relay")
        );
    }

    #[tokio::test]
    async fn recipient_kinds_bypass_authentication_for_members() {
        let testing::TestTenant { config, .. } = testing::tenant(|_| {});
        let instance = testing::warmed_instance(config);
        let recipient = Keys::generate().public_key().to_hex();
        instance.management.test_seed_member(&recipient).await;

        let wrap = event(
            &Keys::generate(),
            GIFT_WRAP,
            vec![vec!["p".to_string(), recipient]],
            "sealed",
        );
        assert_eq!(instance.on_event(None, &wrap).await, None);

        let stray = event(
            &Keys::generate(),
            GIFT_WRAP,
            vec![vec!["p".to_string(), Keys::generate().public_key().to_hex()]],
            "sealed",
        );
        assert_eq!(
            instance.on_event(None, &stray).await.as_deref(),
            Some("auth-required: authentication is required for access")
        );
    }

    #[tokio::test]
    async fn signatures_are_stripped_for_non_managers() {
        let testing::TestTenant {
            config, owner_keys, ..
        } = testing::tenant(|file| {
            file.policy.strip_signatures = true;
        });
        let instance = testing::warmed_instance(config);
        let note = note(&Keys::generate());

        let stripped = instance
            .strip_signature(Some(&Keys::generate().public_key().to_hex()), note.clone())
            .await;
        assert_eq!(stripped.sig, "0".repeat(128));

        let kept = instance
            .strip_signature(Some(&owner_keys.public_key().to_hex()), note.clone())
            .await;
        assert_eq!(kept.sig, note.sig);
    }

    #[tokio::test]
    async fn signatures_survive_when_stripping_is_off() {
        let testing::TestTenant { config, .. } = testing::tenant(|_| {});
        let instance = testing::warmed_instance(config);
        let note = note(&Keys::generate());

        let kept = instance.strip_signature(None, note.clone()).await;
        assert_eq!(kept.sig, note.sig);
    }

    #[tokio::test]
    async fn event_class_predicates() {
        let testing::TestTenant { config, .. } = testing::tenant(|_| {});
        let instance = testing::warmed_instance(config);
        let keys = Keys::generate();

        let internal = event(
            &keys,
            APPLICATION_DATA,
            vec![vec!["d".to_string(), BANNED_PUBKEYS_D.to_string()]],
            "",
        );
        assert!(instance.is_internal_event(&internal));

        let ordinary_data = event(
            &keys,
            APPLICATION_DATA,
            vec![vec!["d".to_string(), "my-app/settings".to_string()]],
            "",
        );
        assert!(!instance.is_internal_event(&ordinary_data));

        assert!(instance.is_read_only_event(&event(&keys, RELAY_MEMBERS, Vec::new(), "")));
        assert!(instance.is_write_only_event(&event(&keys, RELAY_JOIN, Vec::new(), "")));
        assert!(instance.prevent_broadcast(&event(&keys, RELAY_LEAVE, Vec::new(), "")));
        assert!(!instance.prevent_broadcast(&note(&keys)));
    }

    #[tokio::test]
    async fn info_document_reflects_the_tenant() {
        let testing::TestTenant {
            config, owner_keys, ..
        } = testing::tenant(|_| {});
        let instance = testing::warmed_instance(config);

        let info = instance.info_document();
        assert_eq!(info["name"], "Test Relay");
        assert_eq!(info["pubkey"], owner_keys.public_key().to_hex());
        let nips = info["supported_nips"].as_array().expect("nips");
        assert!(nips.contains(&json!(29)));
        assert!(nips.contains(&json!(42)));
    }
}
