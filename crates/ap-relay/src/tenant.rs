//! Per-tenant TOML configuration: identity, policy flags and the role table.

use anyhow::{anyhow, Context, Result};
use ap_core::keys;
use nostr_sdk::prelude::{Keys, PublicKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Role {
    #[serde(default)]
    pub pubkeys: Vec<String>,
    #[serde(default)]
    pub can_invite: bool,
    #[serde(default)]
    pub can_manage: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Info {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub pubkey: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Policy {
    /// Allow all authenticated users; no relay membership required.
    #[serde(default)]
    pub open: bool,
    #[serde(default)]
    pub public_join: bool,
    #[serde(default)]
    pub strip_signatures: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupsPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub auto_join: bool,
    /// Only admins can create groups.
    #[serde(default)]
    pub admin_create_only: bool,
    /// Only admins can create private groups.
    #[serde(default)]
    pub private_admin_only: bool,
    /// Relay admins can see and moderate private groups.
    #[serde(default)]
    pub private_relay_admin_access: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagementPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub methods: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlossomPolicy {
    #[serde(default)]
    pub enabled: bool,
}

/// The serialized shape of a tenant file. Kept separate from `TenantConfig`
/// so the decoded secret never round-trips accidentally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantFile {
    pub host: String,
    pub schema: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub info: Info,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub groups: GroupsPolicy,
    #[serde(default)]
    pub management: ManagementPolicy,
    #[serde(default)]
    pub blossom: BlossomPolicy,
    #[serde(default)]
    pub roles: BTreeMap<String, Role>,
}

pub struct TenantConfig {
    pub host: String,
    pub schema: String,
    pub info: Info,
    pub policy: Policy,
    pub groups: GroupsPolicy,
    pub management: ManagementPolicy,
    pub blossom: BlossomPolicy,
    pub roles: BTreeMap<String, Role>,
    path: PathBuf,
    keys: Keys,
    owner: String,
}

impl TenantConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let file: TenantFile = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Self::from_file(file, path.to_path_buf())
    }

    pub fn from_file(file: TenantFile, path: PathBuf) -> Result<Self> {
        if file.host.is_empty() {
            return Err(anyhow!("host is required"));
        }
        if file.schema.is_empty() {
            return Err(anyhow!("schema is required"));
        }

        let keys = keys::keys_from_hex(&file.secret).context("secret must be 32-byte hex")?;
        let owner = PublicKey::from_hex(&file.info.pubkey)
            .context("info.pubkey must be a valid owner pubkey")?
            .to_hex();

        Ok(Self {
            host: file.host,
            schema: file.schema,
            info: file.info,
            policy: file.policy,
            groups: file.groups,
            management: file.management,
            blossom: file.blossom,
            roles: file.roles,
            path,
            keys,
            owner,
        })
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// The relay's own pubkey, derived from the tenant secret.
    pub fn self_pubkey(&self) -> String {
        keys::public_key_hex(&self.keys)
    }

    pub fn owner_pubkey(&self) -> &str {
        &self.owner
    }

    pub fn is_self(&self, pubkey: &str) -> bool {
        pubkey == self.self_pubkey()
    }

    pub fn is_owner(&self, pubkey: &str) -> bool {
        pubkey == self.owner
    }

    /// Every pubkey explicitly listed in any role.
    pub fn role_pubkeys(&self) -> Vec<String> {
        let mut pubkeys = Vec::new();
        for role in self.roles.values() {
            for hex in &role.pubkeys {
                if let Ok(pubkey) = PublicKey::from_hex(hex) {
                    pubkeys.push(pubkey.to_hex());
                }
            }
        }
        pubkeys
    }

    /// Roles granted to a pubkey. The special role "member" is granted by
    /// relay membership rather than an explicit pubkey list, so the caller
    /// supplies that fact.
    pub fn roles_for(&self, pubkey: &str, is_relay_member: bool) -> Vec<&Role> {
        self.roles
            .iter()
            .filter(|(name, role)| {
                if name.as_str() == "member" {
                    is_relay_member
                } else {
                    role.pubkeys.iter().any(|hex| hex == pubkey)
                }
            })
            .map(|(_, role)| role)
            .collect()
    }

    pub fn can_invite(&self, pubkey: &str, is_relay_member: bool) -> bool {
        if self.is_owner(pubkey) || self.is_self(pubkey) {
            return true;
        }
        self.roles_for(pubkey, is_relay_member)
            .iter()
            .any(|role| role.can_invite)
    }

    pub fn can_manage(&self, pubkey: &str, is_relay_member: bool) -> bool {
        if self.is_owner(pubkey) || self.is_self(pubkey) {
            return true;
        }
        self.roles_for(pubkey, is_relay_member)
            .iter()
            .any(|role| role.can_manage)
    }

    /// Read-modify-write the backing TOML file. The running instance is not
    /// mutated in place; the registry's reload loop picks the change up and
    /// rebuilds the tenant.
    pub fn rewrite(&self, apply: impl FnOnce(&mut TenantFile)) -> Result<()> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read config file {}", self.path.display()))?;
        let mut file: TenantFile = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", self.path.display()))?;
        apply(&mut file);
        let serialized = toml::to_string_pretty(&file)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("failed to write config file {}", self.path.display()))?;
        Ok(())
    }

    pub fn set_name(&self, name: &str) -> Result<()> {
        self.rewrite(|file| file.info.name = name.to_string())
    }

    pub fn set_description(&self, description: &str) -> Result<()> {
        self.rewrite(|file| file.info.description = description.to_string())
    }

    pub fn set_icon(&self, icon: &str) -> Result<()> {
        self.rewrite(|file| file.info.icon = icon.to_string())
    }
}
