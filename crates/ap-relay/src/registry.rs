//! Host -> Instance routing and config-directory hot reload.

use anyhow::{Context, Result};
use sqlx::{Pool, Postgres};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

use crate::instance::Instance;
use crate::kv::Kv;
use crate::tenant::TenantConfig;

type Fingerprint = (SystemTime, u64);

#[derive(Default)]
struct Inner {
    by_host: HashMap<String, Arc<Instance>>,
    by_file: HashMap<String, Arc<Instance>>,
    fingerprints: HashMap<String, Fingerprint>,
}

pub struct Registry {
    pool: Pool<Postgres>,
    config_dir: PathBuf,
    kv: Kv,
    inner: RwLock<Inner>,
}

impl Registry {
    /// Scan the config directory and boot one instance per tenant file. A
    /// tenant that fails to load is logged and skipped; the rest keep
    /// serving.
    pub async fn boot(pool: Pool<Postgres>, config_dir: impl AsRef<Path>) -> Result<Arc<Self>> {
        let config_dir = config_dir.as_ref().to_path_buf();
        fs::create_dir_all(&config_dir)
            .with_context(|| format!("failed to create config directory {}", config_dir.display()))?;

        let kv = Kv::new(pool.clone());
        kv.migrate().await?;

        let registry = Arc::new(Self {
            pool,
            config_dir,
            kv,
            inner: RwLock::new(Inner::default()),
        });

        for (filename, fingerprint) in registry.scan()? {
            if let Err(err) = registry.load_file(&filename, fingerprint).await {
                tracing::error!(file = %filename, error = %err, "failed to load tenant");
            } else {
                tracing::info!(file = %filename, "loaded tenant");
            }
        }

        Ok(registry)
    }

    /// Route an inbound request by hostname.
    pub async fn dispatch(&self, host: &str) -> Option<Arc<Instance>> {
        self.inner.read().await.by_host.get(host).cloned()
    }

    pub async fn hosts(&self) -> Vec<String> {
        self.inner.read().await.by_host.keys().cloned().collect()
    }

    fn scan(&self) -> Result<Vec<(String, Fingerprint)>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.config_dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if metadata.is_dir() {
                continue;
            }
            let Ok(filename) = entry.file_name().into_string() else {
                continue;
            };
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((filename, (modified, metadata.len())));
        }
        Ok(files)
    }

    /// Build the replacement instance before touching the index, so dispatch
    /// never observes a torn tenant.
    async fn load_file(&self, filename: &str, fingerprint: Fingerprint) -> Result<()> {
        let path = self.config_dir.join(filename);
        let config = TenantConfig::load(&path)?;
        let host = config.host.clone();
        let schema = config.schema.clone();

        // Record the host -> schema binding; a changed schema for a known
        // host usually means the operator forgot to migrate data.
        let kv_key = format!("host:{host}");
        if let Ok(Some(previous)) = self.kv.get(&kv_key).await {
            if previous != schema {
                tracing::warn!(
                    host = %host,
                    previous_schema = %previous,
                    schema = %schema,
                    "tenant schema changed; existing events stay in the old namespace"
                );
            }
        }
        self.kv.set(&kv_key, &schema).await?;

        let instance = Instance::boot(self.pool.clone(), config).await?;

        let mut inner = self.inner.write().await;
        if let Some(old) = inner.by_file.remove(filename) {
            inner.by_host.remove(&old.config.host);
        }
        inner.by_host.insert(host, Arc::clone(&instance));
        inner.by_file.insert(filename.to_string(), instance);
        inner.fingerprints.insert(filename.to_string(), fingerprint);
        Ok(())
    }

    async fn remove_file(&self, filename: &str) {
        let mut inner = self.inner.write().await;
        if let Some(instance) = inner.by_file.remove(filename) {
            inner.by_host.remove(&instance.config.host);
        }
        inner.fingerprints.remove(filename);
    }

    /// Poll the config directory for created, modified and removed tenant
    /// files and rebuild the affected instances.
    pub fn spawn_reload_loop(self: &Arc<Self>, poll_interval: Duration) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll_interval).await;
                if let Err(err) = registry.reload_changed().await {
                    tracing::warn!(error = %err, "config reload pass failed");
                }
            }
        });
    }

    /// One reload pass, also callable directly to pick up changes without
    /// waiting for the poll interval.
    pub async fn reload_changed(&self) -> Result<()> {
        let current = self.scan()?;
        let known = {
            let inner = self.inner.read().await;
            inner.fingerprints.clone()
        };

        for (filename, fingerprint) in &current {
            if known.get(filename) == Some(fingerprint) {
                continue;
            }
            match self.load_file(filename, *fingerprint).await {
                Ok(()) => {
                    if known.contains_key(filename) {
                        tracing::info!(file = %filename, "reloaded tenant");
                    } else {
                        tracing::info!(file = %filename, "loaded tenant");
                    }
                }
                Err(err) => {
                    tracing::error!(file = %filename, error = %err, "failed to reload tenant");
                }
            }
        }

        for filename in known.keys() {
            if !current.iter().any(|(name, _)| name == filename) {
                self.remove_file(filename).await;
                tracing::info!(file = %filename, "unloaded tenant");
            }
        }

        Ok(())
    }
}
