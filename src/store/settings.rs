use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::events::{EventType, Topic};
use crate::kv::{KvError, KvResult, KvStore, Loader};
use crate::model::settings::CentrumSettings;
use crate::ports::CentrumRepository;
use crate::store::StoreContext;

struct SettingsStoreInner {
    ctx: StoreContext,
    repo: Arc<dyn CentrumRepository>,
    settings: KvStore<CentrumSettings>,
}

/// Per-job centrum settings.
#[derive(Clone)]
pub struct SettingsStore {
    inner: Arc<SettingsStoreInner>,
}

impl SettingsStore {
    pub fn new(ctx: StoreContext, repo: Arc<dyn CentrumRepository>) -> Self {
        let settings = KvStore::new("settings", ctx.replica, ctx.backend.clone(), ctx.kv.clone());
        settings.set_loader(Arc::new(SettingsLoader { repo: repo.clone() }));
        Self {
            inner: Arc::new(SettingsStoreInner { ctx, repo, settings }),
        }
    }

    pub fn settings(&self) -> &KvStore<CentrumSettings> {
        &self.inner.settings
    }

    /// Settings of `job`, or the defaults if none were saved.
    pub async fn get(&self, job: &str) -> CentrumSettings {
        match self.inner.settings.get_or_load(job).await {
            Ok(Some(settings)) => settings,
            Ok(None) => CentrumSettings::new(job),
            Err(e) => {
                tracing::warn!(job, error = %e, "Failed to load settings, using defaults");
                CentrumSettings::new(job)
            }
        }
    }

    pub async fn list(&self) -> Vec<CentrumSettings> {
        let mut settings = self.inner.settings.list().await;
        settings.sort_by(|a, b| a.job.cmp(&b.job));
        settings
    }

    pub async fn update(&self, settings: CentrumSettings) -> Result<CentrumSettings> {
        self.inner.repo.upsert_settings(&settings).await?;
        self.inner.settings.put(&settings.job, settings.clone()).await?;
        self.inner
            .ctx
            .bus
            .publish(&settings.job, Topic::General, EventType::Settings, &settings)
            .await;

        tracing::info!(
            job = %settings.job,
            enabled = settings.enabled,
            mode = %settings.mode,
            fallback_mode = %settings.fallback_mode,
            "Centrum settings updated"
        );
        Ok(settings)
    }

    pub async fn load_from_repository(&self) -> Result<usize> {
        let all = self.inner.repo.list_settings().await?;
        let count = all.len();
        for settings in all {
            self.inner.settings.put(&settings.job.clone(), settings).await?;
        }
        Ok(count)
    }
}

struct SettingsLoader {
    repo: Arc<dyn CentrumRepository>,
}

#[async_trait]
impl Loader<CentrumSettings> for SettingsLoader {
    async fn load(&self, key: &str) -> KvResult<Option<CentrumSettings>> {
        self.repo
            .get_settings(key)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))
    }
}
