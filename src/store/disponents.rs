use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{CentrumError, Result};
use crate::events::{EventType, Topic};
use crate::kv::{KvError, KvResult, KvStore, Loader};
use crate::model::settings::JobDisponents;
use crate::model::user::UserProfile;
use crate::ports::CentrumRepository;
use crate::store::StoreContext;

struct DisponentStoreInner {
    ctx: StoreContext,
    repo: Arc<dyn CentrumRepository>,
    disponents: KvStore<JobDisponents>,
}

/// Dispatcher users signed in per job.
#[derive(Clone)]
pub struct DisponentStore {
    inner: Arc<DisponentStoreInner>,
}

impl DisponentStore {
    pub fn new(ctx: StoreContext, repo: Arc<dyn CentrumRepository>) -> Self {
        let disponents =
            KvStore::new("disponents", ctx.replica, ctx.backend.clone(), ctx.kv.clone());
        disponents.set_loader(Arc::new(DisponentLoader {
            ctx: ctx.clone(),
            repo: repo.clone(),
        }));
        Self {
            inner: Arc::new(DisponentStoreInner {
                ctx,
                repo,
                disponents,
            }),
        }
    }

    pub fn disponents(&self) -> &KvStore<JobDisponents> {
        &self.inner.disponents
    }

    pub async fn get(&self, job: &str) -> JobDisponents {
        match self.inner.disponents.get_or_load(job).await {
            Ok(Some(disponents)) => disponents,
            Ok(None) => JobDisponents::new(job),
            Err(e) => {
                tracing::warn!(job, error = %e, "Failed to load disponents");
                JobDisponents::new(job)
            }
        }
    }

    pub async fn count(&self, job: &str) -> usize {
        self.get(job).await.disponents.len()
    }

    /// Jobs in which `user_id` is signed in as disponent.
    pub async fn jobs_of(&self, user_id: u64) -> Vec<String> {
        let mut jobs: Vec<String> = self
            .inner
            .disponents
            .list()
            .await
            .into_iter()
            .filter(|d| d.contains(user_id))
            .map(|d| d.job)
            .collect();
        jobs.sort();
        jobs
    }

    pub async fn sign_in(&self, job: &str, user_id: u64) -> Result<JobDisponents> {
        if !self.inner.ctx.tracker.is_user_on_duty(user_id).await {
            return Err(CentrumError::NotOnDuty(user_id));
        }

        match self.inner.repo.insert_disponent(job, user_id).await {
            Ok(()) => {}
            Err(e) => match CentrumError::from(e) {
                CentrumError::DuplicateKey(_) => {}
                other => return Err(other),
            },
        }

        let profile = self
            .inner
            .ctx
            .resolve_user(user_id)
            .await
            .unwrap_or_else(|| UserProfile::new(user_id, "", "", job, 0));

        let (disponents, written) = self
            .inner
            .disponents
            .compute_update(job, |existing| -> Result<(JobDisponents, bool)> {
                let mut disponents = existing.unwrap_or_else(|| JobDisponents::new(job));
                if disponents.contains(user_id) {
                    return Ok((disponents, false));
                }
                disponents.disponents.push(profile.clone());
                Ok((disponents, true))
            })
            .await?;

        if written {
            self.publish(&disponents).await;
            tracing::info!(job, user_id, "Disponent signed in");
        }
        Ok(disponents)
    }

    pub async fn sign_out(&self, job: &str, user_id: u64) -> Result<JobDisponents> {
        self.inner.repo.delete_disponent(job, user_id).await?;

        let (disponents, written) = self
            .inner
            .disponents
            .compute_update(job, |existing| -> Result<(JobDisponents, bool)> {
                let mut disponents = existing.unwrap_or_else(|| JobDisponents::new(job));
                let before = disponents.disponents.len();
                disponents.disponents.retain(|d| d.user_id != user_id);
                let changed = disponents.disponents.len() != before;
                Ok((disponents, changed))
            })
            .await?;

        if written {
            self.publish(&disponents).await;
            tracing::info!(job, user_id, "Disponent signed out");
        }
        Ok(disponents)
    }

    async fn publish(&self, disponents: &JobDisponents) {
        self.inner
            .ctx
            .bus
            .publish(&disponents.job, Topic::General, EventType::Dispatchers, disponents)
            .await;
    }

    pub async fn load_from_repository(&self, jobs: &[String]) -> Result<usize> {
        let mut count = 0;
        for job in jobs {
            let user_ids = self.inner.repo.list_disponents(job).await?;
            let disponents = JobDisponents {
                job: job.clone(),
                disponents: profiles_for(&self.inner.ctx, job, &user_ids).await,
            };
            count += disponents.disponents.len();
            self.inner.disponents.put(job, disponents).await?;
        }
        Ok(count)
    }
}

/// One profile per id; users the resolver does not know get a bare profile.
async fn profiles_for(ctx: &StoreContext, job: &str, user_ids: &[u64]) -> Vec<UserProfile> {
    let resolved = ctx.resolve_users(user_ids).await;
    user_ids
        .iter()
        .map(|&user_id| {
            resolved
                .iter()
                .find(|p| p.user_id == user_id)
                .cloned()
                .unwrap_or_else(|| UserProfile::new(user_id, "", "", job, 0))
        })
        .collect()
}

struct DisponentLoader {
    ctx: StoreContext,
    repo: Arc<dyn CentrumRepository>,
}

#[async_trait]
impl Loader<JobDisponents> for DisponentLoader {
    async fn load(&self, key: &str) -> KvResult<Option<JobDisponents>> {
        let user_ids = self
            .repo
            .list_disponents(key)
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        if user_ids.is_empty() {
            return Ok(None);
        }
        Ok(Some(JobDisponents {
            job: key.to_string(),
            disponents: profiles_for(&self.ctx, key, &user_ids).await,
        }))
    }
}
