use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncRead;
use tracing::{info, warn};

use crate::accounting::{AccountDelta, AccountStore, AccountTotals, Reconciler, ResyncReport, tally};
use crate::config::ResolvedConfig;
use crate::convert::{Converter, Orchestrator, PendingConversion};
use crate::domain::{DemoPointer, OwnerId, Project, ProjectId};
use crate::error::VaultError;
use crate::intake::Intake;
use crate::metadata::MetadataWriter;
use crate::store::Store;

const DEMO_RECORD: &str = "demo";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResult {
    pub project_id: ProjectId,
    pub owner_id: Option<OwnerId>,
    pub byte_size: u64,
    pub accounting_applied: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    pub used: u64,
    pub limit: u64,
    pub percentage: u64,
}

impl StorageUsage {
    pub fn new(used: u64, limit: u64) -> Self {
        let percentage = if limit == 0 {
            0
        } else {
            ((u128::from(used) * 100 + u128::from(limit) / 2) / u128::from(limit)) as u64
        };
        Self {
            used,
            limit,
            percentage,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub projects: usize,
    pub owners: usize,
    pub total_bytes: u64,
    pub orphans: usize,
    pub unreadable: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepResult {
    pub removed: Vec<ProjectId>,
}

/// Entry point for every workflow: upload, listing, deletion, demo pointer,
/// and accounting maintenance.
pub struct Vault<C, A> {
    store: Store,
    intake: Intake,
    orchestrator: Orchestrator<C>,
    metadata: MetadataWriter,
    reconciler: Reconciler<A>,
    storage_limit_bytes: u64,
}

impl<C: Converter + 'static, A: AccountStore + 'static> Vault<C, A> {
    pub fn new(config: &ResolvedConfig, converter: Arc<C>, accounts: Arc<A>) -> Self {
        let store = Store::new(config.data_root.clone());
        Self {
            intake: Intake::new(store.scratch_root(), config.max_upload_bytes),
            orchestrator: Orchestrator::new(store.clone(), converter),
            metadata: MetadataWriter::new(store.clone(), config.public_url_prefix.clone()),
            reconciler: Reconciler::new(store.clone(), accounts),
            storage_limit_bytes: config.storage_limit_bytes,
            store,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn accounts(&self) -> &A {
        self.reconciler.accounts()
    }

    /// Validates and stages the upload, then starts conversion in the
    /// background. Await the returned handle for the published project.
    pub async fn upload<R>(
        &self,
        owner_id: OwnerId,
        original_name: &str,
        body: R,
    ) -> Result<PendingConversion, VaultError>
    where
        R: AsyncRead + Unpin,
    {
        let staged = self.intake.stage(owner_id, original_name, body).await?;
        let metadata = self.metadata.clone();
        let reconciler = self.reconciler.clone();
        self.orchestrator
            .start(staged, move |upload| async move {
                let project = tokio::task::spawn_blocking(move || {
                    metadata.publish(&upload, Utc::now())
                })
                .await??;
                if let Err(err) = reconciler
                    .apply_delta(&project.owner_id, AccountDelta::created(project.byte_size))
                    .await
                {
                    warn!(project_id = %project.id, error = %err, "upload accounting skipped");
                }
                Ok::<Project, VaultError>(project)
            })
            .await
    }

    pub async fn upload_and_wait<R>(
        &self,
        owner_id: OwnerId,
        original_name: &str,
        body: R,
    ) -> Result<Project, VaultError>
    where
        R: AsyncRead + Unpin,
    {
        self.upload(owner_id, original_name, body).await?.wait().await
    }

    /// Projects owned by `owner`, newest first.
    pub async fn list_projects(&self, owner: &OwnerId) -> Result<Vec<Project>, VaultError> {
        let projects = self.all_projects().await?;
        Ok(projects
            .into_iter()
            .filter(|project| &project.owner_id == owner)
            .collect())
    }

    /// Every visible project regardless of owner, newest first.
    pub async fn all_projects(&self) -> Result<Vec<Project>, VaultError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.list_projects()).await?
    }

    pub async fn project(&self, id: &ProjectId) -> Result<Project, VaultError> {
        let store = self.store.clone();
        let lookup = id.clone();
        tokio::task::spawn_blocking(move || store.read_descriptor(&lookup))
            .await??
            .ok_or_else(|| VaultError::ProjectNotFound(id.to_string()))
    }

    /// Removes a project directory and reverses its accounting contribution.
    ///
    /// The descriptor is read on a best-effort basis; when it is missing or
    /// corrupt the directory is still removed and accounting is skipped.
    pub async fn delete_project(&self, id: &ProjectId) -> Result<DeleteResult, VaultError> {
        let store = self.store.clone();
        let target = id.clone();
        let descriptor = tokio::task::spawn_blocking(move || {
            if !store.project_dir_exists(&target) {
                return Err(VaultError::ProjectNotFound(target.to_string()));
            }
            let descriptor = match store.read_descriptor(&target) {
                Ok(descriptor) => descriptor,
                Err(err) => {
                    warn!(project_id = %target, error = %err, "deleting project with unreadable descriptor");
                    None
                }
            };
            store.remove_project_dir(&target)?;
            Ok(descriptor)
        })
        .await??;

        let mut result = DeleteResult {
            project_id: id.clone(),
            owner_id: descriptor.as_ref().map(|project| project.owner_id.clone()),
            byte_size: descriptor.as_ref().map_or(0, |project| project.byte_size),
            accounting_applied: false,
        };
        info!(project_id = %id, owner_id = ?result.owner_id, "project deleted");

        if let Some(owner) = &result.owner_id {
            match self
                .reconciler
                .apply_delta(owner, AccountDelta::removed(result.byte_size))
                .await
            {
                Ok(_) => result.accounting_applied = true,
                Err(err) => warn!(project_id = %id, error = %err, "delete accounting skipped"),
            }
        }
        Ok(result)
    }

    /// Points the demo at a visible project, replacing any previous pointer.
    ///
    /// A directory alone is not enough: the project must have its descriptor,
    /// so the demo never names a conversion still in flight.
    pub async fn set_demo(
        &self,
        id: &ProjectId,
        display_name: &str,
    ) -> Result<DemoPointer, VaultError> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(VaultError::MissingField("display_name"));
        }
        let pointer = DemoPointer {
            project_id: id.clone(),
            display_name: display_name.to_string(),
            set_at: Utc::now(),
        };
        let store = self.store.clone();
        let record = pointer.clone();
        tokio::task::spawn_blocking(move || {
            if store.read_descriptor(&record.project_id)?.is_none() {
                return Err(VaultError::ProjectNotFound(record.project_id.to_string()));
            }
            store.write_record(DEMO_RECORD, &record)
        })
        .await??;
        info!(project_id = %id, "demo pointer set");
        Ok(pointer)
    }

    /// The stored demo pointer, as written. The project it names may since
    /// have been deleted.
    pub async fn demo(&self) -> Result<Option<DemoPointer>, VaultError> {
        let store = self.store.clone();
        let record = tokio::task::spawn_blocking(move || store.read_record::<DemoPointer>(DEMO_RECORD))
            .await?;
        match record {
            Ok(pointer) => Ok(pointer),
            Err(err) => {
                warn!(error = %err, "ignoring unreadable demo record");
                Ok(None)
            }
        }
    }

    pub async fn require_demo(&self) -> Result<DemoPointer, VaultError> {
        self.demo().await?.ok_or(VaultError::DemoNotSet)
    }

    pub async fn resync(&self) -> Result<ResyncReport, VaultError> {
        self.reconciler.resync().await
    }

    /// Totals computed directly from the artifact store, ignoring stored counters.
    pub async fn live_totals(&self, owner: &OwnerId) -> Result<AccountTotals, VaultError> {
        let projects = self.list_projects(owner).await?;
        Ok(tally(&projects).remove(owner).unwrap_or_default())
    }

    pub async fn storage_usage(&self, owner: &OwnerId) -> Result<StorageUsage, VaultError> {
        let totals = self
            .reconciler
            .accounts()
            .totals(owner)
            .await?
            .unwrap_or_default();
        Ok(StorageUsage::new(
            totals.storage_used_bytes,
            self.storage_limit_bytes,
        ))
    }

    pub async fn stats(&self) -> Result<StoreStats, VaultError> {
        let store = self.store.clone();
        let scan = tokio::task::spawn_blocking(move || store.scan()).await??;
        let totals = tally(&scan.projects);
        Ok(StoreStats {
            projects: scan.projects.len(),
            owners: totals.len(),
            total_bytes: totals
                .values()
                .fold(0u64, |sum, totals| sum.saturating_add(totals.storage_used_bytes)),
            orphans: scan.orphans.len(),
            unreadable: scan.unreadable,
        })
    }

    /// Removes descriptor-less project directories older than `grace`.
    pub async fn sweep_orphans(&self, grace: Duration) -> Result<SweepResult, VaultError> {
        let store = self.store.clone();
        let removed =
            tokio::task::spawn_blocking(move || store.sweep_orphans(grace, SystemTime::now()))
                .await??;
        if !removed.is_empty() {
            info!(removed = removed.len(), "orphaned project directories swept");
        }
        Ok(SweepResult { removed })
    }
}
