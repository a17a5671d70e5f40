use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{OwnerId, Project};
use crate::error::VaultError;
use crate::store::Store;

/// Per-user aggregates kept on the user record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountTotals {
    pub projects_count: u64,
    pub storage_used_bytes: u64,
}

impl AccountTotals {
    /// Applies a signed delta, flooring both counters at zero.
    pub fn apply(self, delta: AccountDelta) -> Self {
        Self {
            projects_count: self.projects_count.saturating_add_signed(delta.projects),
            storage_used_bytes: self.storage_used_bytes.saturating_add_signed(delta.bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountDelta {
    pub projects: i64,
    pub bytes: i64,
}

impl AccountDelta {
    pub fn created(byte_size: u64) -> Self {
        Self {
            projects: 1,
            bytes: i64::try_from(byte_size).unwrap_or(i64::MAX),
        }
    }

    pub fn removed(byte_size: u64) -> Self {
        Self {
            projects: -1,
            bytes: -i64::try_from(byte_size).unwrap_or(i64::MAX),
        }
    }
}

/// The user-record store owned by the identity collaborator.
///
/// `apply_delta` must be a single atomic update per owner; concurrent deltas
/// for the same owner may not lose each other.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn totals(&self, owner: &OwnerId) -> Result<Option<AccountTotals>, VaultError>;
    async fn apply_delta(
        &self,
        owner: &OwnerId,
        delta: AccountDelta,
    ) -> Result<AccountTotals, VaultError>;
    async fn overwrite(&self, owner: &OwnerId, totals: AccountTotals) -> Result<(), VaultError>;
    async fn owners(&self) -> Result<Vec<OwnerId>, VaultError>;
    /// Replaces every stored total in one write, without reading the old
    /// contents.
    async fn replace_all(
        &self,
        accounts: BTreeMap<OwnerId, AccountTotals>,
    ) -> Result<(), VaultError>;
}

#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    accounts: Mutex<BTreeMap<OwnerId, AccountTotals>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<OwnerId, AccountTotals>>, VaultError> {
        self.accounts
            .lock()
            .map_err(|_| VaultError::Task("account store lock poisoned".to_string()))
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn totals(&self, owner: &OwnerId) -> Result<Option<AccountTotals>, VaultError> {
        Ok(self.lock()?.get(owner).copied())
    }

    async fn apply_delta(
        &self,
        owner: &OwnerId,
        delta: AccountDelta,
    ) -> Result<AccountTotals, VaultError> {
        let mut accounts = self.lock()?;
        let entry = accounts.entry(owner.clone()).or_default();
        *entry = entry.apply(delta);
        Ok(*entry)
    }

    async fn overwrite(&self, owner: &OwnerId, totals: AccountTotals) -> Result<(), VaultError> {
        self.lock()?.insert(owner.clone(), totals);
        Ok(())
    }

    async fn owners(&self) -> Result<Vec<OwnerId>, VaultError> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    async fn replace_all(
        &self,
        accounts: BTreeMap<OwnerId, AccountTotals>,
    ) -> Result<(), VaultError> {
        *self.lock()? = accounts;
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AccountsFile {
    #[serde(default)]
    accounts: BTreeMap<OwnerId, AccountTotals>,
}

/// JSON-file backed user records for standalone deployments. Updates are
/// serialized behind one async lock and persisted atomically.
#[derive(Debug)]
pub struct FileAccountStore {
    path: Utf8PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileAccountStore {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self {
            path,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn update<T, F>(&self, change: F) -> Result<T, VaultError>
    where
        F: FnOnce(&mut BTreeMap<OwnerId, AccountTotals>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut file = load_accounts(&path)?;
            let out = change(&mut file.accounts);
            Store::write_json_atomic(&path, &file)?;
            Ok::<T, VaultError>(out)
        })
        .await?
    }

    async fn snapshot(&self) -> Result<BTreeMap<OwnerId, AccountTotals>, VaultError> {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || load_accounts(&path).map(|file| file.accounts)).await?
    }
}

fn load_accounts(path: &Utf8PathBuf) -> Result<AccountsFile, VaultError> {
    match std::fs::read_to_string(path.as_std_path()) {
        Ok(content) => serde_json::from_str(&content)
            .map_err(|err| VaultError::Filesystem(format!("parse {path}: {err}"))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(AccountsFile::default()),
        Err(err) => Err(VaultError::Filesystem(format!("read {path}: {err}"))),
    }
}

#[async_trait]
impl AccountStore for FileAccountStore {
    async fn totals(&self, owner: &OwnerId) -> Result<Option<AccountTotals>, VaultError> {
        Ok(self.snapshot().await?.get(owner).copied())
    }

    async fn apply_delta(
        &self,
        owner: &OwnerId,
        delta: AccountDelta,
    ) -> Result<AccountTotals, VaultError> {
        let owner = owner.clone();
        self.update(move |accounts| {
            let entry = accounts.entry(owner).or_default();
            *entry = entry.apply(delta);
            *entry
        })
        .await
    }

    async fn overwrite(&self, owner: &OwnerId, totals: AccountTotals) -> Result<(), VaultError> {
        let owner = owner.clone();
        self.update(move |accounts| {
            accounts.insert(owner, totals);
        })
        .await
    }

    async fn owners(&self) -> Result<Vec<OwnerId>, VaultError> {
        Ok(self.snapshot().await?.into_keys().collect())
    }

    async fn replace_all(
        &self,
        accounts: BTreeMap<OwnerId, AccountTotals>,
    ) -> Result<(), VaultError> {
        let _guard = self.lock.lock().await;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(err) = load_accounts(&path) {
                warn!(path = %path, error = %err, "rebuilding unreadable accounts file");
            }
            Store::write_json_atomic(&path, &AccountsFile { accounts })
        })
        .await?
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerTotals {
    pub owner_id: OwnerId,
    #[serde(flatten)]
    pub totals: AccountTotals,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncFailure {
    pub owner_id: OwnerId,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncReport {
    pub updated: Vec<OwnerTotals>,
    pub failed: Vec<ResyncFailure>,
    pub skipped_descriptors: usize,
}

/// Groups visible projects by owner.
pub fn tally(projects: &[Project]) -> BTreeMap<OwnerId, AccountTotals> {
    let mut totals = BTreeMap::<OwnerId, AccountTotals>::new();
    for project in projects {
        let entry = totals.entry(project.owner_id.clone()).or_default();
        entry.projects_count += 1;
        entry.storage_used_bytes = entry.storage_used_bytes.saturating_add(project.byte_size);
    }
    totals
}

pub struct Reconciler<A> {
    store: Store,
    accounts: Arc<A>,
}

impl<A> Clone for Reconciler<A> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            accounts: Arc::clone(&self.accounts),
        }
    }
}

impl<A: AccountStore + 'static> Reconciler<A> {
    pub fn new(store: Store, accounts: Arc<A>) -> Self {
        Self { store, accounts }
    }

    pub fn accounts(&self) -> &A {
        &self.accounts
    }

    pub async fn apply_delta(
        &self,
        owner: &OwnerId,
        delta: AccountDelta,
    ) -> Result<AccountTotals, VaultError> {
        match self.accounts.apply_delta(owner, delta).await {
            Ok(totals) => {
                info!(
                    owner_id = %owner,
                    projects = totals.projects_count,
                    bytes = totals.storage_used_bytes,
                    "account totals updated"
                );
                Ok(totals)
            }
            Err(err) => Err(as_accounting(owner, err)),
        }
    }

    /// Recomputes every owner's totals from the artifact store and overwrites
    /// the stored values. Owners with no visible project are reset to zero.
    pub async fn resync(&self) -> Result<ResyncReport, VaultError> {
        let store = self.store.clone();
        let scan = tokio::task::spawn_blocking(move || store.scan()).await??;
        let totals = tally(&scan.projects);

        let mut owners: BTreeSet<OwnerId> = totals.keys().cloned().collect();
        match self.accounts.owners().await {
            Ok(known) => owners.extend(known),
            Err(err) => warn!(error = %err, "could not list known accounts; resetting none"),
        }

        let rebuilt: BTreeMap<OwnerId, AccountTotals> = owners
            .into_iter()
            .map(|owner| {
                let owner_totals = totals.get(&owner).copied().unwrap_or_default();
                (owner, owner_totals)
            })
            .collect();

        let mut report = ResyncReport {
            skipped_descriptors: scan.unreadable,
            ..ResyncReport::default()
        };
        match self.accounts.replace_all(rebuilt.clone()).await {
            Ok(()) => {
                report.updated = rebuilt
                    .into_iter()
                    .map(|(owner_id, totals)| OwnerTotals { owner_id, totals })
                    .collect();
            }
            Err(err) => {
                warn!(error = %err, "resync write failed");
                let message = err.to_string();
                report.failed = rebuilt
                    .into_keys()
                    .map(|owner_id| ResyncFailure {
                        owner_id,
                        message: message.clone(),
                    })
                    .collect();
            }
        }

        info!(
            updated = report.updated.len(),
            failed = report.failed.len(),
            skipped = report.skipped_descriptors,
            "account totals resynchronized"
        );
        Ok(report)
    }
}

fn as_accounting(owner: &OwnerId, err: VaultError) -> VaultError {
    match err {
        VaultError::Accounting { .. } => err,
        other => VaultError::Accounting {
            owner: owner.to_string(),
            message: other.to_string(),
        },
    }
}
