//! Durable per-account credential storage with crash-safe backup.
//!
//! Layout inside an account's credential directory:
//! - `creds.json`      primary, rewritten on every credential update
//! - `creds.json.bak`  last primary that parsed cleanly
//!
//! All mutations go through a single FIFO worker so that at most one write
//! runs at a time and writes land in submission order. This includes backup
//! promotion and logout.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::account::Account;
use crate::error::CredentialError;

pub const CREDS_FILE: &str = "creds.json";
pub const CREDS_BACKUP_FILE: &str = "creds.json.bak";

/// File-name prefixes of key material the transport keeps next to the
/// credentials. Removed on logout from a legacy (shared) directory.
const KEY_FILE_PREFIXES: &[&str] = &[
    "pre-key-",
    "session-",
    "sender-key-",
    "sender-key-memory-",
    "app-state-sync-key-",
    "app-state-sync-version-",
];

pub fn creds_path(dir: &Path) -> PathBuf {
    dir.join(CREDS_FILE)
}

pub fn backup_path(dir: &Path) -> PathBuf {
    dir.join(CREDS_BACKUP_FILE)
}

/// Opaque identity/key material owned by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(serde_json::Value);

impl Credential {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

/// Who the stored credentials belong to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SelfId {
    pub jid: Option<String>,
    pub e164: Option<String>,
}

impl SelfId {
    /// Best label for humans: phone number, then jid, then "unknown".
    pub fn display(&self) -> &str {
        self.e164
            .as_deref()
            .or(self.jid.as_deref())
            .unwrap_or("unknown")
    }
}

type SaveProducer = Box<dyn FnOnce() -> Result<(), CredentialError> + Send>;

enum Job {
    Save {
        dir: PathBuf,
        producer: SaveProducer,
    },
    Restore {
        dir: PathBuf,
        done: oneshot::Sender<bool>,
    },
    Backup {
        dir: PathBuf,
        done: oneshot::Sender<bool>,
    },
    Clear {
        account: Account,
        done: oneshot::Sender<Result<(), CredentialError>>,
    },
    Flush(oneshot::Sender<()>),
}

/// Handle to the credential store. Cheap to clone; all clones feed the same
/// serialized worker.
#[derive(Clone)]
pub struct CredentialStore {
    jobs: mpsc::UnboundedSender<Job>,
    /// Generation of the latest `clear` per credential directory.
    clears: Arc<DashMap<PathBuf, u64>>,
    next_clear: Arc<AtomicU64>,
}

impl CredentialStore {
    /// Create a store and spawn its worker. Must be called inside a Tokio runtime.
    pub fn new() -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_queue(rx));
        Self {
            jobs,
            clears: Arc::new(DashMap::new()),
            next_clear: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Load credentials, promoting the backup if the primary is unusable.
    pub async fn load(&self, dir: &Path) -> Result<Credential, CredentialError> {
        if let Some(cred) = read_credential(&creds_path(dir)) {
            return Ok(cred);
        }
        if self.maybe_restore_from_backup(dir).await {
            if let Some(cred) = read_credential(&creds_path(dir)) {
                return Ok(cred);
            }
        }
        Err(CredentialError::NotFound {
            dir: dir.to_path_buf(),
        })
    }

    /// True when [`load`](Self::load) would succeed.
    pub async fn exists(&self, dir: &Path) -> bool {
        self.load(dir).await.is_ok()
    }

    /// Promote `creds.json.bak` over a missing or corrupt `creds.json`,
    /// ordered behind every queued save and clear.
    ///
    /// Returns true when a restore happened.
    pub async fn maybe_restore_from_backup(&self, dir: &Path) -> bool {
        let (done, rx) = oneshot::channel();
        let job = Job::Restore {
            dir: dir.to_path_buf(),
            done,
        };
        self.jobs.send(job).is_ok() && rx.await.unwrap_or(false)
    }

    /// Copy primary to backup iff the primary parses. Best-effort, queued.
    pub async fn backup(&self, dir: &Path) -> bool {
        let (done, rx) = oneshot::channel();
        let job = Job::Backup {
            dir: dir.to_path_buf(),
            done,
        };
        self.jobs.send(job).is_ok() && rx.await.unwrap_or(false)
    }

    /// A writer for one connection's credential updates. Updates it queues
    /// after a later [`clear`](Self::clear) of `dir` are dropped.
    pub fn writer(&self, dir: impl Into<PathBuf>) -> CredentialWriter {
        let dir = dir.into();
        let generation = clear_generation(&self.clears, &dir);
        CredentialWriter {
            store: self.clone(),
            dir,
            generation,
        }
    }

    /// Queue a credential-producing side effect behind every earlier job.
    pub fn enqueue_save<F>(&self, dir: impl Into<PathBuf>, producer: F)
    where
        F: FnOnce() -> Result<(), CredentialError> + Send + 'static,
    {
        let dir = dir.into();
        if self
            .jobs
            .send(Job::Save {
                dir: dir.clone(),
                producer: Box::new(producer),
            })
            .is_err()
        {
            warn!(dir = %dir.display(), "credential save queue closed; dropping save");
        }
    }

    /// Queue an atomic write of `credential` as the new primary.
    pub fn enqueue_write(&self, dir: impl Into<PathBuf>, credential: Credential) {
        let dir = dir.into();
        let target = dir.clone();
        self.enqueue_save(dir, move || write_primary(&target, &credential));
    }

    /// Remove the account's credentials (logout). Runs behind queued saves.
    pub async fn clear(&self, account: &Account) -> Result<(), CredentialError> {
        let generation = self.next_clear.fetch_add(1, Ordering::AcqRel) + 1;
        self.clears.insert(account.credential_dir.clone(), generation);
        let (done, rx) = oneshot::channel();
        self.jobs
            .send(Job::Clear {
                account: account.clone(),
                done,
            })
            .map_err(|_| CredentialError::QueueClosed)?;
        rx.await.map_err(|_| CredentialError::QueueClosed)?
    }

    /// Wait until every job queued before this call has run.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.jobs.send(Job::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn read_self_id(&self, dir: &Path) -> SelfId {
        let Some(cred) = read_credential(&creds_path(dir)) else {
            return SelfId::default();
        };
        let Some(jid) = cred.as_value().pointer("/me/id").and_then(|v| v.as_str()) else {
            return SelfId::default();
        };
        SelfId {
            jid: Some(jid.to_string()),
            e164: jid_to_e164(jid),
        }
    }

    /// Time since the primary credential file was last written.
    pub fn credential_age(&self, dir: &Path) -> Option<Duration> {
        let modified = fs::metadata(creds_path(dir)).ok()?.modified().ok()?;
        SystemTime::now().duration_since(modified).ok()
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Queues credential updates for one directory on behalf of one connection.
#[derive(Clone)]
pub struct CredentialWriter {
    store: CredentialStore,
    dir: PathBuf,
    generation: u64,
}

impl CredentialWriter {
    /// Queue `credential` as the new primary unless the directory was
    /// cleared after this writer was created.
    pub fn write(&self, credential: Credential) {
        let clears = Arc::clone(&self.store.clears);
        let dir = self.dir.clone();
        let generation = self.generation;
        self.store.enqueue_save(self.dir.clone(), move || {
            if clear_generation(&clears, &dir) > generation {
                debug!(dir = %dir.display(), "dropping credential update from before logout");
                return Ok(());
            }
            write_primary(&dir, &credential)
        });
    }
}

fn clear_generation(clears: &DashMap<PathBuf, u64>, dir: &Path) -> u64 {
    clears.get(dir).map_or(0, |g| *g)
}

async fn run_queue(mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        match job {
            Job::Save { dir, producer } => {
                backup_if_valid(&dir);
                if let Err(e) = producer() {
                    warn!(dir = %dir.display(), error = %e, "failed saving credentials");
                }
            }
            Job::Restore { dir, done } => {
                let _ = done.send(restore_if_needed(&dir));
            }
            Job::Backup { dir, done } => {
                let _ = done.send(backup_if_valid(&dir));
            }
            Job::Clear { account, done } => {
                let _ = done.send(clear_account(&account));
            }
            Job::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("credential save queue stopped");
}

/// Raw file contents, or None for missing, non-file, or near-empty (<= 1 byte) paths.
fn read_raw(path: &Path) -> Option<String> {
    let meta = fs::metadata(path).ok()?;
    if !meta.is_file() || meta.len() <= 1 {
        return None;
    }
    fs::read_to_string(path).ok()
}

fn read_credential(path: &Path) -> Option<Credential> {
    let raw = read_raw(path)?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(Credential(value)),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "credential file is not valid JSON");
            None
        }
    }
}

fn restore_if_needed(dir: &Path) -> bool {
    let primary = creds_path(dir);
    if read_credential(&primary).is_some() {
        return false;
    }
    let backup = backup_path(dir);
    let Some(raw) = read_raw(&backup) else {
        return false;
    };
    if serde_json::from_str::<serde_json::Value>(&raw).is_err() {
        debug!(path = %backup.display(), "credential backup is not valid JSON; not restoring");
        return false;
    }
    match fs::copy(&backup, &primary) {
        Ok(_) => {
            info!(dir = %dir.display(), "restored credentials from backup");
            true
        }
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "failed to restore credentials from backup");
            false
        }
    }
}

fn backup_if_valid(dir: &Path) -> bool {
    let primary = creds_path(dir);
    let Some(raw) = read_raw(&primary) else {
        return false;
    };
    // Never clobber a good backup with a truncated primary
    if serde_json::from_str::<serde_json::Value>(&raw).is_err() {
        debug!(path = %primary.display(), "primary credentials invalid; keeping existing backup");
        return false;
    }
    match fs::copy(&primary, backup_path(dir)) {
        Ok(_) => true,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "credential backup failed");
            false
        }
    }
}

fn write_primary(dir: &Path, credential: &Credential) -> Result<(), CredentialError> {
    fs::create_dir_all(dir).map_err(|e| CredentialError::io(dir, e))?;
    let json = serde_json::to_vec_pretty(credential)?;
    let target = creds_path(dir);
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| CredentialError::io(dir, e))?;
    tmp.write_all(&json)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| CredentialError::io(tmp.path(), e))?;
    tmp.persist(&target)
        .map_err(|e| CredentialError::io(&target, e.error))?;
    Ok(())
}

fn clear_account(account: &Account) -> Result<(), CredentialError> {
    let dir = &account.credential_dir;
    if !account.is_legacy_layout {
        return match fs::remove_dir_all(dir) {
            Ok(()) => {
                info!(account_id = %account.id, dir = %dir.display(), "cleared credentials");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CredentialError::io(dir, e)),
        };
    }

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(CredentialError::io(dir, e)),
    };
    let mut removed = 0usize;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let is_creds = name == CREDS_FILE || name == CREDS_BACKUP_FILE;
        let is_key = name.ends_with(".json") && KEY_FILE_PREFIXES.iter().any(|p| name.starts_with(p));
        if !(is_creds || is_key) {
            continue;
        }
        let path = entry.path();
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CredentialError::io(path, e)),
        }
    }
    info!(account_id = %account.id, dir = %dir.display(), removed, "cleared legacy credentials");
    Ok(())
}

/// `"5511999999999:12@s.whatsapp.net"` -> `"+5511999999999"`.
fn jid_to_e164(jid: &str) -> Option<String> {
    let user = jid.split('@').next()?.split(':').next()?;
    if user.is_empty() || !user.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("+{user}"))
}
