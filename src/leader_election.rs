// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Leader election support.
//!
//! Ensures at most one manager instance runs its controllers at a time.
//! The in-tree backend is an exclusive lock file named after the election
//! identifier.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Errors of the election backend.
#[derive(Debug, thiserror::Error)]
pub enum LeaderElectionError {
    #[error("leader election lock {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("leader election lost by {identity}: {reason}")]
    LostLease { identity: String, reason: String },
}

type Result<T> = std::result::Result<T, LeaderElectionError>;

/// Configuration for leader election.
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    /// Directory holding the lock file.
    pub lock_dir: PathBuf,

    /// Election identifier, shared by every candidate of one operator.
    pub election_id: String,

    /// Identity of this candidate (hostname + random ID).
    pub identity: String,

    /// A lock not renewed for twice this long is considered abandoned.
    pub lease_duration: Duration,

    /// The holder renews at half this interval.
    pub renew_deadline: Duration,

    /// Wait between acquisition attempts.
    pub retry_period: Duration,
}

impl LeaderElectionConfig {
    pub fn new(lock_dir: impl Into<PathBuf>, election_id: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            election_id: election_id.into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }

    /// Sets the lease duration.
    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    /// Sets the renew deadline.
    pub fn with_renew_deadline(mut self, deadline: Duration) -> Self {
        self.renew_deadline = deadline;
        self
    }

    /// Sets the retry period.
    pub fn with_retry_period(mut self, period: Duration) -> Self {
        self.retry_period = period;
        self
    }

    /// Path of the lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.lock_dir.join(format!("{}.lock", self.election_id))
    }

    /// Path of the file that serializes stale lock takeovers.
    pub fn takeover_path(&self) -> PathBuf {
        self.lock_dir.join(format!("{}.lock.takeover", self.election_id))
    }
}

/// Leader election result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    /// This instance is the leader.
    Leader,
    /// This instance is a follower.
    Follower,
    /// Leadership was held and then lost.
    Lost,
}

/// Leader election interface.
///
/// The manager calls [`acquire`](LeaderElection::acquire) before starting
/// controllers and then keeps [`hold`](LeaderElection::hold) running next
/// to them. An error from `hold` means another instance may now be writing,
/// so the manager must stop.
#[async_trait]
pub trait LeaderElection: Send + Sync + 'static {
    /// Identity of this candidate.
    fn identity(&self) -> &str;

    /// Blocks until leadership is acquired. Returns `Ok(false)` if cancelled
    /// first.
    async fn acquire(&self, cancel: &CancellationToken) -> Result<bool>;

    /// Renews the lease until cancelled.
    async fn hold(&self, cancel: &CancellationToken) -> Result<()>;

    /// Gives up leadership, if held.
    async fn release(&self);

    /// Returns the current leader state.
    async fn state(&self) -> LeaderState;
}

/// Leader election using an exclusive lock file.
///
/// Candidates must share the lock directory, so this only excludes
/// instances on one host or on a shared volume.
#[derive(Clone)]
pub struct LockFileLeaderElection {
    config: LeaderElectionConfig,
    state: Arc<RwLock<LeaderState>>,
}

impl LockFileLeaderElection {
    pub fn new(config: LeaderElectionConfig) -> Self {
        Self {
            config,
            state: Arc::new(RwLock::new(LeaderState::Follower)),
        }
    }

    pub fn config(&self) -> &LeaderElectionConfig {
        &self.config
    }

    /// Makes one attempt at taking the lock.
    ///
    /// A lock that vanishes between steps is treated as contention and
    /// reported as `Ok(false)`, so the caller simply retries.
    pub async fn try_acquire(&self) -> Result<bool> {
        let path = self.config.lock_path();
        if create_exclusive(&path, &self.config.identity).await? {
            return Ok(true);
        }

        let Some(observed) = observe(&path).await? else {
            return Ok(false);
        };
        if observed.holder == self.config.identity {
            return Ok(true);
        }
        if observed.age <= self.config.lease_duration * 2 {
            return Ok(false);
        }

        self.take_over(&path, &observed).await
    }

    /// Replaces an abandoned lock.
    ///
    /// Only the candidate holding the takeover file may remove the lock, and
    /// only while it is still the abandoned lock observed before.
    async fn take_over(&self, path: &Path, stale: &LockSnapshot) -> Result<bool> {
        let guard = self.config.takeover_path();
        if !create_exclusive(&guard, &self.config.identity).await? {
            self.clear_abandoned_guard(&guard).await?;
            return Ok(false);
        }

        let result = self.replace_stale(path, stale).await;

        if let Err(e) = remove_if_exists(&guard).await {
            tracing::warn!(error = %e, "failed to remove leader election takeover file");
        }
        result
    }

    async fn replace_stale(&self, path: &Path, stale: &LockSnapshot) -> Result<bool> {
        match observe(path).await? {
            Some(current) if current.holder == stale.holder && current.modified == stale.modified => {}
            Some(_) => return Ok(false),
            None => return create_exclusive(path, &self.config.identity).await,
        }

        tracing::info!(
            lock = ?path,
            holder = %stale.holder,
            age = ?stale.age,
            "removing stale leader election lock"
        );
        remove_if_exists(path).await?;
        create_exclusive(path, &self.config.identity).await
    }

    /// Removes a takeover file left behind by a candidate that died mid
    /// takeover.
    async fn clear_abandoned_guard(&self, guard: &Path) -> Result<()> {
        if let Some(snapshot) = observe(guard).await? {
            if snapshot.age > self.config.lease_duration * 2 {
                tracing::warn!(file = ?guard, holder = %snapshot.holder, "removing abandoned takeover file");
                remove_if_exists(guard).await?;
            }
        }
        Ok(())
    }

    async fn lose(&self, reason: String) -> LeaderElectionError {
        *self.state.write().await = LeaderState::Lost;
        LeaderElectionError::LostLease {
            identity: self.config.identity.clone(),
            reason,
        }
    }
}

#[async_trait]
impl LeaderElection for LockFileLeaderElection {
    fn identity(&self) -> &str {
        &self.config.identity
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<bool> {
        tracing::info!(
            lock = ?self.config.lock_path(),
            identity = %self.config.identity,
            "attempting to acquire leader lease"
        );

        loop {
            if cancel.is_cancelled() {
                return Ok(false);
            }

            if self.try_acquire().await? {
                *self.state.write().await = LeaderState::Leader;
                tracing::info!(identity = %self.config.identity, "successfully acquired lease");
                return Ok(true);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.retry_period) => {}
                _ = cancel.cancelled() => return Ok(false),
            }
        }
    }

    async fn hold(&self, cancel: &CancellationToken) -> Result<()> {
        let path = self.config.lock_path();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.renew_deadline / 2) => {}
                _ = cancel.cancelled() => return Ok(()),
            }

            match read_holder(&path).await {
                Ok(Some(holder)) if holder == self.config.identity => {}
                Ok(Some(holder)) => return Err(self.lose(format!("lock now held by {}", holder)).await),
                Ok(None) => return Err(self.lose("lock file removed".to_string()).await),
                Err(e) => return Err(self.lose(e.to_string()).await),
            }

            if let Err(e) = tokio::fs::write(&path, self.config.identity.as_bytes()).await {
                tracing::error!(error = %e, "failed to renew lease");
                return Err(self.lose(e.to_string()).await);
            }
        }
    }

    async fn release(&self) {
        let mut state = self.state.write().await;
        if *state != LeaderState::Leader {
            return;
        }
        *state = LeaderState::Follower;

        let path = self.config.lock_path();
        if let Ok(Some(holder)) = read_holder(&path).await {
            if holder == self.config.identity {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(lock = ?path, error = %e, "failed to release leader lease");
                }
            }
        }
    }

    async fn state(&self) -> LeaderState {
        *self.state.read().await
    }
}

/// Holder and age of a lock file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LockSnapshot {
    holder: String,
    modified: SystemTime,
    age: Duration,
}

/// Reads the lock at `path`, `None` if it doesn't exist.
async fn observe(path: &Path) -> Result<Option<LockSnapshot>> {
    let modified = match tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(io_error(path, source)),
    };
    let Some(holder) = read_holder(path).await? else {
        return Ok(None);
    };
    Ok(Some(LockSnapshot {
        holder,
        modified,
        age: modified.elapsed().unwrap_or_default(),
    }))
}

/// Creates `path` holding `identity`, `false` if it already exists.
async fn create_exclusive(path: &Path, identity: &str) -> Result<bool> {
    match tokio::fs::File::options()
        .write(true)
        .create_new(true)
        .open(path)
        .await
    {
        Ok(mut file) => {
            file.write_all(identity.as_bytes())
                .await
                .map_err(|source| io_error(path, source))?;
            file.sync_all().await.map_err(|source| io_error(path, source))?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(source) => Err(io_error(path, source)),
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(io_error(path, source)),
    }
}

async fn read_holder(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(holder) => Ok(Some(holder)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(io_error(path, source)),
    }
}

fn io_error(path: &Path, source: std::io::Error) -> LeaderElectionError {
    LeaderElectionError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Creates a default identity for leader election.
///
/// Uses the hostname plus a random component.
pub fn create_identity() -> String {
    let hostname = gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "unknown".to_string());

    let random: String = std::iter::repeat_with(rand::random::<u8>)
        .take(4)
        .map(|b| format!("{:02x}", b))
        .collect();

    format!("{}_{}", hostname, random)
}
