//! Durable home of the verification ledger and quota sessions.
//!
//! [`VerificationStore`] owns both structures behind one process-local mutex. When a snapshot
//! path is configured, every operation also:
//!
//! 1. takes the cross-process marker lock ([`file_lock`]),
//! 2. reloads both structures from the snapshot so writes by other processes are observed,
//! 3. runs the operation,
//! 4. if the operation mutates, rewrites the snapshot atomically ([`snapshot::write`]).
//!
//! Failing to take the marker lock or to read or write the file never fails the caller: the
//! operation proceeds against the in-memory state and a warning is logged. Durability in that
//! case is best-effort until the next successful write.
//!
//! All methods block (file I/O and lock polling). Call them from `spawn_blocking` in async code.

pub mod file_lock;
pub mod snapshot;

use parking_lot::Mutex;
use std::path::{Path, PathBuf};

use crate::ledger::{VerificationLedger, VerificationRecord};
use crate::session::{QuotaSessions, SessionRecord};
use crate::timestamp::UnixTimestamp;
use file_lock::{FileLock, FileLockPolicy, lock_path_for};
use snapshot::Snapshot;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("timed out acquiring store lock {} after {attempts} attempts", path.display())]
    LockUnavailable { path: PathBuf, attempts: u32 },
    #[error("store i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode store snapshot {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode store snapshot: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Result of [`VerificationStore::claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The record was stored and its session seeded.
    Issued,
    /// The same pair was already verified; its existing record is returned unchanged.
    Replayed(VerificationRecord),
    /// The transaction already funds a credential for another request id.
    Conflict { owner: String },
}

/// Number of entries removed by [`VerificationStore::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub records: usize,
    pub sessions: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.records + self.sessions
    }
}

#[derive(Debug, Default)]
struct StoreState {
    ledger: VerificationLedger,
    sessions: QuotaSessions,
}

impl StoreState {
    fn from_snapshot(snapshot: Snapshot, now: UnixTimestamp) -> Self {
        Self {
            ledger: VerificationLedger::from_records(snapshot.records, now),
            sessions: QuotaSessions::from_entries(snapshot.sessions, now),
        }
    }

    fn to_snapshot(&self, now: UnixTimestamp) -> Snapshot {
        Snapshot {
            records: self.ledger.records(now).cloned().collect(),
            sessions: self
                .sessions
                .entries(now)
                .map(|(token, session)| (token.clone(), session.clone()))
                .collect(),
        }
    }
}

#[derive(Debug)]
struct Backing {
    path: PathBuf,
    lock_path: PathBuf,
    lock_policy: FileLockPolicy,
}

#[derive(Debug)]
pub struct VerificationStore {
    state: Mutex<StoreState>,
    backing: Option<Backing>,
}

impl VerificationStore {
    /// A process-local store with no persistence.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            backing: None,
        }
    }

    /// Opens a store backed by the snapshot at `path`, loading whatever it currently holds.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::open_with_policy(path, FileLockPolicy::default())
    }

    pub fn open_with_policy(path: impl Into<PathBuf>, lock_policy: FileLockPolicy) -> Self {
        let path = path.into();
        let backing = Backing {
            lock_path: lock_path_for(&path),
            path,
            lock_policy,
        };
        let mut state = StoreState::default();
        reload(&mut state, &backing.path, UnixTimestamp::now());
        tracing::info!(
            path = %backing.path.display(),
            records = state.ledger.len(),
            sessions = state.sessions.len(),
            "Verification store loaded"
        );
        Self {
            state: Mutex::new(state),
            backing: Some(backing),
        }
    }

    /// The snapshot path, if the store is persistent.
    pub fn path(&self) -> Option<&Path> {
        self.backing.as_ref().map(|backing| backing.path.as_path())
    }

    /// Runs `operation` under the process lock and, when persistent, the file lock.
    fn with_state<T>(
        &self,
        mutate: bool,
        now: UnixTimestamp,
        operation: impl FnOnce(&mut StoreState) -> T,
    ) -> T {
        let mut state = self.state.lock();
        let Some(backing) = &self.backing else {
            return operation(&mut state);
        };

        let file_lock = match FileLock::acquire(&backing.lock_path, &backing.lock_policy) {
            Ok(file_lock) => {
                reload(&mut state, &backing.path, now);
                Some(file_lock)
            }
            Err(error) => {
                tracing::warn!(
                    path = %backing.path.display(),
                    error = %error,
                    "Verification store lock failed, continuing in memory"
                );
                None
            }
        };

        let output = operation(&mut state);

        if mutate && file_lock.is_some() {
            if let Err(error) = snapshot::write(&backing.path, &state.to_snapshot(now)) {
                tracing::warn!(
                    path = %backing.path.display(),
                    error = %error,
                    "Verification store persist failed"
                );
            }
        }
        drop(file_lock);
        output
    }

    pub fn lookup(
        &self,
        request_id: &str,
        tx_hash: &str,
        now: UnixTimestamp,
    ) -> Option<VerificationRecord> {
        self.with_state(false, now, |state| {
            state.ledger.lookup(request_id, tx_hash, now)
        })
    }

    pub fn owner_of(&self, tx_hash: &str, now: UnixTimestamp) -> Option<String> {
        self.with_state(false, now, |state| state.ledger.owner_of(tx_hash, now))
    }

    pub fn record(
        &self,
        request_id: &str,
        tx_hash: &str,
        credential: &str,
        expires_at: UnixTimestamp,
        now: UnixTimestamp,
    ) {
        self.with_state(true, now, |state| {
            state
                .ledger
                .record(request_id, tx_hash, credential, expires_at)
        })
    }

    pub fn remove(&self, request_id: &str, tx_hash: &str, now: UnixTimestamp) -> bool {
        self.with_state(true, now, |state| {
            state.ledger.remove(request_id, tx_hash).is_some()
        })
    }

    /// Records a freshly verified claim and seeds its session in one locked step.
    ///
    /// Replay and ownership are re-checked under the lock, so two racing verifications of the
    /// same transaction cannot both be issued.
    pub fn claim(&self, record: VerificationRecord, quota: u32, now: UnixTimestamp) -> ClaimOutcome {
        self.with_state(true, now, |state| {
            if let Some(existing) = state.ledger.lookup(&record.request_id, &record.tx_hash, now) {
                return ClaimOutcome::Replayed(existing);
            }
            if let Some(owner) = state.ledger.owner_of(&record.tx_hash, now)
                && owner != record.request_id.trim()
            {
                return ClaimOutcome::Conflict { owner };
            }
            state
                .sessions
                .seed(&record.credential, quota, record.expires_at);
            state.ledger.record(
                &record.request_id,
                &record.tx_hash,
                &record.credential,
                record.expires_at,
            );
            ClaimOutcome::Issued
        })
    }

    pub fn seed(&self, token: &str, quota: u32, expires_at: UnixTimestamp, now: UnixTimestamp) {
        self.with_state(true, now, |state| {
            state.sessions.seed(token, quota, expires_at)
        })
    }

    pub fn validate(&self, token: &str, now: UnixTimestamp) -> bool {
        self.with_state(false, now, |state| state.sessions.validate(token, now))
    }

    pub fn start(&self, token: &str, now: UnixTimestamp) -> bool {
        self.with_state(true, now, |state| state.sessions.start(token, now))
    }

    pub fn commit(&self, token: &str, now: UnixTimestamp) -> bool {
        self.with_state(true, now, |state| state.sessions.commit(token, now))
    }

    pub fn rollback(&self, token: &str, now: UnixTimestamp) -> bool {
        self.with_state(true, now, |state| state.sessions.rollback(token, now))
    }

    pub fn session(&self, token: &str, now: UnixTimestamp) -> Option<SessionRecord> {
        self.with_state(false, now, |state| {
            state
                .sessions
                .get(token)
                .filter(|session| !session.expires_at.has_passed(now))
                .cloned()
        })
    }

    /// Deletes every record and session expired at `now`.
    pub fn sweep(&self, now: UnixTimestamp) -> SweepReport {
        self.with_state(true, now, |state| SweepReport {
            records: state.ledger.sweep(now),
            sessions: state.sessions.sweep(now),
        })
    }
}

/// Replaces `state` with the snapshot on disk. A missing file means an empty store; an unreadable
/// one leaves `state` untouched.
fn reload(state: &mut StoreState, path: &Path, now: UnixTimestamp) {
    match snapshot::read(path) {
        Ok(Some(snapshot)) => *state = StoreState::from_snapshot(snapshot, now),
        Ok(None) => *state = StoreState::default(),
        Err(error) => {
            tracing::warn!(path = %path.display(), error = %error, "Verification store load failed");
        }
    }
}
