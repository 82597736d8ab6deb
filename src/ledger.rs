//! Idempotency and double-spend index over verified payment claims.
//!
//! A claim is keyed by the pair `(request_id, tx_hash)`. Each transaction hash is owned by at most
//! one request id at a time, so one payment can never fund two credentials. Request ids are
//! trimmed and transaction hashes are trimmed and lower-cased on every entry point.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::timestamp::UnixTimestamp;

/// One successfully verified payment claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub tx_hash: String,
    /// The signed credential issued for the claim.
    #[serde(rename = "token", alias = "credential", default)]
    pub credential: String,
    pub expires_at: UnixTimestamp,
}

impl VerificationRecord {
    /// Returns the record with trimmed keys, or `None` if a key is blank.
    pub fn normalized(mut self) -> Option<Self> {
        self.request_id = normalize_request_id(&self.request_id);
        self.tx_hash = normalize_tx_hash(&self.tx_hash);
        if self.request_id.is_empty() || self.tx_hash.is_empty() {
            return None;
        }
        Some(self)
    }
}

pub fn normalize_request_id(request_id: &str) -> String {
    request_id.trim().to_string()
}

pub fn normalize_tx_hash(tx_hash: &str) -> String {
    tx_hash.trim().to_lowercase()
}

type PairKey = (String, String);

fn pair_key(request_id: &str, tx_hash: &str) -> PairKey {
    (normalize_request_id(request_id), normalize_tx_hash(tx_hash))
}

#[derive(Debug, Default, Clone)]
pub struct VerificationLedger {
    by_pair: HashMap<PairKey, VerificationRecord>,
    /// Normalized tx hash to the request id that currently owns it.
    by_tx_hash: HashMap<String, String>,
}

impl VerificationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a ledger from stored records, skipping blank and expired ones.
    pub fn from_records(
        records: impl IntoIterator<Item = VerificationRecord>,
        now: UnixTimestamp,
    ) -> Self {
        let mut ledger = Self::new();
        for record in records.into_iter().filter_map(VerificationRecord::normalized) {
            if record.expires_at.has_passed(now) {
                continue;
            }
            ledger.insert(record);
        }
        ledger
    }

    /// Live records, in no particular order.
    pub fn records(&self, now: UnixTimestamp) -> impl Iterator<Item = &VerificationRecord> {
        self.by_pair
            .values()
            .filter(move |record| !record.expires_at.has_passed(now))
    }

    pub fn len(&self) -> usize {
        self.by_pair.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pair.is_empty()
    }

    /// The live record for the pair. An expired match is evicted.
    pub fn lookup(
        &mut self,
        request_id: &str,
        tx_hash: &str,
        now: UnixTimestamp,
    ) -> Option<VerificationRecord> {
        let key = pair_key(request_id, tx_hash);
        let record = self.by_pair.get(&key)?;
        if record.expires_at.has_passed(now) {
            self.evict(&key);
            return None;
        }
        Some(record.clone())
    }

    /// The request id currently claiming `tx_hash`. An owner whose record expired is evicted.
    pub fn owner_of(&mut self, tx_hash: &str, now: UnixTimestamp) -> Option<String> {
        let tx_hash = normalize_tx_hash(tx_hash);
        let owner = self.by_tx_hash.get(&tx_hash)?.clone();
        let key = (owner.clone(), tx_hash);
        match self.by_pair.get(&key) {
            Some(record) if !record.expires_at.has_passed(now) => Some(owner),
            _ => {
                self.evict(&key);
                None
            }
        }
    }

    /// Inserts or overwrites the record for its pair and makes it the owner of its tx hash.
    ///
    /// Callers check [`VerificationLedger::owner_of`] first; this does not refuse a conflicting
    /// owner.
    pub fn record(
        &mut self,
        request_id: &str,
        tx_hash: &str,
        credential: &str,
        expires_at: UnixTimestamp,
    ) {
        let (request_id, tx_hash) = pair_key(request_id, tx_hash);
        self.insert(VerificationRecord {
            request_id,
            tx_hash,
            credential: credential.to_string(),
            expires_at,
        });
    }

    pub fn remove(&mut self, request_id: &str, tx_hash: &str) -> Option<VerificationRecord> {
        let key = pair_key(request_id, tx_hash);
        self.evict(&key)
    }

    /// Deletes every record expired at `now`. Returns how many were removed.
    pub fn sweep(&mut self, now: UnixTimestamp) -> usize {
        let expired: Vec<PairKey> = self
            .by_pair
            .iter()
            .filter(|(_, record)| record.expires_at.has_passed(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.evict(key);
        }
        expired.len()
    }

    fn insert(&mut self, record: VerificationRecord) {
        self.by_tx_hash
            .insert(record.tx_hash.clone(), record.request_id.clone());
        self.by_pair
            .insert((record.request_id.clone(), record.tx_hash.clone()), record);
    }

    /// Removes the pair, and its tx index entry if that entry still points at this pair.
    fn evict(&mut self, key: &PairKey) -> Option<VerificationRecord> {
        let (request_id, tx_hash) = key;
        if self
            .by_tx_hash
            .get(tx_hash)
            .is_some_and(|owner| owner == request_id)
        {
            self.by_tx_hash.remove(tx_hash);
        }
        self.by_pair.remove(key)
    }
}
