//! Metered quota behind each issued credential.
//!
//! Every session follows a small reservation protocol:
//!
//! ```text
//! idle --start--> pending --commit--> idle      (unit spent)
//!                 pending --rollback--> idle    (unit refunded)
//! ```
//!
//! `start` is the only transition that spends quota, and at most one reservation is outstanding
//! per token. Every operation on an unknown or expired token returns `false`; expired sessions
//! are evicted when touched.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

use crate::timestamp::UnixTimestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    Pending,
    /// Unknown states read from disk are treated as idle.
    #[default]
    #[serde(other)]
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(deserialize_with = "non_negative_quota")]
    pub remaining_quota: u32,
    #[serde(default)]
    pub request_state: RequestState,
    pub expires_at: UnixTimestamp,
}

/// Negative quotas written by older tooling clamp to zero.
fn non_negative_quota<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let quota = i64::deserialize(deserializer)?;
    Ok(u32::try_from(quota.max(0)).unwrap_or(u32::MAX))
}

#[derive(Debug, Default, Clone)]
pub struct QuotaSessions {
    sessions: HashMap<String, SessionRecord>,
}

impl QuotaSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the session map from stored entries, skipping blank tokens and expired sessions.
    pub fn from_entries(
        entries: impl IntoIterator<Item = (String, SessionRecord)>,
        now: UnixTimestamp,
    ) -> Self {
        let sessions = entries
            .into_iter()
            .filter_map(|(token, session)| {
                let token = token.trim();
                (!token.is_empty() && !session.expires_at.has_passed(now))
                    .then(|| (token.to_string(), session))
            })
            .collect();
        Self { sessions }
    }

    /// Live sessions, in no particular order.
    pub fn entries(&self, now: UnixTimestamp) -> impl Iterator<Item = (&String, &SessionRecord)> {
        self.sessions
            .iter()
            .filter(move |(_, session)| !session.expires_at.has_passed(now))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, token: &str) -> Option<&SessionRecord> {
        self.sessions.get(token.trim())
    }

    /// Creates or replaces the session for `token` with at least one unit of quota.
    /// A blank token is ignored.
    pub fn seed(&mut self, token: &str, quota: u32, expires_at: UnixTimestamp) {
        let token = token.trim();
        if token.is_empty() {
            return;
        }
        self.sessions.insert(
            token.to_string(),
            SessionRecord {
                remaining_quota: quota.max(1),
                request_state: RequestState::Idle,
                expires_at,
            },
        );
    }

    pub fn validate(&mut self, token: &str, now: UnixTimestamp) -> bool {
        self.live_mut(token, now)
            .is_some_and(|session| session.remaining_quota > 0)
    }

    /// Reserves one unit of quota.
    pub fn start(&mut self, token: &str, now: UnixTimestamp) -> bool {
        let Some(session) = self.live_mut(token, now) else {
            return false;
        };
        if session.request_state == RequestState::Pending || session.remaining_quota == 0 {
            return false;
        }
        session.remaining_quota -= 1;
        session.request_state = RequestState::Pending;
        true
    }

    /// Finalizes the outstanding reservation. The spent unit stays spent.
    pub fn commit(&mut self, token: &str, now: UnixTimestamp) -> bool {
        let Some(session) = self.pending_mut(token, now) else {
            return false;
        };
        session.request_state = RequestState::Idle;
        true
    }

    /// Cancels the outstanding reservation and refunds its unit.
    pub fn rollback(&mut self, token: &str, now: UnixTimestamp) -> bool {
        let Some(session) = self.pending_mut(token, now) else {
            return false;
        };
        session.request_state = RequestState::Idle;
        session.remaining_quota = session.remaining_quota.saturating_add(1);
        true
    }

    /// Deletes every session expired at `now`. Returns how many were removed.
    pub fn sweep(&mut self, now: UnixTimestamp) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| !session.expires_at.has_passed(now));
        before - self.sessions.len()
    }

    fn pending_mut(&mut self, token: &str, now: UnixTimestamp) -> Option<&mut SessionRecord> {
        self.live_mut(token, now)
            .filter(|session| session.request_state == RequestState::Pending)
    }

    fn live_mut(&mut self, token: &str, now: UnixTimestamp) -> Option<&mut SessionRecord> {
        let token = token.trim();
        if self.sessions.get(token)?.expires_at.has_passed(now) {
            self.sessions.remove(token);
            return None;
        }
        self.sessions.get_mut(token)
    }
}
