//! Realtime-flush intake. The sync gateway delivers a session's final
//! snapshot here; identical session ids within the TTL window are answered
//! from a cache so duplicate deliveries are harmless. The cache is purely
//! in-process: a cold start is safe because an unchanged snapshot never
//! commits.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::content::Content;
use crate::id::{ActorId, DocumentId, ProposalId};
use crate::Timestamp;

/// How long a session's response is remembered.
pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

/// A "session-ended" call from the sync gateway. Authentication is the
/// adapter's business; the engine receives only trusted requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub session_id: String,
    pub document_id: DocumentId,
    #[serde(default)]
    pub proposal_id: Option<ProposalId>,
    #[serde(default)]
    pub actor: Option<ActorId>,
    #[serde(default)]
    pub update_count: u64,
    #[serde(default)]
    pub snapshot: Option<Content>,
}

/// The intake's answer; replayed verbatim for duplicate deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub ok: bool,
    pub session_id: String,
    pub document_id: DocumentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposal_id: Option<ProposalId>,
    pub flush_commit: Option<String>,
    pub update_count: u64,
}

/// TTL-bounded session cache, guarded by a single mutex with inline
/// eviction on each access.
#[derive(Debug)]
pub struct Sessions {
    ttl: Duration,
    inner: Mutex<HashMap<String, (Timestamp, Response)>>,
}

impl Sessions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// The cached response for a session, if it is still fresh.
    pub fn get(&self, session: &str, now: Timestamp) -> Option<Response> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.evict(&mut inner, now);

        inner.get(session).map(|(_, response)| response.clone())
    }

    pub fn put(&self, response: Response, now: Timestamp) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.evict(&mut inner, now);
        inner.insert(response.session_id.clone(), (now, response));
    }

    fn evict(&self, inner: &mut HashMap<String, (Timestamp, Response)>, now: Timestamp) {
        let ttl = self.ttl.as_millis() as u64;
        inner.retain(|_, (at, _)| now.as_millis().saturating_sub(at.as_millis()) < ttl);
    }
}

impl Default for Sessions {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}
