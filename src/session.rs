//! Per-browser-session UI state.
//!
//! Each session owns one [`ProgressRelay`], at most one running job and at most
//! one unserved [`Artifact`]. Phases follow `Idle -> Requesting -> Succeeded | Failed`,
//! and a new submission (or an explicit reset) leaves the finished phase.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use crate::job::{JobError, MediaMetadata};
use crate::orchestrator::Artifact;
use crate::progress::{ErrorReport, ProgressRelay, ProgressStatus};
use crate::util::human_size;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Requesting,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub title: String,
    pub file_name: String,
    pub size_bytes: u64,
    pub size_text: String,
    pub bitrate_kbps: u32,
    pub metadata: MediaMetadata,
    pub served: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub progress: ProgressStatus,
    pub result: Option<JobSummary>,
    pub error: Option<ErrorReport>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DownloadUnavailable {
    NotReady,
    AlreadyServed,
}

#[derive(Debug, PartialEq, Eq)]
pub struct SessionBusy;

struct SessionInner {
    phase: Phase,
    summary: Option<JobSummary>,
    error: Option<ErrorReport>,
    artifact: Option<Artifact>,
    last_seen: Instant,
}

pub struct Session {
    relay: ProgressRelay,
    inner: Mutex<SessionInner>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            relay: ProgressRelay::default(),
            inner: Mutex::new(SessionInner {
                phase: Phase::Idle,
                summary: None,
                error: None,
                artifact: None,
                last_seen: Instant::now(),
            }),
        }
    }
}

impl Session {
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn relay(&self) -> &ProgressRelay {
        &self.relay
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    /// Move to `Requesting`. Fails while a job is already running; any
    /// unserved artifact from the previous job is discarded.
    pub fn begin(&self) -> Result<(), SessionBusy> {
        let stale = {
            let mut g = self.lock();
            if g.phase == Phase::Requesting {
                return Err(SessionBusy);
            }
            g.phase = Phase::Requesting;
            g.summary = None;
            g.error = None;
            g.last_seen = Instant::now();
            g.artifact.take()
        };
        self.relay.reset();
        drop(stale);
        Ok(())
    }

    pub fn finish(&self, outcome: Result<Artifact, JobError>) {
        let mut g = self.lock();
        g.last_seen = Instant::now();
        match outcome {
            Ok(artifact) => {
                g.phase = Phase::Succeeded;
                g.summary = Some(JobSummary {
                    title: artifact.title.clone(),
                    file_name: artifact.file_name.clone(),
                    size_bytes: artifact.size,
                    size_text: human_size(artifact.size),
                    bitrate_kbps: artifact.bitrate.kbps(),
                    metadata: artifact.metadata.clone(),
                    served: false,
                });
                g.artifact = Some(artifact);
            }
            Err(e) => {
                g.phase = Phase::Failed;
                g.error = Some(ErrorReport {
                    kind: e.kind(),
                    message: e.to_string(),
                });
            }
        }
    }

    /// Back to `Idle`; refused while a job is running.
    pub fn reset(&self) -> Result<(), SessionBusy> {
        let stale = {
            let mut g = self.lock();
            if g.phase == Phase::Requesting {
                return Err(SessionBusy);
            }
            g.phase = Phase::Idle;
            g.summary = None;
            g.error = None;
            g.last_seen = Instant::now();
            g.artifact.take()
        };
        self.relay.reset();
        drop(stale);
        Ok(())
    }

    /// Take the finished file out of the session; it can be served once.
    pub fn take_artifact(&self) -> Result<Artifact, DownloadUnavailable> {
        let mut g = self.lock();
        g.last_seen = Instant::now();
        match g.artifact.take() {
            Some(a) => {
                if let Some(s) = g.summary.as_mut() {
                    s.served = true;
                }
                Ok(a)
            }
            None if g.summary.as_ref().map(|s| s.served).unwrap_or(false) => {
                Err(DownloadUnavailable::AlreadyServed)
            }
            None => Err(DownloadUnavailable::NotReady),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let (phase, result, error) = {
            let mut g = self.lock();
            g.last_seen = Instant::now();
            (g.phase, g.summary.clone(), g.error.clone())
        };
        SessionSnapshot {
            phase,
            progress: self.relay.snapshot(),
            result,
            error,
        }
    }

    fn idle_for(&self, now: Instant) -> Option<Duration> {
        let g = self.lock();
        if g.phase == Phase::Requesting {
            return None;
        }
        Some(now.saturating_duration_since(g.last_seen))
    }
}

#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<Uuid, Arc<Session>>>,
}

impl SessionStore {
    fn map(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<Session>>> {
        match self.sessions.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.map().get(id).cloned()
    }

    /// Look up `id`, or open a fresh session. The flag is true when the
    /// returned id is new and must be handed to the client.
    pub fn resolve(&self, id: Option<Uuid>) -> (Uuid, Arc<Session>, bool) {
        let mut map = self.map();
        if let Some(id) = id {
            if let Some(s) = map.get(&id) {
                return (id, s.clone(), false);
            }
        }
        let id = Uuid::new_v4();
        let session = Arc::new(Session::default());
        map.insert(id, session.clone());
        log::debug!("[SESSION] opened {}", id);
        (id, session, true)
    }

    /// Drop sessions idle for longer than `ttl`; sessions with a running job are kept.
    pub fn reap_idle(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<Arc<Session>> = {
            let mut map = self.map();
            let ids: Vec<Uuid> = map
                .iter()
                .filter(|(_, s)| s.idle_for(now).map(|d| d > ttl).unwrap_or(false))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| map.remove(id)).collect()
        };
        // Artifacts are deleted here, outside the store lock.
        let n = expired.len();
        drop(expired);
        n
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
