//! Session acquisition with bounded retry
//!
//! Every fetch goes through `acquire`: duplicate the base connection, probe
//! it, and hand out the session only once the probe succeeds. A failed
//! duplicate is released (release errors go to the `DiagnosticSink`, never
//! to the caller) and the failure inspected:
//! - transient failure → retry, up to `SessionPolicy::max_retries`
//! - backend unreachable → `BackendError::Unreachable` immediately
//! - retries exhausted → `BackendError::RetriesExhausted`

use std::ops::Deref;

use crate::config::EngineConfig;
use crate::store::{Collection, Session, Store, StoreError};
use crate::Result;

/// Default bound on liveness-probe attempts
pub const DEFAULT_SESSION_RETRIES: u32 = 5;

/// Error text that marks a wholly unreachable backend
pub const NO_REACHABLE_SERVERS: &str = "no reachable servers";

/// Terminal backend failures. Not recoverable by retrying the same call.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend unreachable: {source}")]
    Unreachable { source: StoreError },

    #[error("session check failed after {attempts} attempts: {source}")]
    RetriesExhausted { attempts: u32, source: StoreError },
}

/// Observer for errors that are deliberately not propagated.
pub trait DiagnosticSink: Send + Sync {
    fn suppressed(&self, context: &str, error: &StoreError);
}

/// Default sink: log and move on.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn suppressed(&self, context: &str, error: &StoreError) {
        tracing::warn!("suppressed error during {}: {}", context, error);
    }
}

/// Retry policy for session acquisition
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub max_retries: u32,
    pub unreachable_markers: Vec<String>,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_SESSION_RETRIES,
            unreachable_markers: vec![NO_REACHABLE_SERVERS.to_string()],
        }
    }
}

impl From<&EngineConfig> for SessionPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.session_retries.max(1),
            unreachable_markers: config.unreachable_markers.clone(),
        }
    }
}

/// A probed session, released when dropped.
pub struct SessionGuard<'a> {
    session: Option<Box<dyn Session>>,
    sink: &'a dyn DiagnosticSink,
}

impl<'a> SessionGuard<'a> {
    /// Reach a collection through this session
    pub fn collection<'s>(&'s self, name: &'s str) -> Collection<'s> {
        Collection::new(&**self, name)
    }
}

impl Deref for SessionGuard<'_> {
    type Target = dyn Session;

    fn deref(&self) -> &Self::Target {
        // Only emptied in `drop`
        match self.session.as_deref() {
            Some(session) => session,
            None => unreachable!("session guard used after release"),
        }
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            release(session, self.sink);
        }
    }
}

/// Close a session without letting its error escape.
fn release(mut session: Box<dyn Session>, sink: &dyn DiagnosticSink) {
    if let Err(e) = session.close() {
        sink.suppressed("session release", &e);
    }
}

/// Acquire a session proven live by a successful ping.
pub fn acquire<'a>(
    store: &dyn Store,
    policy: &SessionPolicy,
    sink: &'a dyn DiagnosticSink,
) -> Result<SessionGuard<'a>> {
    let attempts = policy.max_retries.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        let checked = store.duplicate().and_then(|session| match session.ping() {
            Ok(()) => Ok(session),
            Err(e) => {
                release(session, sink);
                Err(e)
            }
        });

        match checked {
            Ok(session) => {
                if attempt > 1 {
                    tracing::debug!("session acquired on attempt {}/{}", attempt, attempts);
                }
                return Ok(SessionGuard {
                    session: Some(session),
                    sink,
                });
            }
            Err(e) => {
                tracing::warn!("copy session and check failed (attempt {}/{}): {}", attempt, attempts, e);
                if e.is_cluster_unreachable(&policy.unreachable_markers) {
                    tracing::error!("backend unreachable, giving up: {}", e);
                    return Err(BackendError::Unreachable { source: e }.into());
                }
                last_error = Some(e);
            }
        }
    }

    let source = last_error.unwrap_or_else(|| StoreError::Connection("no attempt made".to_string()));
    tracing::error!("session acquisition failed after {} attempts", attempts);
    Err(BackendError::RetriesExhausted { attempts, source }.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, PingFault};
    use crate::Error;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<String>>,
    }

    impl DiagnosticSink for RecordingSink {
        fn suppressed(&self, context: &str, error: &StoreError) {
            self.seen.lock().unwrap().push(format!("{}: {}", context, error));
        }
    }

    #[test]
    fn test_recovers_after_transient_failures() {
        let store = MemoryStore::new();
        store.fail_pings(2, PingFault::Timeout);

        let guard = acquire(&store, &SessionPolicy::default(), &TracingSink).unwrap();
        assert!(guard.ping().is_ok());
        assert_eq!(store.ping_count(), 4);
        assert_eq!(store.open_sessions(), 1);

        drop(guard);
        assert_eq!(store.open_sessions(), 0);
    }

    #[test]
    fn test_escalates_after_exhausting_retries() {
        let store = MemoryStore::new();
        store.fail_pings(5, PingFault::Timeout);

        let err = acquire(&store, &SessionPolicy::default(), &TracingSink).err().unwrap();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            Error::Backend(BackendError::RetriesExhausted { attempts: 5, .. })
        ));
        assert_eq!(store.ping_count(), 5);
        assert_eq!(store.open_sessions(), 0);
    }

    #[test]
    fn test_unreachable_fails_fast() {
        let store = MemoryStore::new();
        store.fail_pings(1, PingFault::Unreachable);

        let err = acquire(&store, &SessionPolicy::default(), &TracingSink).err().unwrap();
        assert!(matches!(err, Error::Backend(BackendError::Unreachable { .. })));
        assert_eq!(store.ping_count(), 1);
    }

    #[test]
    fn test_release_errors_go_to_sink() {
        let store = MemoryStore::new();
        let sink = RecordingSink::default();
        store.fail_pings(1, PingFault::Timeout);
        store.fail_closes(2);

        let guard = acquire(&store, &SessionPolicy::default(), &sink).unwrap();
        drop(guard);

        let seen = sink.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].starts_with("session release"));
        assert_eq!(store.open_sessions(), 0);
    }
}
