use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use quinn::VarInt;
use tracing::{debug, info};

use crate::error::Error;
use crate::session::{Session, SessionKey, SessionState, StreamLease};

type PendingSession = Shared<BoxFuture<'static, Result<Arc<Session>, Error>>>;

enum Slot {
    /// A handshake is in flight; later callers wait on the same outcome.
    Establishing { attempt: u64, future: PendingSession },
    Ready(Arc<Session>),
}

enum Claim<T> {
    Ready(T),
    Pending(PendingSession),
}

/// Point-in-time counters for a registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub live_sessions: usize,
    pub establishing: usize,
    pub open_streams: usize,
}

/// Single source of truth for which sessions exist and how many streams
/// reference each of them.
///
/// The registry is a cheap handle; clones share the same state. It is created
/// by the caller and passed to listeners and dialers, so several independent
/// registries can coexist in one process.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    keyed: DashMap<SessionKey, Slot, ahash::RandomState>,
    sessions: DashMap<u64, Arc<Session>, ahash::RandomState>,
    idle_timeout: Duration,
    next_attempt: AtomicU64,
}

impl SessionRegistry {
    /// Create a registry that closes sessions after `idle_timeout` without streams.
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                keyed: DashMap::default(),
                sessions: DashMap::default(),
                idle_timeout,
                next_attempt: AtomicU64::new(1),
            }),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.inner.idle_timeout
    }

    /// Return the live session for `key`, establishing one if needed.
    ///
    /// At most one establishment per key is in flight: concurrent callers wait
    /// on the winner's result instead of starting their own. The establishment
    /// runs on its own task, so a caller that gives up does not cancel it for
    /// the others. A failed attempt is forgotten and the next call retries.
    pub async fn get_or_create_session<F, Fut>(
        &self,
        key: SessionKey,
        establish: F,
    ) -> Result<Arc<Session>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Session, Error>> + Send + 'static,
    {
        let take = |session: &Arc<Session>| session.is_live().then(|| Arc::clone(session));
        match self.claim(key, establish, take) {
            Claim::Ready(session) => Ok(session),
            Claim::Pending(pending) => pending.await,
        }
    }

    /// Like [`get_or_create_session`](Self::get_or_create_session), but also
    /// counts one open stream on the returned session.
    ///
    /// An existing session is leased while its registry entry is locked, so an
    /// idle-close racing with this call either loses or makes the call
    /// establish a fresh session instead of failing.
    pub async fn get_or_create_stream<F, Fut>(
        &self,
        key: SessionKey,
        establish: F,
    ) -> Result<StreamLease, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Session, Error>> + Send + 'static,
    {
        let take = |session: &Arc<Session>| self.acquire_stream(session).ok();
        match self.claim(key, establish, take) {
            Claim::Ready(lease) => Ok(lease),
            Claim::Pending(pending) => self.acquire_stream(&pending.await?),
        }
    }

    /// Look up the live session for `key` without establishing one.
    pub fn lookup(&self, key: &SessionKey) -> Option<Arc<Session>> {
        match self.inner.keyed.get(key).as_deref() {
            Some(Slot::Ready(session)) if session.is_live() => Some(Arc::clone(session)),
            _ => None,
        }
    }

    pub fn get(&self, session_id: u64) -> Option<Arc<Session>> {
        self.inner
            .sessions
            .get(&session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Count one more open stream on `session`.
    ///
    /// Cancels a pending idle-close. Fails once the session has begun teardown.
    pub fn acquire_stream(&self, session: &Arc<Session>) -> Result<StreamLease, Error> {
        {
            let mut state = session.lock_state();
            if let Some(reason) = &state.closed {
                return Err(Error::SessionClosed(reason.clone()));
            }
            if state.draining {
                return Err(Error::SessionClosed("draining".to_string()));
            }
            if let Some(reason) = session.connection().close_reason() {
                return Err(Error::from_connection(reason));
            }

            state.open_streams += 1;
            cancel_idle_timer(&mut state);
        }

        Ok(StreamLease::new(Arc::clone(session), self.clone()))
    }

    /// Give back a stream reference.
    pub fn release_stream(&self, mut lease: StreamLease) {
        lease.release();
    }

    /// Forcibly tear down `session`.
    ///
    /// The session becomes unreachable for new streams before the QUIC
    /// connection is closed; in-flight stream operations then fail with
    /// `SessionClosed`. Returns false if the session was already closed.
    pub fn close_session(&self, session: &Arc<Session>, reason: &str) -> bool {
        self.shut_down(session, reason, Error::CODE_CLOSED, None)
    }

    /// Close `session` as soon as it has no open streams.
    pub fn drain_session(&self, session: &Arc<Session>) {
        let idle = {
            let mut state = session.lock_state();
            if state.closed.is_some() {
                return;
            }
            state.draining = true;
            state.open_streams == 0
        };

        if idle {
            self.shut_down(session, "drained", Error::CODE_CLOSED, None);
        }
    }

    /// Close every session in the registry.
    pub fn close_all(&self, reason: &str) {
        for session in self.snapshot(|_| true) {
            self.close_session(&session, reason);
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        let establishing = self
            .inner
            .keyed
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Establishing { .. }))
            .count();

        let sessions = self.snapshot(|_| true);
        RegistryStats {
            live_sessions: sessions.len(),
            establishing,
            open_streams: sessions.iter().map(|s| s.open_streams()).sum(),
        }
    }

    /// Start tracking an established session.
    pub(crate) fn register(&self, session: &Arc<Session>) {
        self.inner
            .sessions
            .insert(session.id(), Arc::clone(session));

        {
            let mut state = session.lock_state();
            if state.open_streams == 0 && state.closed.is_none() {
                self.arm_idle_timer(session, &mut state);
            }
        }

        // Transport-level closure (peer close, idle timeout, fatal error)
        // evicts the session without waiting for the next stream operation.
        let registry = Arc::downgrade(&self.inner);
        let watched = Arc::clone(session);
        tokio::spawn(async move {
            let reason = watched.connection().closed().await;
            if let Some(inner) = registry.upgrade() {
                SessionRegistry { inner }.shut_down(
                    &watched,
                    &reason.to_string(),
                    Error::CODE_CLOSED,
                    None,
                );
            }
        });

        info!(
            session_id = session.id(),
            role = ?session.role(),
            remote = %session.remote_addr(),
            "Session registered"
        );
    }

    pub(crate) fn sessions_owned_by(&self, owner: u64) -> Vec<Arc<Session>> {
        self.snapshot(|session| session.owner() == owner)
    }

    pub(crate) fn release(&self, session: &Arc<Session>) {
        let drained = {
            let mut state = session.lock_state();
            state.open_streams = state.open_streams.saturating_sub(1);
            if state.open_streams > 0 || state.closed.is_some() {
                return;
            }
            if !state.draining {
                self.arm_idle_timer(session, &mut state);
            }
            state.draining
        };

        if drained {
            self.shut_down(session, "drained", Error::CODE_CLOSED, None);
        }
    }

    /// Take the ready session for `key` through `take`, or join (or start)
    /// its establishment. A ready session `take` refuses counts as stale.
    fn claim<F, Fut, T>(
        &self,
        key: SessionKey,
        establish: F,
        take: impl FnOnce(&Arc<Session>) -> Option<T>,
    ) -> Claim<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Session, Error>> + Send + 'static,
    {
        match self.inner.keyed.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let in_flight = match occupied.get() {
                    Slot::Ready(session) => match take(session) {
                        Some(taken) => return Claim::Ready(taken),
                        None => None,
                    },
                    Slot::Establishing { future, .. } => Some(future.clone()),
                };
                match in_flight {
                    Some(future) => Claim::Pending(future),
                    None => {
                        let (attempt, future) = self.start_establishment(key, establish());
                        occupied.insert(Slot::Establishing {
                            attempt,
                            future: future.clone(),
                        });
                        Claim::Pending(future)
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let (attempt, future) = self.start_establishment(key, establish());
                vacant.insert(Slot::Establishing {
                    attempt,
                    future: future.clone(),
                });
                Claim::Pending(future)
            }
        }
    }

    fn start_establishment<Fut>(&self, key: SessionKey, establish: Fut) -> (u64, PendingSession)
    where
        Fut: Future<Output = Result<Session, Error>> + Send + 'static,
    {
        let attempt = self.inner.next_attempt.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, attempt, "Establishing session");

        let registry = self.clone();
        let task = tokio::spawn(async move {
            let result = establish.await;
            registry.finish_establishment(&key, attempt, result)
        });

        let future = async move {
            task.await.unwrap_or_else(|e| {
                Err(Error::Establishment(format!("establishment task failed: {e}")))
            })
        }
        .boxed()
        .shared();

        (attempt, future)
    }

    /// Publish an establishment outcome before any waiter observes it.
    fn finish_establishment(
        &self,
        key: &SessionKey,
        attempt: u64,
        result: Result<Session, Error>,
    ) -> Result<Arc<Session>, Error> {
        let is_this_attempt =
            |slot: &Slot| matches!(slot, Slot::Establishing { attempt: a, .. } if *a == attempt);

        match result {
            Ok(session) => {
                let session = Arc::new(session);
                self.register(&session);

                if let Some(mut slot) = self.inner.keyed.get_mut(key) {
                    if is_this_attempt(&*slot) {
                        *slot = Slot::Ready(Arc::clone(&session));
                    }
                }
                Ok(session)
            }
            Err(e) => {
                debug!(key = %key, attempt, error = %e, "Session establishment failed");
                self.inner
                    .keyed
                    .remove_if(key, |_, slot| is_this_attempt(slot));
                Err(e)
            }
        }
    }

    fn arm_idle_timer(&self, session: &Arc<Session>, state: &mut SessionState) {
        cancel_idle_timer(state);

        // Without a runtime (e.g. a lease dropped during shutdown) the session
        // is left to the transport idle timeout.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let timeout = self.inner.idle_timeout;
        let generation = state.idle_generation;
        let registry: Weak<Inner> = Arc::downgrade(&self.inner);
        let session_ref = Arc::downgrade(session);

        state.idle_deadline = Some(Instant::now() + timeout);
        state.idle_timer = Some(runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let (Some(inner), Some(session)) = (registry.upgrade(), session_ref.upgrade()) {
                let registry = SessionRegistry { inner };
                if registry.shut_down(&session, "idle timeout", Error::CODE_IDLE, Some(generation)) {
                    debug!(session_id = session.id(), "Idle session closed");
                }
            }
        }));
    }

    /// Close `session` atomically with respect to `acquire_stream`.
    ///
    /// With `idle_generation` set, the close only happens if no stream was
    /// acquired since that idle timer was armed.
    fn shut_down(
        &self,
        session: &Arc<Session>,
        reason: &str,
        code: u32,
        idle_generation: Option<u64>,
    ) -> bool {
        {
            let mut state = session.lock_state();
            if state.closed.is_some() {
                return false;
            }
            if let Some(generation) = idle_generation {
                if state.open_streams > 0 || state.idle_generation != generation {
                    return false;
                }
                // The running timer is the caller; just forget its handle.
                state.idle_timer = None;
                state.idle_deadline = None;
            } else {
                cancel_idle_timer(&mut state);
            }
            state.closed = Some(reason.to_string());
        }

        self.unlink(session);
        session
            .connection()
            .close(VarInt::from_u32(code), reason.as_bytes());

        info!(
            session_id = session.id(),
            remote = %session.remote_addr(),
            reason = %reason,
            "Session closed"
        );
        true
    }

    fn unlink(&self, session: &Arc<Session>) {
        self.inner.sessions.remove(&session.id());
        if let Some(key) = session.key() {
            let id = session.id();
            self.inner
                .keyed
                .remove_if(key, |_, slot| matches!(slot, Slot::Ready(s) if s.id() == id));
        }
    }

    fn snapshot(&self, filter: impl Fn(&Session) -> bool) -> Vec<Arc<Session>> {
        self.inner
            .sessions
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(crate::config::TransportConfig::default().session_idle_timeout)
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.inner.sessions.len())
            .field("idle_timeout", &self.inner.idle_timeout)
            .finish()
    }
}

fn cancel_idle_timer(state: &mut SessionState) {
    state.idle_generation += 1;
    state.idle_deadline = None;
    if let Some(timer) = state.idle_timer.take() {
        timer.abort();
    }
}
