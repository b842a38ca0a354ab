use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crate::{
    adapter::AdapterOptions,
    broadcaster::DEFAULT_QUEUE_DEPTH,
    codec::DEFAULT_MAX_FRAME_BYTES,
    directory::SourceDirectory,
    error::RelayError,
    frame::SourceId,
    process::Launcher,
    session::{RelayLease, RelaySession, SessionSnapshot},
};

#[derive(Clone, Copy, Debug)]
pub struct RelayOptions {
    /// How long an idle session keeps its transcoder for returning viewers.
    pub drain_grace: Duration,
    /// How long a new session may take to produce its first frame.
    pub start_timeout: Duration,
    /// Bounded wait between SIGTERM and SIGKILL.
    pub stop_timeout: Duration,
    /// Per-subscriber queue length.
    pub queue_depth: usize,
    pub max_frame_bytes: usize,
}

impl RelayOptions {
    pub(crate) fn adapter(&self) -> AdapterOptions {
        AdapterOptions {
            stop_timeout: self.stop_timeout,
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            drain_grace: Duration::from_secs(5),
            start_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(3),
            queue_depth: DEFAULT_QUEUE_DEPTH,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

// Each source gets its own async lock so creation, reuse and removal of its
// session are serialized without blocking other sources.
type Slot = Arc<tokio::sync::Mutex<Option<Arc<RelaySession>>>>;

/// Maps source ids to their live relay session. Cheap to clone.
#[derive(Clone)]
pub struct SourceRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    directory: Arc<dyn SourceDirectory>,
    launcher: Arc<dyn Launcher>,
    options: RelayOptions,
    slots: Mutex<HashMap<SourceId, Slot>>,
    shutting_down: AtomicBool,
}

impl SourceRegistry {
    pub fn new(
        directory: Arc<dyn SourceDirectory>,
        launcher: Arc<dyn Launcher>,
        options: RelayOptions,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                directory,
                launcher,
                options,
                slots: Mutex::new(HashMap::new()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn options(&self) -> &RelayOptions {
        &self.inner.options
    }

    /// Attaches a new subscriber to the live session for `source_id`,
    /// starting one if there is none. At most one transcoder runs per source:
    /// a session still tearing down is awaited before its successor spawns.
    pub async fn acquire(&self, source_id: &SourceId) -> Result<RelayLease, RelayError> {
        let slot = self.slot(source_id);
        let result = self.acquire_in(source_id, &slot).await;
        drop(slot);
        if result.is_err() {
            self.prune(source_id);
        }
        result
    }

    async fn acquire_in(&self, source_id: &SourceId, slot: &Slot) -> Result<RelayLease, RelayError> {
        let mut current = slot.lock().await;
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(RelayError::source_unavailable(source_id, "relay is shutting down"));
        }

        if let Some(session) = current.as_ref() {
            if let Some(subscriber) = session.try_attach() {
                log::debug!("{}: joined existing session", source_id);
                return Ok(RelayLease::new(Arc::clone(session), subscriber));
            }
            session.closed().await;
            *current = None;
        }

        let endpoint = self.inner.directory.resolve(source_id).await?;
        let session = RelaySession::start(
            source_id.clone(),
            &endpoint,
            self.inner.launcher.as_ref(),
            self.inner.options,
        )?;
        let subscriber = session.try_attach().ok_or_else(|| {
            session.failure().unwrap_or_else(|| {
                RelayError::source_unavailable(source_id, "session ended before attach")
            })
        })?;
        *current = Some(Arc::clone(&session));
        self.remove_when_closed(source_id.clone(), Arc::clone(slot), Arc::clone(&session));
        Ok(RelayLease::new(session, subscriber))
    }

    /// Hands a lease back. Equivalent to dropping it.
    pub fn release(&self, lease: RelayLease) {
        lease.release();
    }

    pub async fn session(&self, source_id: &SourceId) -> Option<Arc<RelaySession>> {
        let slot = self.lock_slots().get(source_id).cloned()?;
        let current = slot.lock().await;
        current.clone()
    }

    pub async fn snapshot(&self, source_id: &SourceId) -> Option<SessionSnapshot> {
        self.session(source_id).await.map(|s| s.snapshot())
    }

    pub async fn list(&self) -> Vec<SessionSnapshot> {
        let slots: Vec<Slot> = self.lock_slots().values().cloned().collect();
        let mut snapshots = Vec::new();
        for slot in slots {
            if let Some(session) = slot.lock().await.as_ref() {
                snapshots.push(session.snapshot());
            }
        }
        snapshots.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        snapshots
    }

    /// Stops the session for `source_id` now, closing its subscribers with
    /// `UpstreamLost`. Returns false when there was no session.
    pub async fn evict(&self, source_id: &SourceId) -> bool {
        let Some(slot) = self.lock_slots().get(source_id).cloned() else {
            return false;
        };
        let stopped = {
            let mut current = slot.lock().await;
            match current.take() {
                Some(session) => {
                    log::info!("{}: evicting session", source_id);
                    session
                        .stop(Some(RelayError::upstream_lost(source_id, "stopped by operator")))
                        .await;
                    true
                }
                None => false,
            }
        };
        drop(slot);
        self.prune(source_id);
        stopped
    }

    /// Stops every session and waits until all transcoders are reaped.
    /// Later acquires fail.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let slots: Vec<(SourceId, Slot)> = self
            .lock_slots()
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();
        log::info!("stopping {} relay sessions", slots.len());

        let stops = slots.into_iter().map(|(source_id, slot)| async move {
            let mut current = slot.lock().await;
            if let Some(session) = current.take() {
                session
                    .stop(Some(RelayError::upstream_lost(&source_id, "relay shutting down")))
                    .await;
            }
        });
        futures::future::join_all(stops).await;
        self.lock_slots().clear();
    }

    fn remove_when_closed(&self, source_id: SourceId, slot: Slot, session: Arc<RelaySession>) {
        let registry = self.clone();
        tokio::spawn(async move {
            session.closed().await;
            {
                let mut current = slot.lock().await;
                if current.as_ref().is_some_and(|s| Arc::ptr_eq(s, &session)) {
                    *current = None;
                    log::info!("{}: session removed", source_id);
                }
            }
            drop(slot);
            registry.prune(&source_id);
        });
    }

    fn slot(&self, source_id: &SourceId) -> Slot {
        Arc::clone(self.lock_slots().entry(source_id.clone()).or_default())
    }

    // Drops the map entry when nobody holds or waits on an empty slot.
    fn prune(&self, source_id: &SourceId) {
        let mut slots = self.lock_slots();
        let unused = slots.get(source_id).is_some_and(|slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|current| current.is_none())
        });
        if unused {
            slots.remove(source_id);
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<SourceId, Slot>> {
        self.inner.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod registry_test;
