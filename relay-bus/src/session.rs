use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use tokio::{
    sync::{Notify, mpsc, watch},
    time::{Instant, sleep_until},
};
use tokio_util::sync::CancellationToken;

use crate::{
    adapter::{AdapterEvent, ExitReason, SubprocessAdapter},
    broadcaster::{FrameBroadcaster, Subscriber},
    directory::SourceEndpoint,
    error::RelayError,
    frame::{Frame, SourceId},
    process::Launcher,
    registry::RelayOptions,
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Transcoder spawned, no frame parsed yet.
    Starting,
    Streaming,
    /// No subscribers; torn down when the grace period runs out.
    Draining,
    Failed,
    /// Transcoder reaped. Terminal.
    Terminated,
}

impl SessionState {
    fn is_live(self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Streaming | SessionState::Draining
        )
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionSnapshot {
    pub source_id: SourceId,
    pub state: SessionState,
    pub subscribers: usize,
    pub frames: u64,
    pub pid: Option<u32>,
    pub created_at_ms: u64,
    pub last_frame_at_ms: Option<u64>,
}

/// One transcoder relaying one source to any number of viewers.
pub struct RelaySession {
    source_id: SourceId,
    created_at: SystemTime,
    options: RelayOptions,
    adapter: SubprocessAdapter,
    broadcaster: FrameBroadcaster,
    inner: Mutex<SessionInner>,
    state_tx: watch::Sender<SessionState>,
    wake: Notify,
    closed: CancellationToken,
}

struct SessionInner {
    state: SessionState,
    subscribers: usize,
    // set once teardown has begun; no attach succeeds afterwards
    retiring: bool,
    has_streamed: bool,
    drain_deadline: Option<Instant>,
    failure: Option<RelayError>,
    frames: u64,
    last_frame_at: Option<SystemTime>,
}

impl RelaySession {
    pub(crate) fn start(
        source_id: SourceId,
        endpoint: &SourceEndpoint,
        launcher: &dyn Launcher,
        options: RelayOptions,
    ) -> Result<Arc<Self>, RelayError> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let adapter = SubprocessAdapter::start(
            source_id.clone(),
            launcher,
            endpoint,
            options.adapter(),
            events_tx,
        )?;

        log::info!("{}: session starting for {}", source_id, endpoint);
        let session = Arc::new(Self {
            broadcaster: FrameBroadcaster::new(source_id.clone(), options.queue_depth),
            source_id,
            created_at: SystemTime::now(),
            options,
            adapter,
            inner: Mutex::new(SessionInner {
                state: SessionState::Starting,
                subscribers: 0,
                retiring: false,
                has_streamed: false,
                drain_deadline: None,
                failure: None,
                frames: 0,
                last_frame_at: None,
            }),
            state_tx: watch::channel(SessionState::Starting).0,
            wake: Notify::new(),
            closed: CancellationToken::new(),
        });
        tokio::spawn(Arc::clone(&session).drive(events_rx));
        Ok(session)
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers
    }

    pub fn failure(&self) -> Option<RelayError> {
        self.lock().failure.clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.lock();
        SessionSnapshot {
            source_id: self.source_id.clone(),
            state: inner.state,
            subscribers: inner.subscribers,
            frames: inner.frames,
            pid: self.adapter.pid(),
            created_at_ms: unix_millis(self.created_at),
            last_frame_at_ms: inner.last_frame_at.map(unix_millis),
        }
    }

    /// Resolves once the transcoder has been reaped and the session reached
    /// `Terminated`.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Waits until the first frame was parsed, or fails with the reason the
    /// session could not get there.
    pub async fn ready(&self) -> Result<(), RelayError> {
        let mut rx = self.watch_state();
        let reached = rx
            .wait_for(|state| *state == SessionState::Streaming || !state.is_live())
            .await
            .map(|state| *state)
            .unwrap_or(SessionState::Terminated);
        if reached == SessionState::Streaming {
            return Ok(());
        }
        Err(self.failure().unwrap_or_else(|| {
            RelayError::source_unavailable(&self.source_id, "session closed before streaming")
        }))
    }

    /// Adds a subscriber unless teardown has begun. Cancels a pending drain.
    pub(crate) fn try_attach(&self) -> Option<Subscriber> {
        let mut inner = self.lock();
        if inner.retiring || !inner.state.is_live() {
            return None;
        }
        if inner.state == SessionState::Draining {
            inner.drain_deadline = None;
            let resumed = if inner.has_streamed {
                SessionState::Streaming
            } else {
                SessionState::Starting
            };
            self.set_state(&mut inner, resumed);
            log::info!("{}: drain cancelled, subscriber returned", self.source_id);
            self.wake.notify_one();
        }
        inner.subscribers += 1;
        Some(self.broadcaster.attach())
    }

    pub(crate) fn release(&self, subscriber: Subscriber) {
        let mut inner = self.lock();
        self.broadcaster.detach(&subscriber);
        debug_assert!(inner.subscribers > 0, "release without attach");
        inner.subscribers = inner.subscribers.saturating_sub(1);
        log::debug!(
            "{}: subscriber {} released, {} left",
            self.source_id,
            subscriber.id(),
            inner.subscribers
        );

        let drains = matches!(inner.state, SessionState::Starting | SessionState::Streaming);
        if inner.subscribers == 0 && !inner.retiring && drains {
            inner.drain_deadline = Some(Instant::now() + self.options.drain_grace);
            self.set_state(&mut inner, SessionState::Draining);
            log::info!(
                "{}: no subscribers, draining for {:?}",
                self.source_id,
                self.options.drain_grace
            );
            self.wake.notify_one();
        }
    }

    /// Tears the session down now. Subscribers are closed with `reason`, or
    /// cleanly when it is `None`. Returns after the transcoder was reaped.
    pub(crate) async fn stop(&self, reason: Option<RelayError>) {
        {
            let mut inner = self.lock();
            if !inner.retiring && inner.state.is_live() {
                inner.retiring = true;
                inner.drain_deadline = None;
                if let Some(err) = reason {
                    inner.failure = Some(err);
                    self.set_state(&mut inner, SessionState::Failed);
                }
            }
        }
        self.adapter.stop().await;
        self.closed().await;
    }

    async fn drive(self: Arc<Self>, mut events: mpsc::Receiver<AdapterEvent>) {
        let start_deadline = Instant::now() + self.options.start_timeout;
        loop {
            let (awaiting_first_frame, drain_deadline) = {
                let inner = self.lock();
                (!inner.has_streamed && !inner.retiring, inner.drain_deadline)
            };

            tokio::select! {
                event = events.recv() => match event {
                    Some(AdapterEvent::Frame(frame)) => self.on_frame(frame),
                    // already logged by the adapter
                    Some(AdapterEvent::Diagnostic(_)) => {}
                    Some(AdapterEvent::Exit(reason)) => {
                        self.on_exit(reason);
                        break;
                    }
                    None => {
                        self.on_exit(ExitReason::Stopped);
                        break;
                    }
                },
                _ = sleep_until(start_deadline), if awaiting_first_frame => {
                    self.on_start_timeout().await;
                }
                _ = sleep_until(drain_deadline.unwrap_or(start_deadline)), if drain_deadline.is_some() => {
                    self.on_drain_elapsed().await;
                }
                _ = self.wake.notified() => {}
            }
        }
        self.closed.cancel();
    }

    fn on_frame(&self, frame: Frame) {
        {
            let mut inner = self.lock();
            inner.frames += 1;
            inner.last_frame_at = Some(frame.captured_at());
            if !inner.has_streamed {
                inner.has_streamed = true;
                if inner.state == SessionState::Starting {
                    self.set_state(&mut inner, SessionState::Streaming);
                }
                log::info!("{}: first frame, {} bytes", self.source_id, frame.len());
            }
        }
        self.broadcaster.publish(&frame);
    }

    async fn on_start_timeout(&self) {
        {
            let mut inner = self.lock();
            if inner.has_streamed || inner.retiring {
                return;
            }
            let err = RelayError::source_unavailable(
                &self.source_id,
                format!("no frame within {:?}", self.options.start_timeout),
            );
            log::warn!("{}", err);
            inner.retiring = true;
            inner.drain_deadline = None;
            inner.failure = Some(err);
            self.set_state(&mut inner, SessionState::Failed);
        }
        self.adapter.stop().await;
    }

    async fn on_drain_elapsed(&self) {
        {
            let mut inner = self.lock();
            let elapsed = inner
                .drain_deadline
                .is_some_and(|deadline| deadline <= Instant::now());
            if inner.state != SessionState::Draining
                || inner.subscribers > 0
                || inner.retiring
                || !elapsed
            {
                return;
            }
            inner.retiring = true;
            inner.drain_deadline = None;
        }
        log::info!("{}: grace period over, stopping transcoder", self.source_id);
        self.adapter.stop().await;
    }

    fn on_exit(&self, reason: ExitReason) {
        let failure = {
            let mut inner = self.lock();
            let failure = if inner.retiring {
                inner.failure.clone()
            } else if inner.has_streamed {
                Some(RelayError::upstream_lost(&self.source_id, reason.to_string()))
            } else {
                Some(RelayError::source_unavailable(&self.source_id, reason.to_string()))
            };
            if let Some(err) = &failure {
                if inner.state != SessionState::Failed {
                    log::warn!("{}", err);
                    inner.failure = Some(err.clone());
                    self.set_state(&mut inner, SessionState::Failed);
                }
            }
            inner.retiring = true;
            inner.drain_deadline = None;
            failure
        };

        self.broadcaster.close(failure);

        let mut inner = self.lock();
        self.set_state(&mut inner, SessionState::Terminated);
        log::info!(
            "{}: session terminated after {} frames ({})",
            self.source_id,
            inner.frames,
            reason
        );
    }

    fn set_state(&self, inner: &mut SessionInner, state: SessionState) {
        if inner.state != state {
            log::debug!("{}: {:?} -> {:?}", self.source_id, inner.state, state);
            inner.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A viewer's hold on a session. Dropping it detaches the subscriber and
/// releases the session exactly once.
pub struct RelayLease {
    session: Arc<RelaySession>,
    subscriber: Option<Subscriber>,
}

impl RelayLease {
    pub(crate) fn new(session: Arc<RelaySession>, subscriber: Subscriber) -> Self {
        Self {
            session,
            subscriber: Some(subscriber),
        }
    }

    pub fn session(&self) -> &Arc<RelaySession> {
        &self.session
    }

    pub async fn wait_ready(&self) -> Result<(), RelayError> {
        self.session.ready().await
    }

    pub async fn recv(&self) -> Option<Result<Frame, RelayError>> {
        match &self.subscriber {
            Some(subscriber) => subscriber.recv().await,
            None => None,
        }
    }

    pub fn release(self) {
        drop(self)
    }
}

impl Drop for RelayLease {
    fn drop(&mut self) {
        if let Some(subscriber) = self.subscriber.take() {
            self.session.release(subscriber);
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
