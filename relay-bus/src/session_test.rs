use std::{sync::Arc, time::Duration};

use tokio::time::Instant;

use super::{RelaySession, SessionState};
use crate::{
    directory::SourceEndpoint,
    error::RelayError,
    frame::SourceId,
    registry::RelayOptions,
    testing::{Call, FakeControl, FakeLauncher},
};

fn options() -> RelayOptions {
    RelayOptions {
        drain_grace: Duration::from_secs(5),
        start_timeout: Duration::from_secs(10),
        stop_timeout: Duration::from_secs(2),
        ..RelayOptions::default()
    }
}

async fn start(
    launcher: &Arc<FakeLauncher>,
    options: RelayOptions,
) -> anyhow::Result<(Arc<RelaySession>, FakeControl)> {
    let session = RelaySession::start(
        SourceId::from("cam-1"),
        &SourceEndpoint::new("rtsp://cam-1/stream"),
        launcher.as_ref(),
        options,
    )?;
    let process = launcher.next_process().await;
    Ok((session, process))
}

// ------------------------------------------------------------------------
// Starting -> Streaming
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_first_frame_starts_streaming() -> anyhow::Result<()> {
    let launcher = FakeLauncher::new();
    let (session, mut process) = start(&launcher, options()).await?;
    let sub = session.try_attach().unwrap();
    assert_eq!(session.state(), SessionState::Starting);

    process.send_frame(1).await?;
    session.ready().await?;

    assert_eq!(session.state(), SessionState::Streaming);
    assert_eq!(sub.recv().await.unwrap()?.seq(), 1);
    let snapshot = session.snapshot();
    assert_eq!(snapshot.frames, 1);
    assert_eq!(snapshot.subscribers, 1);
    assert!(snapshot.last_frame_at_ms.is_some());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_no_frame_before_start_timeout_fails() -> anyhow::Result<()> {
    let launcher = FakeLauncher::new();
    let (session, process) = start(&launcher, options()).await?;
    let sub = session.try_attach().unwrap();

    let err = session.ready().await.unwrap_err();

    assert!(matches!(err, RelayError::SourceUnavailable { .. }));
    session.closed().await;
    assert_eq!(session.state(), SessionState::Terminated);
    assert_eq!(process.calls(), vec![Call::Terminate, Call::Reaped(Some(143))]);
    assert!(matches!(
        sub.recv().await,
        Some(Err(RelayError::SourceUnavailable { .. }))
    ));
    Ok(())
}

#[tokio::test]
async fn test_exit_before_first_frame_is_source_unavailable() -> anyhow::Result<()> {
    let launcher = FakeLauncher::new();
    let (session, mut process) = start(&launcher, options()).await?;
    let _sub = session.try_attach().unwrap();

    process.diagnostic("Connection to tcp://cam-1:554 failed: No route to host").await?;
    process.exit(Some(1));

    assert!(matches!(
        session.ready().await,
        Err(RelayError::SourceUnavailable { .. })
    ));
    session.closed().await;
    assert!(session.try_attach().is_none());
    Ok(())
}

// ------------------------------------------------------------------------
// Streaming -> Failed -> Terminated
// ------------------------------------------------------------------------

#[tokio::test]
async fn test_upstream_exit_disconnects_all_subscribers() -> anyhow::Result<()> {
    let launcher = FakeLauncher::new();
    let (session, mut process) = start(&launcher, options()).await?;
    let a = session.try_attach().unwrap();
    let b = session.try_attach().unwrap();

    process.send_frame(1).await?;
    session.ready().await?;
    process.exit(Some(255));
    session.closed().await;

    for sub in [&a, &b] {
        assert_eq!(sub.recv().await.unwrap()?.seq(), 1);
        assert!(matches!(
            sub.recv().await,
            Some(Err(RelayError::UpstreamLost { .. }))
        ));
        assert!(sub.recv().await.is_none());
    }
    assert!(matches!(
        session.failure(),
        Some(RelayError::UpstreamLost { .. })
    ));
    assert_eq!(session.state(), SessionState::Terminated);
    assert!(process.is_reaped());
    Ok(())
}

#[tokio::test]
async fn test_stop_with_reason_fails_subscribers() -> anyhow::Result<()> {
    let launcher = FakeLauncher::new();
    let (session, mut process) = start(&launcher, options()).await?;
    let sub = session.try_attach().unwrap();
    process.send_frame(1).await?;
    session.ready().await?;
    let mut states = session.watch_state();

    session
        .stop(Some(RelayError::upstream_lost(
            session.source_id(),
            "stopped by operator",
        )))
        .await;

    assert!(states.has_changed()?);
    assert_eq!(*states.borrow_and_update(), SessionState::Terminated);
    assert!(process.is_reaped());
    assert_eq!(sub.recv().await.unwrap()?.seq(), 1);
    assert!(matches!(
        sub.recv().await,
        Some(Err(RelayError::UpstreamLost { .. }))
    ));

    // second stop is a no-op
    session.stop(None).await;
    assert_eq!(process.calls().len(), 2);
    Ok(())
}

// ------------------------------------------------------------------------
// Draining
// ------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_reattach_within_grace_cancels_drain() -> anyhow::Result<()> {
    let launcher = FakeLauncher::new();
    let (session, mut process) = start(&launcher, options()).await?;
    let sub = session.try_attach().unwrap();
    process.send_frame(1).await?;
    session.ready().await?;

    session.release(sub);
    assert_eq!(session.state(), SessionState::Draining);
    assert_eq!(session.subscriber_count(), 0);

    tokio::time::sleep(Duration::from_secs(3)).await;
    let sub = session.try_attach().unwrap();
    assert_eq!(session.state(), SessionState::Streaming);

    // well past the original deadline
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(session.state(), SessionState::Streaming);
    assert!(!process.is_reaped());
    assert_eq!(launcher.spawned(), 1);

    process.send_frame(2).await?;
    assert_eq!(sub.recv().await.unwrap()?.seq(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_grace_elapsing_terminates_and_reaps() -> anyhow::Result<()> {
    let launcher = FakeLauncher::new();
    let (session, mut process) = start(&launcher, options()).await?;
    let sub = session.try_attach().unwrap();
    process.send_frame(1).await?;
    session.ready().await?;

    let released_at = Instant::now();
    session.release(sub);
    session.closed().await;

    assert!(released_at.elapsed() >= options().drain_grace);
    assert_eq!(session.state(), SessionState::Terminated);
    assert!(session.failure().is_none());
    assert_eq!(process.calls(), vec![Call::Terminate, Call::Reaped(Some(143))]);
    assert!(session.try_attach().is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_release_while_starting_also_drains() -> anyhow::Result<()> {
    let launcher = FakeLauncher::new();
    let opts = RelayOptions {
        start_timeout: Duration::from_secs(60),
        ..options()
    };
    let (session, process) = start(&launcher, opts).await?;
    let sub = session.try_attach().unwrap();

    session.release(sub);
    assert_eq!(session.state(), SessionState::Draining);

    let sub = session.try_attach().unwrap();
    assert_eq!(session.state(), SessionState::Starting);
    session.release(sub);

    session.closed().await;
    assert!(session.failure().is_none());
    assert!(process.is_reaped());
    Ok(())
}
