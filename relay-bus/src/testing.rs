//! Scripted in-memory transcoder for tests.

use std::{
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncWriteExt, DuplexStream},
    sync::{mpsc, watch},
};

use crate::{
    directory::SourceEndpoint,
    process::{Launcher, ProcessOutput, TranscoderProcess},
};

const PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    Terminate,
    Kill,
    Reaped(Option<i32>),
}

/// A JPEG-shaped payload: SOI, a tag that never contains `FF`, EOI.
pub(crate) fn jpeg(tag: u8) -> Vec<u8> {
    let tag = if tag == 0xFF { 0xFE } else { tag };
    vec![0xFF, 0xD8, 0xFF, 0xE0, tag, 0x01, 0x02, 0xFF, 0xD9]
}

// None while running, Some(exit code) once the process is dead
type ExitState = watch::Sender<Option<Option<i32>>>;

fn set_exit(exit: &ExitState, code: Option<i32>) {
    exit.send_if_modified(|state| {
        if state.is_some() {
            return false;
        }
        *state = Some(code);
        true
    });
}

pub(crate) struct FakeLauncher {
    spawned: AtomicUsize,
    fail_spawn: AtomicBool,
    honor_terminate: AtomicBool,
    urls: Mutex<Vec<String>>,
    controls_tx: mpsc::UnboundedSender<FakeControl>,
    controls_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeControl>>,
}

impl FakeLauncher {
    pub(crate) fn new() -> Arc<Self> {
        let (controls_tx, controls_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            spawned: AtomicUsize::new(0),
            fail_spawn: AtomicBool::new(false),
            honor_terminate: AtomicBool::new(true),
            urls: Mutex::new(Vec::new()),
            controls_tx,
            controls_rx: tokio::sync::Mutex::new(controls_rx),
        })
    }

    pub(crate) fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub(crate) fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    pub(crate) fn fail_spawns(&self, fail: bool) {
        self.fail_spawn.store(fail, Ordering::SeqCst);
    }

    /// Processes launched from now on ignore SIGTERM and only die to SIGKILL.
    pub(crate) fn ignore_terminate(&self) {
        self.honor_terminate.store(false, Ordering::SeqCst);
    }

    /// Control handle of the next launched process, in launch order.
    pub(crate) async fn next_process(&self) -> FakeControl {
        self.controls_rx
            .lock()
            .await
            .recv()
            .await
            .expect("launcher dropped")
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self, endpoint: &SourceEndpoint) -> io::Result<Box<dyn TranscoderProcess>> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "fake-ffmpeg: no such file or directory",
            ));
        }
        let n = self.spawned.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(endpoint.url().to_string());

        let (stdout_w, stdout_r) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_w, stderr_r) = tokio::io::duplex(PIPE_CAPACITY);
        let exit = Arc::new(watch::channel(None).0);
        let calls = Arc::new(Mutex::new(Vec::new()));

        let process = FakeProcess {
            pid: 40_000 + n as u32,
            stdout: Some(stdout_r),
            stderr: Some(stderr_r),
            exit: Arc::clone(&exit),
            calls: Arc::clone(&calls),
            honor_terminate: self.honor_terminate.load(Ordering::SeqCst),
        };
        let control = FakeControl {
            stdout: Some(stdout_w),
            stderr: Some(stderr_w),
            exit,
            calls,
        };
        let _ = self.controls_tx.send(control);
        Ok(Box::new(process))
    }
}

struct FakeProcess {
    pid: u32,
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    exit: Arc<ExitState>,
    calls: Arc<Mutex<Vec<Call>>>,
    honor_terminate: bool,
}

impl FakeProcess {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl TranscoderProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn take_stdout(&mut self) -> Option<ProcessOutput> {
        self.stdout.take().map(|s| Box::new(s) as ProcessOutput)
    }

    fn take_stderr(&mut self) -> Option<ProcessOutput> {
        self.stderr.take().map(|s| Box::new(s) as ProcessOutput)
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.record(Call::Terminate);
        if self.honor_terminate {
            set_exit(&self.exit, Some(143));
        }
        Ok(())
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.record(Call::Kill);
        set_exit(&self.exit, None);
        self.wait().await?;
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let mut rx = self.exit.subscribe();
        let code = *rx
            .wait_for(|state| state.is_some())
            .await
            .map_err(|_| io::Error::other("exit state dropped"))?;
        let code = code.flatten();
        self.record(Call::Reaped(code));
        Ok(code)
    }
}

/// Test side of a fake process: feeds its pipes and decides when it dies.
pub(crate) struct FakeControl {
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    exit: Arc<ExitState>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl FakeControl {
    pub(crate) async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.stdout.as_mut() {
            Some(stdout) => stdout.write_all(bytes).await,
            None => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        }
    }

    pub(crate) async fn send_frame(&mut self, tag: u8) -> io::Result<()> {
        self.write(&jpeg(tag)).await
    }

    pub(crate) async fn diagnostic(&mut self, line: &str) -> io::Result<()> {
        self.write_stderr(format!("{}\n", line).as_bytes()).await
    }

    pub(crate) async fn write_stderr(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.stderr.as_mut() {
            Some(stderr) => stderr.write_all(bytes).await,
            None => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        }
    }

    /// The process exits on its own: pipes close, then it becomes reapable.
    pub(crate) fn exit(&mut self, code: Option<i32>) {
        self.stdout = None;
        self.stderr = None;
        set_exit(&self.exit, code);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn is_reaped(&self) -> bool {
        self.calls()
            .iter()
            .any(|call| matches!(call, Call::Reaped(_)))
    }
}
