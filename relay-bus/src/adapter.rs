use std::{
    fmt::{Display, Formatter},
    time::Duration,
};

use futures::StreamExt;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tokio_util::{codec::FramedRead, sync::CancellationToken};

use crate::{
    codec::MjpegCodec,
    directory::SourceEndpoint,
    error::RelayError,
    frame::{Frame, SourceId},
    process::{Launcher, ProcessOutput, TranscoderProcess},
};

/// Everything the adapter reports. `Exit` is sent exactly once per adapter
/// and is always the last event.
#[derive(Debug)]
pub enum AdapterEvent {
    Frame(Frame),
    Diagnostic(String),
    Exit(ExitReason),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// The process ended on its own, with its exit code if it had one.
    Exited(Option<i32>),
    /// `stop()` was requested.
    Stopped,
    SpawnFailed(String),
    /// The output could not be split into frames; the process was stopped.
    Protocol(String),
}

impl Display for ExitReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Exited(Some(code)) => write!(f, "exited with status {}", code),
            ExitReason::Exited(None) => write!(f, "terminated by signal"),
            ExitReason::Stopped => write!(f, "stopped"),
            ExitReason::SpawnFailed(msg) => write!(f, "spawn failed: {}", msg),
            ExitReason::Protocol(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AdapterOptions {
    /// How long a process gets to exit after SIGTERM before it is killed.
    pub stop_timeout: Duration,
    pub max_frame_bytes: usize,
}

/// Supervises one transcoder process: turns its stdout into frames and its
/// stderr into diagnostics, and reaps it on every exit path.
pub struct SubprocessAdapter {
    source_id: SourceId,
    pid: Option<u32>,
    cancel: CancellationToken,
    done: CancellationToken,
}

enum Ending {
    Stop,
    Eof,
    Fault(String),
}

impl SubprocessAdapter {
    /// Spawns the transcoder for `endpoint`. A spawn failure is returned and
    /// also reported as the single `Exit` event on `events`.
    pub fn start(
        source_id: SourceId,
        launcher: &dyn Launcher,
        endpoint: &SourceEndpoint,
        options: AdapterOptions,
        events: mpsc::Sender<AdapterEvent>,
    ) -> Result<Self, RelayError> {
        let mut process = match launcher.launch(endpoint) {
            Ok(process) => process,
            Err(e) => {
                let reason = e.to_string();
                log::error!("{}: failed to start transcoder: {}", source_id, reason);
                let _ = events.try_send(AdapterEvent::Exit(ExitReason::SpawnFailed(
                    reason.clone(),
                )));
                return Err(RelayError::source_unavailable(&source_id, reason));
            }
        };

        let pid = process.id();
        let stdout = process.take_stdout();
        let stderr = process.take_stderr();
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();

        let supervisor = Supervisor {
            source_id: source_id.clone(),
            options,
            events,
            cancel: cancel.clone(),
            done: done.clone(),
        };
        tokio::spawn(supervisor.run(process, stdout, stderr));

        Ok(Self {
            source_id,
            pid,
            cancel,
            done,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Terminates the process and returns once it has been reaped. Calling
    /// it again, or after the process already exited, returns immediately.
    pub async fn stop(&self) {
        if !self.done.is_cancelled() {
            log::debug!("{}: stopping transcoder (pid {:?})", self.source_id, self.pid);
        }
        self.cancel.cancel();
        self.done.cancelled().await;
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }
}

impl Drop for SubprocessAdapter {
    fn drop(&mut self) {
        // the supervisor still reaps in the background
        self.cancel.cancel();
    }
}

struct Supervisor {
    source_id: SourceId,
    options: AdapterOptions,
    events: mpsc::Sender<AdapterEvent>,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl Supervisor {
    async fn run(
        self,
        mut process: Box<dyn TranscoderProcess>,
        stdout: Option<ProcessOutput>,
        stderr: Option<ProcessOutput>,
    ) {
        let ending = match stdout {
            Some(stdout) => self.pump(stdout, stderr).await,
            None => Ending::Fault("transcoder stdout is not captured".to_string()),
        };

        let reason = match ending {
            Ending::Stop => {
                self.shutdown(process.as_mut()).await;
                ExitReason::Stopped
            }
            Ending::Fault(msg) => {
                log::warn!("{}: {}, stopping transcoder", self.source_id, msg);
                self.shutdown(process.as_mut()).await;
                ExitReason::Protocol(msg)
            }
            Ending::Eof => match tokio::time::timeout(self.options.stop_timeout, process.wait()).await
            {
                Ok(Ok(code)) => ExitReason::Exited(code),
                Ok(Err(e)) => {
                    log::warn!("{}: wait for transcoder failed: {}", self.source_id, e);
                    self.shutdown(process.as_mut()).await;
                    ExitReason::Exited(None)
                }
                Err(_) => {
                    log::warn!("{}: transcoder closed stdout but kept running", self.source_id);
                    self.shutdown(process.as_mut()).await;
                    ExitReason::Exited(None)
                }
            },
        };

        log::info!("{}: transcoder {}", self.source_id, reason);
        // reaped: stop() may return before the exit event is consumed
        self.done.cancel();
        let _ = self.events.send(AdapterEvent::Exit(reason)).await;
    }

    async fn pump(&self, stdout: ProcessOutput, stderr: Option<ProcessOutput>) -> Ending {
        let mut frames = FramedRead::new(stdout, MjpegCodec::new(self.options.max_frame_bytes));
        let mut diagnostics = stderr.map(DiagnosticLines::new);
        let mut stderr_open = diagnostics.is_some();
        let mut seq = 0u64;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ending::Stop,
                item = frames.next() => match item {
                    Some(Ok(data)) => {
                        seq += 1;
                        if !self.emit(AdapterEvent::Frame(Frame::new(seq, data))) {
                            return Ending::Stop;
                        }
                    }
                    Some(Err(e)) => return Ending::Fault(e.to_string()),
                    None => return Ending::Eof,
                },
                line = next_line(&mut diagnostics), if stderr_open => match line {
                    Some(line) => {
                        log::debug!("{}: {}", self.source_id, line);
                        self.emit(AdapterEvent::Diagnostic(line));
                    }
                    None => stderr_open = false,
                },
            }
        }
    }

    /// Frames and diagnostics never wait on the consumer: a full channel
    /// drops the event so the supervisor keeps observing cancellation.
    /// Returns false once the consumer is gone.
    fn emit(&self, event: AdapterEvent) -> bool {
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                log::debug!("{}: event channel full, dropped {:?}", self.source_id, kind(&event));
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// SIGTERM, a bounded wait, then SIGKILL. Always reaps.
    async fn shutdown(&self, process: &mut dyn TranscoderProcess) {
        if let Err(e) = process.terminate() {
            log::warn!("{}: terminate failed: {}", self.source_id, e);
        }
        match tokio::time::timeout(self.options.stop_timeout, process.wait()).await {
            Ok(Ok(code)) => {
                log::debug!("{}: transcoder exited with {:?} after terminate", self.source_id, code);
            }
            Ok(Err(e)) => {
                log::warn!("{}: wait after terminate failed: {}, killing", self.source_id, e);
                self.kill(process).await;
            }
            Err(_) => {
                log::warn!(
                    "{}: transcoder ignored terminate for {:?}, killing",
                    self.source_id,
                    self.options.stop_timeout
                );
                self.kill(process).await;
            }
        }
    }

    async fn kill(&self, process: &mut dyn TranscoderProcess) {
        if let Err(e) = process.kill().await {
            log::error!("{}: kill failed: {}", self.source_id, e);
        }
    }
}

/// stderr split on newlines and decoded lossily. A byte that is not UTF-8
/// never stops the pipe from being drained.
struct DiagnosticLines {
    reader: BufReader<ProcessOutput>,
    // survives a cancelled read so a partial line is never lost
    buf: Vec<u8>,
}

impl DiagnosticLines {
    fn new(stderr: ProcessOutput) -> Self {
        Self {
            reader: BufReader::new(stderr),
            buf: Vec::new(),
        }
    }

    /// `None` once stderr is closed or unreadable.
    async fn next_line(&mut self) -> Option<String> {
        match self.reader.read_until(b'\n', &mut self.buf).await {
            Ok(0) if self.buf.is_empty() => None,
            Ok(_) => {
                let line = String::from_utf8_lossy(&self.buf)
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                self.buf.clear();
                Some(line)
            }
            Err(e) => {
                log::warn!("transcoder stderr unreadable: {}", e);
                None
            }
        }
    }
}

async fn next_line(lines: &mut Option<DiagnosticLines>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

fn kind(event: &AdapterEvent) -> &'static str {
    match event {
        AdapterEvent::Frame(_) => "frame",
        AdapterEvent::Diagnostic(_) => "diagnostic",
        AdapterEvent::Exit(_) => "exit",
    }
}

#[cfg(test)]
#[path = "adapter_test.rs"]
mod adapter_test;
