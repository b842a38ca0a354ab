use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use tokio::{io::AsyncRead, process::Command};

use crate::directory::SourceEndpoint;

pub type ProcessOutput = Box<dyn AsyncRead + Send + Unpin>;

/// A running transcoder. Owned by exactly one adapter task for its whole
/// life, so none of these methods are ever called concurrently.
#[async_trait]
pub trait TranscoderProcess: Send {
    fn id(&self) -> Option<u32>;

    fn take_stdout(&mut self) -> Option<ProcessOutput>;

    fn take_stderr(&mut self) -> Option<ProcessOutput>;

    /// Ask the process to exit (SIGTERM on unix). Does not wait.
    fn terminate(&mut self) -> io::Result<()>;

    /// Forcefully kill the process and reap it.
    async fn kill(&mut self) -> io::Result<()>;

    /// Wait for the process to exit and reap it. Returns the exit code, or
    /// `None` when the process was ended by a signal.
    async fn wait(&mut self) -> io::Result<Option<i32>>;
}

/// Spawns transcoders. `launch` must not block: it only forks the process.
pub trait Launcher: Send + Sync + 'static {
    fn launch(&self, endpoint: &SourceEndpoint) -> io::Result<Box<dyn TranscoderProcess>>;
}

/// Runs an external program, substituting `{url}` in its arguments with the
/// upstream URL. stdout carries the MJPEG stream, stderr the diagnostics.
#[derive(Clone, Debug)]
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
}

pub const URL_PLACEHOLDER: &str = "{url}";

impl CommandLauncher {
    pub fn new(program: impl AsRef<Path>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// ffmpeg reading the source over RTSP/TCP and writing MJPEG to stdout.
    pub fn ffmpeg(program: impl AsRef<Path>) -> Self {
        Self::new(
            program,
            [
                "-hide_banner",
                "-nostdin",
                "-loglevel",
                "warning",
                "-rtsp_transport",
                "tcp",
                "-i",
                URL_PLACEHOLDER,
                "-an",
                "-f",
                "mjpeg",
                "-q:v",
                "5",
                "pipe:1",
            ],
        )
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args_for(&self, url: &str) -> Vec<OsString> {
        self.args
            .iter()
            .map(|arg| OsString::from(arg.replace(URL_PLACEHOLDER, url)))
            .collect()
    }

    fn command(&self, url: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args_for(url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl Launcher for CommandLauncher {
    fn launch(&self, endpoint: &SourceEndpoint) -> io::Result<Box<dyn TranscoderProcess>> {
        let child = self.command(endpoint.url()).spawn().map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("spawn {}: {}", self.program.display(), e),
            )
        })?;
        log::info!(
            "launched {} (pid {:?}) for {}",
            self.program.display(),
            child.id(),
            endpoint
        );
        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: tokio::process::Child,
}

#[async_trait]
impl TranscoderProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_stdout(&mut self) -> Option<ProcessOutput> {
        self.child
            .stdout
            .take()
            .map(|out| Box::new(out) as ProcessOutput)
    }

    fn take_stderr(&mut self) -> Option<ProcessOutput> {
        self.child
            .stderr
            .take()
            .map(|err| Box::new(err) as ProcessOutput)
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        // id() is None once the child has been reaped
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        // SAFETY: pid belongs to our own, not yet reaped, child.
        let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }
}

#[cfg(test)]
#[path = "process_test.rs"]
mod process_test;
