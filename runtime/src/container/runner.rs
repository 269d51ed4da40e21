//! Process runner seam.
//!
//! The instance manager launches container payloads through the
//! [`ProcessRunner`] trait so the payload backend is injectable: production
//! uses [`HostRunner`] (host processes rooted in the materialized
//! filesystem), tests script their own handles.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

use cask_core::error::{CaskError, Result};
use cask_core::MountSpec;

/// Everything needed to launch a container payload.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Resolved command line (entrypoint + arguments)
    pub command: Vec<String>,

    /// Effective environment
    pub env: BTreeMap<String, String>,

    /// Working directory (inside the materialized root)
    pub cwd: PathBuf,

    /// Mounts bound into the root
    pub mounts: Vec<MountSpec>,
}

/// Launches container payloads.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Launch the payload described by `spec`.
    async fn spawn(&self, spec: &ProcessSpec) -> Result<Box<dyn ProcessHandle>>;
}

/// A running payload.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Wait for the payload to exit, returning its exit code.
    async fn wait(&mut self) -> Result<i32>;

    /// Request graceful termination.
    async fn terminate(&mut self) -> Result<()>;

    /// Force-kill the payload.
    async fn kill(&mut self) -> Result<()>;

    /// Suspend the payload. Backends without suspension support treat this
    /// as a no-op.
    async fn suspend(&mut self) -> Result<()> {
        Ok(())
    }

    /// Resume a suspended payload.
    async fn resume(&mut self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ProcessHandle")
    }
}

/// Runner that spawns payloads as host processes.
///
/// The payload runs with the materialized root as its working directory;
/// no namespace isolation is applied.
pub struct HostRunner;

#[async_trait]
impl ProcessRunner for HostRunner {
    async fn spawn(&self, spec: &ProcessSpec) -> Result<Box<dyn ProcessHandle>> {
        let program = spec.command.first().ok_or_else(|| {
            CaskError::InvalidState("cannot spawn a payload with an empty command".to_string())
        })?;

        let mut command = tokio::process::Command::new(program);
        command
            .args(&spec.command[1..])
            .envs(&spec.env)
            .current_dir(&spec.cwd)
            .kill_on_drop(true);

        let child = command.spawn()?;
        tracing::debug!(program = %program, pid = child.id(), "spawned payload");
        Ok(Box::new(HostProcess { child }))
    }
}

/// Handle for a host process payload.
struct HostProcess {
    child: tokio::process::Child,
}

#[async_trait]
impl ProcessHandle for HostProcess {
    async fn wait(&mut self) -> Result<i32> {
        let status = self.child.wait().await?;
        Ok(exit_code(&status))
    }

    async fn terminate(&mut self) -> Result<()> {
        self.signal(Signal::Term)
    }

    async fn kill(&mut self) -> Result<()> {
        self.child.start_kill()?;
        Ok(())
    }

    async fn suspend(&mut self) -> Result<()> {
        self.signal(Signal::Stop)
    }

    async fn resume(&mut self) -> Result<()> {
        self.signal(Signal::Cont)
    }
}

enum Signal {
    Term,
    Stop,
    Cont,
}

impl HostProcess {
    #[cfg(unix)]
    fn signal(&self, signal: Signal) -> Result<()> {
        let Some(pid) = self.child.id() else {
            // Already exited; nothing to signal.
            return Ok(());
        };
        let signo = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Stop => libc::SIGSTOP,
            Signal::Cont => libc::SIGCONT,
        };
        // SAFETY: pid refers to a child we own; a stale pid at worst hits a
        // reaped process id and kill returns ESRCH, which we ignore.
        unsafe {
            libc::kill(pid as libc::pid_t, signo);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn signal(&self, _signal: Signal) -> Result<()> {
        Err(CaskError::Other(
            "process signalling is only supported on unix".to_string(),
        ))
    }
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
