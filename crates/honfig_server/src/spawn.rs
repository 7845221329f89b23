//! Child-process spawning behind a trait seam so the lifecycle machinery is
//! testable without a real game binary.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::error::Error;

/// Everything needed to launch one game-server child. The argv communicates
/// the ports to bind, where to connect back to, and the identity knobs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub game_port: u16,
    pub voice_port: u16,
    /// The manager's listener port; the child announces itself there.
    pub manager_port: u16,
    pub name: String,
    pub region: String,
    pub priority: String,
    pub no_console: bool,
}

impl LaunchSpec {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-dedicated".to_owned(),
            "-gameport".to_owned(),
            self.game_port.to_string(),
            "-voiceport".to_owned(),
            self.voice_port.to_string(),
            "-managerport".to_owned(),
            self.manager_port.to_string(),
            "-name".to_owned(),
            self.name.clone(),
            "-region".to_owned(),
            self.region.clone(),
            "-priority".to_owned(),
            self.priority.clone(),
        ];
        if self.no_console {
            args.push("-noconsole".to_owned());
        }
        args
    }
}

/// A live child process.
#[async_trait]
pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Waits for the process to exit, returning its exit code if there was
    /// one.
    async fn wait(&mut self) -> Option<i32>;

    /// Requests termination. The exit still arrives through [`wait`].
    ///
    /// [`wait`]: Self::wait
    async fn kill(&mut self);
}

#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>, Error>;
}

/// The production spawner, backed by `tokio::process`.
pub struct TokioSpawner;

#[async_trait]
impl ProcessSpawner for TokioSpawner {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>, Error> {
        let child = Command::new(&spec.executable)
            .args(spec.args())
            // Output capture belongs to the log subsystem; nothing here
            // reads the pipes, so they must not be left to fill up.
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Config(format!(
                    "failed to spawn {}: {e}",
                    spec.executable.display()
                ))
            })?;

        Ok(Box::new(TokioProcess { child }))
    }
}

struct TokioProcess {
    child: Child,
}

#[async_trait]
impl ProcessHandle for TokioProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Option<i32> {
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(_) => None,
        }
    }

    async fn kill(&mut self) {
        let _ = self.child.start_kill();
    }
}
