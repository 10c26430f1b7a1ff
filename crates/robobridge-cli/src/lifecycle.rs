//! [`LifecycleController`] – starts and stops the broker's host process.
//!
//! Both operations are best-effort. Failures are logged and never stop the
//! bridge from running (on start) or exiting (on stop).

use std::future::Future;
use std::process::Stdio;

use robobridge_types::BridgeError;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Runs the configured external start/stop commands.
#[derive(Debug, Clone, Default)]
pub struct LifecycleController {
    start_command: Vec<String>,
    stop_command: Vec<String>,
}

impl LifecycleController {
    /// An empty command disables that half.
    pub fn new(start_command: Vec<String>, stop_command: Vec<String>) -> Self {
        Self {
            start_command,
            stop_command,
        }
    }

    /// Launch the start command without waiting for it.
    ///
    /// Its exit status and output are logged from a background task, whose
    /// handle is returned. `None` when the command is disabled or could not
    /// be spawned.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let mut command = build_command(&self.start_command)?;
        let program = self.start_command.join(" ");
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(command = %program, error = %e, "failed to launch broker start command");
                return None;
            }
        };

        Some(tokio::spawn(async move {
            match child.wait_with_output().await {
                Ok(output) if output.status.success() => {
                    let stdout = String::from_utf8_lossy(&output.stdout);
                    info!(command = %program, output = %stdout.trim(), "broker process started");
                }
                Ok(output) => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    error!(command = %program, status = %output.status, stderr = %stderr.trim(), "broker start command failed");
                }
                Err(e) => {
                    error!(command = %program, error = %e, "broker start command did not complete");
                }
            }
        }))
    }

    /// Launch the stop command and return immediately.
    ///
    /// The child is detached; the caller may exit straight away.
    pub fn stop(&self) -> Result<(), BridgeError> {
        let Some(mut command) = build_command(&self.stop_command) else {
            return Ok(());
        };
        let program = self.stop_command.join(" ");
        command.stdout(Stdio::null()).stderr(Stdio::null());

        match command.spawn() {
            Ok(child) => {
                info!(command = %program, pid = child.id(), "broker stop command issued");
                Ok(())
            }
            Err(e) => {
                warn!(command = %program, error = %e, "failed to launch broker stop command");
                Err(BridgeError::Process(format!("{program}: {e}")))
            }
        }
    }

    /// Run `body` between [`start`](Self::start) and [`stop`](Self::stop).
    ///
    /// The stop command is issued however `body` ends, including with an
    /// error. Its own failure is logged and does not replace `body`'s result.
    pub async fn supervise<F, T>(&self, body: F) -> Result<T, BridgeError>
    where
        F: Future<Output = Result<T, BridgeError>>,
    {
        self.start();
        let result = body.await;
        if let Err(e) = self.stop() {
            error!(error = %e, "broker stop command failed");
        }
        result
    }
}

fn build_command(argv: &[String]) -> Option<Command> {
    let (program, args) = argv.split_first()?;
    let mut command = Command::new(program);
    command.args(args).stdin(Stdio::null()).kill_on_drop(false);
    Some(command)
}
