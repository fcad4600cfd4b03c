//! Stdio transport to one add-on process.
//!
//! The transport owns the child process and its three streams for its whole
//! lifetime. Requests are strictly one at a time: callers hold `&mut self`
//! for the duration of an exchange.

use std::panic::{self, AssertUnwindSafe};
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::AddonError;
use super::descriptor::LaunchDescriptor;
use super::protocol::{RpcRequest, parse_response};

/// Suppresses the console window for child processes on Windows.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Live connection to an add-on process.
pub struct RpcTransport {
    /// Add-on id, for diagnostics.
    addon_id: String,
    /// Child process handle.
    child: Option<Child>,
    /// OS process id, captured at spawn.
    pid: Option<u32>,
    /// Request stream.
    stdin: Option<ChildStdin>,
    /// Response stream, split into lines.
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    /// Diagnostic stream, handed to the stderr pump.
    stderr: Option<ChildStderr>,
    /// Set once the process has been observed to exit.
    exited: bool,
    /// Set after any failed exchange; the stream may be out of step.
    poisoned: bool,
}

impl RpcTransport {
    /// Starts the add-on process described by `descriptor`.
    pub fn spawn(descriptor: &LaunchDescriptor) -> Result<Self, AddonError> {
        let program = descriptor.file_name.display().to_string();

        let mut cmd = Command::new(&descriptor.file_name);
        cmd.args(&descriptor.arguments)
            .current_dir(&descriptor.working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so the whole tree can be signalled at once.
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd
            .spawn()
            .map_err(|source| AddonError::Spawn {
                program: program.clone(),
                source,
            })?;
        let pid = child.id();

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            if let Some(pid) = pid {
                kill_process_tree(pid);
            }
            let _ = child.start_kill();
            return Err(AddonError::Spawn {
                program,
                source: std::io::Error::other("stdio streams are not piped"),
            });
        };

        debug!(
            addon = %descriptor.addon_id,
            pid = ?pid,
            "Spawned add-on process {} {:?}",
            program,
            descriptor.arguments
        );

        Ok(Self {
            addon_id: descriptor.addon_id.clone(),
            child: Some(child),
            pid,
            stdin: Some(stdin),
            stdout: Some(BufReader::new(stdout).lines()),
            stderr: Some(stderr),
            exited: false,
            poisoned: false,
        })
    }

    /// Sends one request and waits up to `timeout` for its response.
    ///
    /// A timeout leaves the process running. Any failure other than an
    /// error response from the add-on poisons the transport, because a late
    /// or mismatched line may still be sitting in the stream.
    pub async fn invoke(
        &mut self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, AddonError> {
        if self.poisoned {
            return Err(AddonError::TransportPoisoned);
        }

        let result = self.exchange(method, params, timeout).await;
        if let Err(ref e) = result {
            if e.is_transport_failure() {
                self.poisoned = true;
            }
        }
        result
    }

    async fn exchange(
        &mut self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, AddonError> {
        let request = RpcRequest::new(method, params);
        let mut payload = serde_json::to_string(&request)?;
        payload.push('\n');

        debug!(addon = %self.addon_id, id = %request.id, "-> {}", method);

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| AddonError::Protocol("stdin is closed".to_string()))?;
        stdin.write_all(payload.as_bytes()).await?;
        stdin.flush().await?;

        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| AddonError::Protocol("stdout is closed".to_string()))?;

        // `next_line` is cancel safe, so an expired timer loses no data.
        let line = match tokio::time::timeout(timeout, stdout.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                return Err(AddonError::Protocol(
                    "add-on closed its output before answering".to_string(),
                ));
            }
            Ok(Err(e)) => return Err(AddonError::Io(e)),
            Err(_) => {
                return Err(AddonError::Timeout {
                    method: method.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        };

        debug!(addon = %self.addon_id, id = %request.id, "<- {} bytes", line.len());
        parse_response(&line, &request.id)
    }

    /// Starts forwarding stderr lines to `on_line` in the background.
    ///
    /// Returns `None` if the pump was already started. The pump ends when
    /// the process closes stderr or `cancel` fires.
    pub fn start_stderr_pump<F>(
        &mut self,
        mut on_line: F,
        cancel: CancellationToken,
    ) -> Option<StderrPump>
    where
        F: FnMut(String) + Send + 'static,
    {
        let stderr = self.stderr.take()?;
        let addon_id = self.addon_id.clone();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => break,
                    next = lines.next_line() => next,
                };

                match next {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if panic::catch_unwind(AssertUnwindSafe(|| on_line(line))).is_err() {
                            warn!(addon = %addon_id, "Stderr callback panicked, line dropped");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!(addon = %addon_id, "Stderr read failed: {}", e);
                        break;
                    }
                }
            }
            debug!(addon = %addon_id, "Stderr pump finished");
        });

        Some(StderrPump { cancel, handle })
    }

    /// Returns true if the process is gone.
    pub fn has_exited(&mut self) -> bool {
        if self.exited {
            return true;
        }
        let exited = match self.child.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => true,
        };
        self.exited = exited;
        exited
    }

    /// Returns true if an earlier failure made the transport unusable.
    #[must_use]
    pub const fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// OS process id.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Add-on id this transport talks to.
    #[must_use]
    pub fn addon_id(&self) -> &str {
        &self.addon_id
    }

    /// Closes the streams, kills the process tree and reaps the child.
    ///
    /// Safe to call more than once.
    pub async fn dispose(&mut self) {
        self.poisoned = true;
        self.stdin.take();
        self.stdout.take();
        self.stderr.take();

        let Some(mut child) = self.child.take() else {
            return;
        };

        if !self.has_exited_child(&mut child) {
            if let Some(pid) = self.pid {
                kill_process_tree(pid);
            }
            let _ = child.start_kill();
        }
        match child.wait().await {
            Ok(status) => debug!(addon = %self.addon_id, "Add-on process exited: {}", status),
            Err(e) => debug!(addon = %self.addon_id, "Failed to reap add-on process: {}", e),
        }
        self.exited = true;
    }

    fn has_exited_child(&mut self, child: &mut Child) -> bool {
        if !self.exited {
            self.exited = !matches!(child.try_wait(), Ok(None));
        }
        self.exited
    }
}

impl Drop for RpcTransport {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if !self.has_exited_child(&mut child) {
                if let Some(pid) = self.pid {
                    kill_process_tree(pid);
                }
                let _ = child.start_kill();
            }
        }
    }
}

/// Handle to a running stderr pump.
pub struct StderrPump {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl StderrPump {
    /// Signals the pump to stop and waits for it to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                warn!("Stderr pump panicked: {}", e);
            }
        }
    }

    /// Waits up to `grace` for the pump to reach end of stream on its own,
    /// then cancels it.
    pub async fn drain(mut self, grace: Duration) {
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if e.is_panic() {
                    warn!("Stderr pump panicked: {}", e);
                }
            }
            Err(_) => self.shutdown().await,
        }
    }

    /// Returns true once the pump task has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Kills the process and everything it started.
#[cfg(unix)]
fn kill_process_tree(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    if let Ok(raw) = i32::try_from(pid) {
        let _ = killpg(Pid::from_raw(raw), Signal::SIGKILL);
    }
}

/// Kills the process and everything it started.
#[cfg(windows)]
fn kill_process_tree(pid: u32) {
    use std::os::windows::process::CommandExt;

    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .creation_flags(CREATE_NO_WINDOW)
        .status();
}

#[cfg(not(any(unix, windows)))]
fn kill_process_tree(_pid: u32) {}
