use crate::console::Channel;
use crate::launch::LaunchSpec;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// How long the monitor waits for the pipe readers after the child exits.
/// A grandchild holding the pipes open must not stall the exit event.
pub const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn {executable}: {source}")]
    SpawnFailed {
        executable: PathBuf,
        source: std::io::Error,
    },
    #[error("process is not running")]
    NotRunning,
    #[error("input must be a single line")]
    MultiLine,
    #[error("failed to write to process: {0}")]
    Write(std::io::Error),
    #[error("process did not exit within {0:?}")]
    StopTimeout(Duration),
}

// ---------------------------------------------------------------------------
// Exit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Exit code 0.
    Normal,
    /// Non-zero exit, or killed by something other than us.
    Failed,
    Killed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub reason: ExitReason,
}

impl ExitInfo {
    fn from_status(status: std::io::Result<ExitStatus>, killed: bool) -> Self {
        let code = status.as_ref().ok().and_then(|s| s.code());
        let reason = match status {
            _ if killed => ExitReason::Killed,
            Ok(s) if s.success() => ExitReason::Normal,
            _ => ExitReason::Failed,
        };
        Self { code, reason }
    }

    /// Exit observed without a status, e.g. the output closed first.
    pub fn unknown() -> Self {
        Self {
            code: None,
            reason: ExitReason::Failed,
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.reason, self.code) {
            (ExitReason::Killed, _) => write!(f, "killed"),
            (_, Some(code)) => write!(f, "exit code {code}"),
            (_, None) => write!(f, "terminated by signal"),
        }
    }
}

// ---------------------------------------------------------------------------
// Output stream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum RawOutput {
    Line { channel: Channel, text: String },
    /// Always the last item; sent exactly once.
    Exited(ExitInfo),
}

/// Combined stdout/stderr of one run. Ends after `Exited`.
pub struct OutputStream {
    rx: mpsc::UnboundedReceiver<RawOutput>,
}

impl OutputStream {
    pub async fn next(&mut self) -> Option<RawOutput> {
        self.rx.recv().await
    }
}

// ---------------------------------------------------------------------------
// ProcessHandle
// ---------------------------------------------------------------------------

pub struct ProcessHandle {
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    kill_tx: mpsc::Sender<()>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessHandle {
    /// Spawn one child for `spec`. Dropping the handle kills the child.
    pub fn start(spec: &LaunchSpec) -> Result<(ProcessHandle, OutputStream), ProcessError> {
        let mut cmd = Command::new(spec.executable());
        cmd.args(spec.args())
            .current_dir(spec.working_dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ProcessError::SpawnFailed {
            executable: spec.executable().to_path_buf(),
            source,
        })?;
        let pid = child.id();
        debug!(?pid, command = %spec.display_command(), "spawned server process");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = watch::channel(None);

        let stdin = child.stdin.take();
        let mut copiers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            copiers.push(spawn_line_copier(Channel::Stdout, stdout, out_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            copiers.push(spawn_line_copier(Channel::Stderr, stderr, out_tx.clone()));
        }

        spawn_monitor(child, copiers, kill_rx, out_tx, exit_tx);

        let handle = ProcessHandle {
            pid,
            stdin: Mutex::new(stdin),
            kill_tx,
            exit_rx,
        };
        Ok((handle, OutputStream { rx: out_rx }))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_info().is_some()
    }

    /// Write one line to the child's stdin.
    pub async fn write_line(&self, text: &str) -> Result<(), ProcessError> {
        if text.contains(['\n', '\r']) {
            return Err(ProcessError::MultiLine);
        }
        if self.has_exited() {
            return Err(ProcessError::NotRunning);
        }

        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(ProcessError::NotRunning);
        };

        let mut data = Vec::with_capacity(text.len() + 1);
        data.extend_from_slice(text.as_bytes());
        data.push(b'\n');
        stdin.write_all(&data).await.map_err(ProcessError::Write)?;
        stdin.flush().await.map_err(ProcessError::Write)?;
        Ok(())
    }

    /// Resolves once the child has exited.
    pub async fn wait(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        let waited = rx.wait_for(Option::is_some).await.map(|info| *info);
        match waited {
            Ok(info) => info.unwrap_or_else(ExitInfo::unknown),
            Err(_) => rx.borrow().unwrap_or_else(ExitInfo::unknown),
        }
    }

    /// Send `command` and wait up to `timeout` for the child to exit on its
    /// own. Does not kill on timeout; the caller decides.
    ///
    /// The deadline covers writing the command too: a child that stopped
    /// reading stdin, or a writer stuck on its full pipe, cannot hold the
    /// stop past `timeout`.
    pub async fn request_stop(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<ExitInfo, ProcessError> {
        if let Some(info) = self.exit_info() {
            return Ok(info);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        match tokio::time::timeout_at(deadline, self.write_line(command)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "stop command not delivered"),
            Err(_) => debug!("stop command still blocked at the deadline"),
        }
        tokio::time::timeout_at(deadline, self.wait())
            .await
            .map_err(|_| ProcessError::StopTimeout(timeout))
    }

    /// Kill unconditionally and wait for the exit.
    pub async fn kill(&self) -> ExitInfo {
        // A full channel means a kill is already pending.
        let _ = self.kill_tx.try_send(());
        self.wait().await
    }
}

fn spawn_line_copier(
    channel: Channel,
    reader: impl AsyncRead + Unpin + Send + 'static,
    tx: mpsc::UnboundedSender<RawOutput>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send(RawOutput::Line { channel, text }).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(?channel, error = %e, "output pipe closed");
                    break;
                }
            }
        }
    })
}

fn spawn_monitor(
    mut child: Child,
    copiers: Vec<JoinHandle<()>>,
    mut kill_rx: mpsc::Receiver<()>,
    out_tx: mpsc::UnboundedSender<RawOutput>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) {
    tokio::spawn(async move {
        let mut killed = false;
        let status = tokio::select! {
            status = child.wait() => status,
            // A closed channel means the handle was dropped: same as kill.
            _ = kill_rx.recv() => {
                killed = true;
                if let Err(e) = child.start_kill() {
                    warn!(error = %e, "failed to kill server process");
                }
                child.wait().await
            }
        };
        let info = ExitInfo::from_status(status, killed);

        for mut copier in copiers {
            if tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut copier)
                .await
                .is_err()
            {
                copier.abort();
            }
        }

        debug!(%info, "server process exited");
        let _ = out_tx.send(RawOutput::Exited(info));
        let _ = exit_tx.send(Some(info));
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ServerSection;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// A fake `java` that runs `body` as a shell script.
    fn fake_launch(dir: &Path, body: &str) -> LaunchSpec {
        let script = dir.join("fake-java");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        // Let children forked by parallel tests drop the inherited write fd.
        std::thread::sleep(Duration::from_millis(50));
        let jar = dir.join("server.jar");
        std::fs::write(&jar, b"").unwrap();

        let section = ServerSection {
            java_path: script.to_string_lossy().into_owned(),
            server_jar: jar.to_string_lossy().into_owned(),
            ..ServerSection::default()
        };
        LaunchSpec::from_config(&section).unwrap()
    }

    async fn collect(mut stream: OutputStream) -> (Vec<(Channel, String)>, ExitInfo) {
        let mut lines = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                RawOutput::Line { channel, text } => lines.push((channel, text)),
                RawOutput::Exited(info) => {
                    assert!(stream.next().await.is_none(), "exit must be last");
                    return (lines, info);
                }
            }
        }
        panic!("stream ended without exit event");
    }

    #[tokio::test]
    async fn test_output_lines_and_normal_exit() {
        let dir = tempfile::tempdir().unwrap();
        let spec = fake_launch(dir.path(), "echo out1\necho err1 >&2\necho out2\nexit 0");
        let (_handle, stream) = ProcessHandle::start(&spec).unwrap();

        let (lines, info) = collect(stream).await;
        assert_eq!(info.reason, ExitReason::Normal);
        assert_eq!(info.code, Some(0));

        let stdout: Vec<_> = lines
            .iter()
            .filter(|(c, _)| *c == Channel::Stdout)
            .map(|(_, t)| t.as_str())
            .collect();
        assert_eq!(stdout, vec!["out1", "out2"]);
        assert!(lines.contains(&(Channel::Stderr, "err1".to_string())));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let dir = tempfile::tempdir().unwrap();
        let spec = fake_launch(dir.path(), "exit 3");
        let (_handle, stream) = ProcessHandle::start(&spec).unwrap();

        let (_, info) = collect(stream).await;
        assert_eq!(info.reason, ExitReason::Failed);
        assert_eq!(info.code, Some(3));
    }

    #[tokio::test]
    async fn test_receives_launch_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let spec = fake_launch(dir.path(), r#"echo "$@""#);
        let (_handle, stream) = ProcessHandle::start(&spec).unwrap();

        let (lines, _) = collect(stream).await;
        let args = &lines[0].1;
        assert!(args.starts_with("-Xms1G -Xmx2G"));
        assert!(args.ends_with("nogui"));
    }

    #[tokio::test]
    async fn test_write_line_and_graceful_stop() {
        let dir = tempfile::tempdir().unwrap();
        let spec = fake_launch(
            dir.path(),
            r#"while read line; do
  echo "got $line"
  [ "$line" = "stop" ] && exit 0
done"#,
        );
        let (handle, mut stream) = ProcessHandle::start(&spec).unwrap();

        handle.write_line("list").await.unwrap();
        assert_eq!(
            stream.next().await,
            Some(RawOutput::Line {
                channel: Channel::Stdout,
                text: "got list".to_string()
            })
        );

        let info = handle
            .request_stop("stop", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(info.reason, ExitReason::Normal);
        assert!(matches!(
            handle.write_line("list").await,
            Err(ProcessError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_stop_timeout_then_kill() {
        let dir = tempfile::tempdir().unwrap();
        let spec = fake_launch(dir.path(), "trap '' TERM\nwhile true; do sleep 0.1; done");
        let (handle, stream) = ProcessHandle::start(&spec).unwrap();

        let result = handle
            .request_stop("stop", Duration::from_millis(300))
            .await;
        assert!(matches!(result, Err(ProcessError::StopTimeout(_))));
        assert!(!handle.has_exited());

        let info = handle.kill().await;
        assert_eq!(info.reason, ExitReason::Killed);
        let (_, streamed) = collect(stream).await;
        assert_eq!(streamed, info);
    }

    #[tokio::test]
    async fn test_stop_deadline_covers_blocked_stdin() {
        let dir = tempfile::tempdir().unwrap();
        // Never reads stdin, so the pipe fills and writers block.
        let spec = fake_launch(dir.path(), "exec sleep 1000");
        let (handle, stream) = ProcessHandle::start(&spec).unwrap();
        let handle = std::sync::Arc::new(handle);

        let writer = {
            let handle = handle.clone();
            tokio::spawn(async move {
                let chunk = "x".repeat(4096);
                while handle.write_line(&chunk).await.is_ok() {}
            })
        };
        // Give the writer time to fill the pipe and park holding stdin.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            handle.request_stop("stop", Duration::from_millis(500)),
        )
        .await
        .expect("request_stop must honor its own deadline");
        assert!(matches!(result, Err(ProcessError::StopTimeout(_))));

        let info = handle.kill().await;
        assert_eq!(info.reason, ExitReason::Killed);
        tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .expect("blocked writer fails once the child is gone")
            .unwrap();
        let (_, streamed) = collect(stream).await;
        assert_eq!(streamed, info);
    }

    #[tokio::test]
    async fn test_multiline_input_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let spec = fake_launch(dir.path(), "cat");
        let (handle, _stream) = ProcessHandle::start(&spec).unwrap();
        assert!(matches!(
            handle.write_line("say a\nop me").await,
            Err(ProcessError::MultiLine)
        ));
        handle.kill().await;
    }

    #[test]
    fn test_exit_info_display() {
        let killed = ExitInfo {
            code: None,
            reason: ExitReason::Killed,
        };
        let failed = ExitInfo {
            code: Some(1),
            reason: ExitReason::Failed,
        };
        assert_eq!(killed.to_string(), "killed");
        assert_eq!(failed.to_string(), "exit code 1");
        assert_eq!(ExitInfo::unknown().to_string(), "terminated by signal");
    }
}
