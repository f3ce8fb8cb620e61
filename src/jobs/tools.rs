//! External diagnostic tools run by the job queue.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How long to wait for buffered output after the process has exited.
const READ_GRACE: Duration = Duration::from_secs(2);

/// Tool error types.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{0} is not available on this host")]
    Unavailable(String),
    #[error("no program given")]
    MissingProgram,
    #[error("{0} is not on the exec allow-list")]
    NotAllowed(String),
    #[error("failed to start {0}")]
    Spawn(String),
    #[error("i/o error: {0}")]
    Io(String),
}

/// Supported tool kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Nmap,
    Openssl,
    Busybox,
    Msfconsole,
    /// The first argument names the program, which must be allow-listed.
    Exec,
}

impl ToolKind {
    /// Binary to run, or `None` when the program comes from the arguments.
    pub fn program(self) -> Option<&'static str> {
        match self {
            ToolKind::Nmap => Some("nmap"),
            ToolKind::Openssl => Some("openssl"),
            ToolKind::Busybox => Some("busybox"),
            ToolKind::Msfconsole => Some("msfconsole"),
            ToolKind::Exec => None,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ToolKind::Nmap => "Nmap",
            ToolKind::Openssl => "OpenSSL",
            ToolKind::Busybox => "BusyBox",
            ToolKind::Msfconsole => "Metasploit",
            ToolKind::Exec => "Command",
        }
    }
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Captured result of one tool run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed or died from a signal.
    pub exit_code: Option<i32>,
    pub cancelled: bool,
}

impl ToolOutput {
    pub fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        !self.cancelled && self.exit_code == Some(0)
    }

    /// Stdout followed by any stderr, prefixed with `Error: `.
    pub fn merged(&self) -> String {
        let mut merged = self.stdout.clone();
        let stderr = self.stderr.trim_end();
        if !stderr.is_empty() {
            if !merged.is_empty() && !merged.ends_with('\n') {
                merged.push('\n');
            }
            merged.push_str("Error: ");
            merged.push_str(stderr);
        }
        merged
    }
}

/// One way of running an external diagnostic.
#[async_trait]
pub trait Tool: Send + Sync {
    fn kind(&self) -> ToolKind;

    fn display_name(&self) -> &str;

    fn is_available(&self) -> bool;

    /// Run with `args`. Cancelling `cancel` kills the process.
    async fn execute(&self, args: &[String], cancel: &CancellationToken) -> Result<ToolOutput, ToolError>;
}

/// Maps a tool kind to the tool that runs it.
pub trait ToolFactory: Send + Sync {
    fn tool(&self, kind: ToolKind) -> Arc<dyn Tool>;
}

/// Factory producing tools backed by local processes.
///
/// `Exec` only runs program names listed in `exec_allow`; with an empty list
/// it is unavailable.
#[derive(Debug, Clone, Default)]
pub struct SystemToolFactory {
    exec_allow: Arc<Vec<String>>,
}

impl SystemToolFactory {
    pub fn new(exec_allow: Vec<String>) -> Self {
        Self {
            exec_allow: Arc::new(exec_allow),
        }
    }
}

impl ToolFactory for SystemToolFactory {
    fn tool(&self, kind: ToolKind) -> Arc<dyn Tool> {
        Arc::new(ProcessTool::new(kind, self.exec_allow.clone()))
    }
}

/// A tool that runs a local binary.
#[derive(Debug, Clone)]
pub struct ProcessTool {
    kind: ToolKind,
    exec_allow: Arc<Vec<String>>,
}

impl ProcessTool {
    pub fn new(kind: ToolKind, exec_allow: Arc<Vec<String>>) -> Self {
        Self { kind, exec_allow }
    }

    fn allows(&self, program: &str) -> bool {
        self.exec_allow.iter().any(|allowed| allowed == program)
    }
}

#[async_trait]
impl Tool for ProcessTool {
    fn kind(&self) -> ToolKind {
        self.kind
    }

    fn display_name(&self) -> &str {
        self.kind.display_name()
    }

    fn is_available(&self) -> bool {
        match self.kind.program() {
            Some(program) => which::which(program).is_ok(),
            None => !self.exec_allow.is_empty(),
        }
    }

    async fn execute(&self, args: &[String], cancel: &CancellationToken) -> Result<ToolOutput, ToolError> {
        match self.kind.program() {
            Some(program) => run_process(program, args, cancel).await,
            None => {
                let (program, rest) = args.split_first().ok_or(ToolError::MissingProgram)?;
                if !self.allows(program) {
                    tracing::warn!("Jobs: refusing to run {:?}, not allow-listed", program);
                    return Err(ToolError::NotAllowed(program.clone()));
                }
                if which::which(program).is_err() {
                    return Err(ToolError::Unavailable(program.clone()));
                }
                run_process(program, rest, cancel).await
            }
        }
    }
}

/// Spawn `program`, capture stdout and stderr separately, and kill it if `cancel` fires.
pub async fn run_process(program: &str, args: &[String], cancel: &CancellationToken) -> Result<ToolOutput, ToolError> {
    if cancel.is_cancelled() {
        return Ok(ToolOutput::cancelled());
    }

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ToolError::Spawn(format!("{}: {}", program, e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ToolError::Io("stdout was not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ToolError::Io("stderr was not captured".to_string()))?;
    let stdout_buf = OutputBuffer::default();
    let stderr_buf = OutputBuffer::default();
    let stdout_task = spawn_reader(stdout, stdout_buf.clone());
    let stderr_task = spawn_reader(stderr, stderr_buf.clone());

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };

    let (exit_code, cancelled) = match waited {
        Some(status) => {
            let status = status.map_err(|e| ToolError::Io(format!("waiting for {}: {}", program, e)))?;
            (status.code(), false)
        }
        None => {
            tracing::info!("Jobs: cancelling {}, killing process", program);
            if let Err(e) = child.start_kill() {
                tracing::warn!("Jobs: failed to kill {}: {}", program, e);
            }
            let _ = child.wait().await;
            (None, true)
        }
    };

    // A grandchild may still hold the pipes; both readers share one deadline.
    let deadline = Instant::now() + READ_GRACE;
    Ok(ToolOutput {
        stdout: collect(stdout_task, &stdout_buf, deadline).await,
        stderr: collect(stderr_task, &stderr_buf, deadline).await,
        exit_code,
        cancelled,
    })
}

/// Bytes read so far from one output stream.
type OutputBuffer = Arc<Mutex<Vec<u8>>>;

fn spawn_reader<R>(mut reader: R, buf: OutputBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => buf.lock().await.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    tracing::debug!("Jobs: output stream ended early: {}", e);
                    break;
                }
            }
        }
    })
}

/// Wait for the reader until `deadline`, then keep whatever it buffered.
async fn collect(mut task: JoinHandle<()>, buf: &OutputBuffer, deadline: Instant) -> String {
    if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
        tracing::debug!("Jobs: output stream still open after exit, keeping buffered output");
        task.abort();
    }
    let bytes = std::mem::take(&mut *buf.lock().await);
    String::from_utf8_lossy(&bytes).into_owned()
}
