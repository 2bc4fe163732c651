use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Mutex;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::{Error, Result};

const LINE_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub envs: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl AsRef<Path>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.as_ref().to_path_buf(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// First argument, e.g. `push` for `git push origin main`.
    pub fn verb(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.cwd)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Lines of a running process (stdout and stderr merged, split on `\n` and
/// `\r`) followed by its exit code.
pub struct ProcessStream {
    lines: mpsc::Receiver<String>,
    exit: oneshot::Receiver<Result<Option<i32>>>,
}

impl ProcessStream {
    pub fn new(
        lines: mpsc::Receiver<String>,
        exit: oneshot::Receiver<Result<Option<i32>>>,
    ) -> Self {
        Self { lines, exit }
    }

    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Drains unread lines, then waits for the process to exit.
    pub async fn wait(mut self) -> Result<Option<i32>> {
        while self.lines.recv().await.is_some() {}
        self.exit.await.map_err(|_| Error::Worker {
            message: "process exit status was never reported".to_string(),
        })?
    }
}

pub trait ProcessRunner: Send + Sync {
    fn run<'a>(
        &'a self,
        cmd: &'a CommandSpec,
    ) -> Pin<Box<dyn Future<Output = Result<ProcessOutput>> + Send + 'a>>;

    fn run_streaming<'a>(
        &'a self,
        cmd: &'a CommandSpec,
    ) -> Pin<Box<dyn Future<Output = Result<ProcessStream>> + Send + 'a>>;
}

/// Runs real binaries through `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessRunner;

impl ProcessRunner for SystemProcessRunner {
    fn run<'a>(
        &'a self,
        cmd: &'a CommandSpec,
    ) -> Pin<Box<dyn Future<Output = Result<ProcessOutput>> + Send + 'a>> {
        Box::pin(async move {
            debug!(event = "process.run", command = %cmd.display(), "process.run");
            let output = cmd.command().output().await?;
            Ok(ProcessOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }

    fn run_streaming<'a>(
        &'a self,
        cmd: &'a CommandSpec,
    ) -> Pin<Box<dyn Future<Output = Result<ProcessStream>> + Send + 'a>> {
        Box::pin(async move {
            debug!(event = "process.stream", command = %cmd.display(), "process.stream");
            let mut child = cmd.command().spawn()?;
            let stdout = child.stdout.take().ok_or_else(|| Error::Worker {
                message: "child stdout not captured".to_string(),
            })?;
            let stderr = child.stderr.take().ok_or_else(|| Error::Worker {
                message: "child stderr not captured".to_string(),
            })?;

            let (line_tx, line_rx) = mpsc::channel(LINE_BUFFER);
            let (exit_tx, exit_rx) = oneshot::channel();

            let out_task = tokio::spawn(forward_lines(stdout, line_tx.clone()));
            let err_task = tokio::spawn(forward_lines(stderr, line_tx));

            tokio::spawn(async move {
                let _ = out_task.await;
                let _ = err_task.await;
                let status = child
                    .wait()
                    .await
                    .map(|s| s.code())
                    .map_err(Error::from);
                let _ = exit_tx.send(status);
            });

            Ok(ProcessStream::new(line_rx, exit_rx))
        })
    }
}

/// Forwards complete lines until EOF. Keeps reading after the receiver is
/// gone so the child never blocks on a full pipe.
async fn forward_lines<R>(mut reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    let mut pending = Vec::new();
    let mut open = true;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b != b'\n' && b != b'\r' {
                pending.push(b);
                continue;
            }
            if let Some(line) = take_line(&mut pending)
                && open
                && tx.send(line).await.is_err()
            {
                open = false;
            }
        }
    }

    if let Some(line) = take_line(&mut pending)
        && open
    {
        let _ = tx.send(line).await;
    }
}

fn take_line(pending: &mut Vec<u8>) -> Option<String> {
    if pending.is_empty() {
        return None;
    }
    let line = String::from_utf8_lossy(pending).trim().to_string();
    pending.clear();
    (!line.is_empty()).then_some(line)
}

/// Canned response for [`ScriptedProcessRunner`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptedResponse {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub lines: Vec<String>,
}

impl ScriptedResponse {
    pub fn ok() -> Self {
        Self::exit(0)
    }

    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    pub fn with_stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self
    }

    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = stderr.into();
        self
    }

    pub fn with_lines<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lines = lines.into_iter().map(Into::into).collect();
        self
    }
}

/// In-memory runner: answers by sub-command (`add`, `push`, ...) and records
/// every command it was asked to run. Unscripted commands exit 0.
#[derive(Debug, Default)]
pub struct ScriptedProcessRunner {
    responses: Mutex<HashMap<String, ScriptedResponse>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, verb: impl Into<String>, response: ScriptedResponse) -> Self {
        self.responses
            .lock()
            .expect("scripted runner mutex poisoned")
            .insert(verb.into(), response);
        self
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls
            .lock()
            .expect("scripted runner mutex poisoned")
            .clone()
    }

    pub fn verbs(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter_map(|c| c.verb().map(str::to_string))
            .collect()
    }

    fn answer(&self, cmd: &CommandSpec) -> ScriptedResponse {
        self.calls
            .lock()
            .expect("scripted runner mutex poisoned")
            .push(cmd.clone());
        cmd.verb()
            .and_then(|verb| {
                self.responses
                    .lock()
                    .expect("scripted runner mutex poisoned")
                    .get(verb)
                    .cloned()
            })
            .unwrap_or_else(ScriptedResponse::ok)
    }
}

impl ProcessRunner for ScriptedProcessRunner {
    fn run<'a>(
        &'a self,
        cmd: &'a CommandSpec,
    ) -> Pin<Box<dyn Future<Output = Result<ProcessOutput>> + Send + 'a>> {
        Box::pin(async move {
            let response = self.answer(cmd);
            Ok(ProcessOutput {
                exit_code: response.exit_code,
                stdout: response.stdout,
                stderr: response.stderr,
            })
        })
    }

    fn run_streaming<'a>(
        &'a self,
        cmd: &'a CommandSpec,
    ) -> Pin<Box<dyn Future<Output = Result<ProcessStream>> + Send + 'a>> {
        Box::pin(async move {
            let response = self.answer(cmd);
            let mut lines: Vec<String> = response.lines;
            lines.extend(
                response
                    .stdout
                    .lines()
                    .chain(response.stderr.lines())
                    .map(str::to_string),
            );

            let (line_tx, line_rx) = mpsc::channel(lines.len().max(1));
            for line in lines {
                let _ = line_tx.send(line).await;
            }
            drop(line_tx);

            let (exit_tx, exit_rx) = oneshot::channel();
            let _ = exit_tx.send(Ok(response.exit_code));
            Ok(ProcessStream::new(line_rx, exit_rx))
        })
    }
}
