//! Bridge transport over a child process's stdin/stdout

use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::BridgeTransport;
use super::protocol::BridgeRequest;

const MAX_LINE_BYTES: usize = 1024 * 1024;

struct BridgeProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Spawns the bridge lazily on first use and respawns it after `reset`.
pub struct StdioTransport {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    process: Mutex<Option<BridgeProcess>>,
}

impl StdioTransport {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            envs: Vec::new(),
            process: Mutex::new(None),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn spawn(&self) -> io::Result<BridgeProcess> {
        tracing::info!(program = %self.program, "starting skill bridge");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("bridge stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("bridge stdout not piped"))?;

        Ok(BridgeProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }
}

#[async_trait]
impl BridgeTransport for StdioTransport {
    async fn exchange(&self, request: &BridgeRequest) -> io::Result<String> {
        let mut guard = self.process.lock().await;
        if guard.is_none() {
            *guard = Some(self.spawn()?);
        }
        let Some(process) = guard.as_mut() else {
            return Err(io::Error::other("bridge process missing"));
        };

        let line = request.to_line().map_err(io::Error::other)?;
        process.stdin.write_all(line.as_bytes()).await?;
        process.stdin.flush().await?;

        loop {
            let mut response = String::new();
            let n = process.stdout.read_line(&mut response).await?;
            if n == 0 {
                *guard = None;
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "skill bridge closed its output",
                ));
            }
            if response.len() > MAX_LINE_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "skill bridge response too large",
                ));
            }

            // Responses to requests abandoned after a timeout may still be
            // in the pipe; skip anything carrying another id.
            let id = serde_json::from_str::<serde_json::Value>(&response)
                .ok()
                .and_then(|v| v.get("id").and_then(|id| id.as_u64()));
            match id {
                Some(id) if id != request.id => {
                    tracing::debug!(expected = request.id, got = id, "skipping stale bridge response");
                }
                _ => return Ok(response.trim_end().to_string()),
            }
        }
    }

    async fn reset(&self) {
        if let Some(mut process) = self.process.lock().await.take() {
            tracing::debug!("stopping skill bridge process");
            let _ = process.child.start_kill();
        }
    }
}
