//! Shell command tool

use async_trait::async_trait;
use hark_agent::tool::{Tool, ToolResult};
use serde_json::json;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{Sandbox, tail_chars};

/// stdout and stderr keep only their last this many characters
const MAX_STREAM_CHARS: usize = 4000;
const DEFAULT_TIMEOUT_S: u64 = 60;
const MAX_TIMEOUT_S: u64 = 300;

/// Runs `sh -c` in the project root
pub struct RunShellTool {
    sandbox: Arc<Sandbox>,
    enabled: bool,
}

impl RunShellTool {
    pub fn new(sandbox: Arc<Sandbox>, enabled: bool) -> Self {
        Self { sandbox, enabled }
    }
}

#[async_trait]
impl Tool for RunShellTool {
    fn name(&self) -> &str {
        "run_shell"
    }

    fn description(&self) -> &str {
        "Ejecuta un comando de shell en el proyecto. Devuelve JSON con ok, returncode, stdout y stderr."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Comando a ejecutar con sh -c"
                },
                "timeout_s": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Tiempo límite en segundos (por defecto 60)"
                }
            },
            "required": ["command"]
        })
    }

    // The command carries its own deadline and reports it as a timeout;
    // this only has to outlast it.
    fn timeout(&self) -> Duration {
        Duration::from_secs(MAX_TIMEOUT_S + 5)
    }

    fn describe_action(&self, arguments: &serde_json::Value) -> String {
        let command = arguments
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        format!("Ejecutar comando en la terminal: {}", command)
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolResult {
        if !self.enabled {
            return ToolResult::error("Ejecución de shell deshabilitada");
        }
        let command = match arguments.get("command").and_then(|v| v.as_str()) {
            Some(c) if !c.trim().is_empty() => c,
            _ => return ToolResult::error("Falta el argumento 'command'"),
        };
        let timeout_secs = arguments
            .get("timeout_s")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_S)
            .clamp(1, MAX_TIMEOUT_S);

        let child = match Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(self.sandbox.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("No se pudo iniciar el comando: {}", e)),
        };

        tracing::debug!(command, timeout_secs, "running shell command");
        // Dropping the output future drops the child, which kills it.
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return ToolResult::error("Comando cancelado"),
            _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => {
                return ToolResult::timed_out(
                    Duration::from_secs(timeout_secs),
                    format!("El comando superó el tiempo límite de {} s", timeout_secs),
                );
            }
            output = child.wait_with_output() => output,
        };
        let output = match output {
            Ok(o) => o,
            Err(e) => return ToolResult::error(format!("Error esperando el comando: {}", e)),
        };

        let returncode = output.status.code().unwrap_or(-1);
        let ok = output.status.success();
        let payload = json!({
            "ok": ok,
            "returncode": returncode,
            "stdout": tail_chars(&String::from_utf8_lossy(&output.stdout), MAX_STREAM_CHARS),
            "stderr": tail_chars(&String::from_utf8_lossy(&output.stderr), MAX_STREAM_CHARS),
        });
        if ok {
            ToolResult::text(payload.to_string())
        } else {
            ToolResult::error(payload.to_string())
        }
    }
}
