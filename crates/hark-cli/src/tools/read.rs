//! File reading tool

use async_trait::async_trait;
use hark_agent::tool::{Tool, ToolResult};
use serde_json::json;
use std::sync::Arc;
use tokio::fs;
use tokio_util::sync::CancellationToken;

use super::Sandbox;

const MAX_LINES: usize = 2000;
const MAX_LINE_CHARS: usize = 2000;

/// Reads a text file under the project root
pub struct ReadFileTool {
    sandbox: Arc<Sandbox>,
}

impl ReadFileTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Lee un archivo del proyecto."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Ruta relativa a la raíz del proyecto"
                }
            },
            "required": ["path"]
        })
    }

    fn describe_action(&self, arguments: &serde_json::Value) -> String {
        let path = arguments
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        format!("Leer el archivo: {}", path)
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolResult {
        let path_str = match arguments.get("path").and_then(|v| v.as_str()) {
            Some(p) => p,
            None => return ToolResult::error("Falta el argumento 'path'"),
        };
        let path = match self.sandbox.resolve(path_str) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };

        if cancel.is_cancelled() {
            return ToolResult::error("Operación cancelada");
        }

        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("No se pudo leer el archivo: {}", e)),
        };

        let total_lines = content.lines().count();
        let mut truncated_lines = false;
        let mut output = content
            .lines()
            .take(MAX_LINES)
            .map(|line| {
                if line.chars().count() > MAX_LINE_CHARS {
                    truncated_lines = true;
                    line.chars().take(MAX_LINE_CHARS).collect()
                } else {
                    line.to_string()
                }
            })
            .collect::<Vec<String>>()
            .join("\n");

        let mut notices = Vec::new();
        if truncated_lines {
            notices.push(format!("líneas recortadas a {} caracteres", MAX_LINE_CHARS));
        }
        if total_lines > MAX_LINES {
            notices.push(format!("{} líneas más sin mostrar", total_lines - MAX_LINES));
        }
        if !notices.is_empty() {
            output.push_str(&format!("\n\n... ({})", notices.join("; ")));
        }

        ToolResult::text(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_sandbox;

    #[tokio::test]
    async fn test_reads_file() {
        let (dir, sandbox) = test_sandbox();
        std::fs::write(dir.path().join("notes.txt"), "hola\nmundo\n").unwrap();
        let tool = ReadFileTool::new(sandbox);

        let result = tool
            .execute("1", json!({"path": "notes.txt"}), CancellationToken::new())
            .await;
        assert!(!result.is_error);
        assert_eq!(result.text_content(), "hola\nmundo");
    }

    #[tokio::test]
    async fn test_long_file_is_truncated() {
        let (dir, sandbox) = test_sandbox();
        let body: String = (0..MAX_LINES + 5).map(|i| format!("{}\n", i)).collect();
        std::fs::write(dir.path().join("big.txt"), body).unwrap();
        let tool = ReadFileTool::new(sandbox);

        let result = tool
            .execute("1", json!({"path": "big.txt"}), CancellationToken::new())
            .await;
        assert!(result.text_content().ends_with("(5 líneas más sin mostrar)"));
    }

    #[tokio::test]
    async fn test_outside_root_rejected() {
        let (_dir, sandbox) = test_sandbox();
        let tool = ReadFileTool::new(sandbox);
        let result = tool
            .execute("1", json!({"path": "../../etc/passwd"}), CancellationToken::new())
            .await;
        assert!(result.is_error);
        assert!(result.text_content().contains("fuera del directorio"));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let (_dir, sandbox) = test_sandbox();
        let tool = ReadFileTool::new(sandbox);
        let result = tool
            .execute("1", json!({"path": "nope.txt"}), CancellationToken::new())
            .await;
        assert!(result.is_error);
    }
}
