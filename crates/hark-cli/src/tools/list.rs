//! Directory listing tool

use async_trait::async_trait;
use hark_agent::tool::{Tool, ToolResult};
use serde_json::json;
use std::fs;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::Sandbox;

const MAX_ENTRIES: usize = 500;

/// Lists one directory under the project root as a JSON array of names
pub struct ListDirTool {
    sandbox: Arc<Sandbox>,
}

impl ListDirTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "Lista archivos en un directorio del proyecto. Los directorios terminan en '/'."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directorio relativo a la raíz del proyecto (por defecto '.')"
                }
            }
        })
    }

    fn describe_action(&self, arguments: &serde_json::Value) -> String {
        let path = arguments
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or(".");
        format!("Listar el directorio: {}", path)
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolResult {
        let path_str = arguments
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or(".");
        let path = match self.sandbox.resolve(path_str) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };
        if !path.is_dir() {
            return ToolResult::error(format!("No es un directorio: {}", path_str));
        }

        let read_dir = match fs::read_dir(&path) {
            Ok(d) => d,
            Err(e) => return ToolResult::error(format!("No se pudo leer el directorio: {}", e)),
        };

        let mut names = Vec::new();
        for entry in read_dir.flatten() {
            if cancel.is_cancelled() {
                return ToolResult::error("Operación cancelada");
            }
            let mut name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();

        let total = names.len();
        names.truncate(MAX_ENTRIES);
        let mut output = serde_json::Value::from(names).to_string();
        if total > MAX_ENTRIES {
            output.push_str(&format!("\n\n(mostrando {} de {} entradas)", MAX_ENTRIES, total));
        }
        ToolResult::text(output)
    }
}
