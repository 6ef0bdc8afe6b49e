//! File writing tool

use async_trait::async_trait;
use hark_agent::tool::{Tool, ToolResult};
use serde_json::json;
use std::sync::Arc;
use tokio::fs;
use tokio_util::sync::CancellationToken;

use super::Sandbox;

/// Creates or overwrites a file under the project root
pub struct WriteFileTool {
    sandbox: Arc<Sandbox>,
}

impl WriteFileTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Escribe o crea un archivo dentro del proyecto. Crea los directorios que falten."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Ruta relativa a la raíz del proyecto"
                },
                "content": {
                    "type": "string",
                    "description": "Contenido completo del archivo"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn describe_action(&self, arguments: &serde_json::Value) -> String {
        let path = arguments
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        format!("Escribir el archivo: {}", path)
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
        let content = match arguments.get("content").and_then(|v| v.as_str()) {
            Some(c) => c,
            None => return ToolResult::error("Falta el argumento 'content'"),
        };
        let path = match self.sandbox.resolve(path_str) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };
        if path == self.sandbox.root() {
            return ToolResult::error("La ruta apunta a la raíz del proyecto");
        }

        if cancel.is_cancelled() {
            return ToolResult::error("Operación cancelada");
        }

        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                return ToolResult::error(format!("No se pudo crear el directorio: {}", e));
            }
        }

        match fs::write(&path, content).await {
            Ok(()) => {
                tracing::debug!(path = %path.display(), bytes = content.len(), "file written");
                ToolResult::text(format!(
                    "Escritos {} bytes en {}",
                    content.len(),
                    self.sandbox.display(&path)
                ))
            }
            Err(e) => ToolResult::error(format!("No se pudo escribir el archivo: {}", e)),
        }
    }
}
