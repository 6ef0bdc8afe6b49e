//! Regex text search tool

use async_trait::async_trait;
use hark_agent::tool::{Tool, ToolResult};
use regex::Regex;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::Sandbox;

const MAX_MATCHES: usize = 100;
const MAX_LINE_CHARS: usize = 300;
const MAX_FILE_BYTES: u64 = 2 * 1024 * 1024;
const SKIPPED_DIRS: &[&str] = &["node_modules", "target", "__pycache__", "venv"];

/// Searches files under the project root, answering `path:line: text`
pub struct SearchTextTool {
    sandbox: Arc<Sandbox>,
}

impl SearchTextTool {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for SearchTextTool {
    fn name(&self) -> &str {
        "search_text"
    }

    fn description(&self) -> &str {
        "Busca texto en archivos del proyecto con una expresión regular. Devuelve líneas 'ruta:línea: texto'."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Expresión regular a buscar"
                },
                "path": {
                    "type": "string",
                    "description": "Archivo o directorio donde buscar (por defecto '.')"
                }
            },
            "required": ["pattern"]
        })
    }

    fn describe_action(&self, arguments: &serde_json::Value) -> String {
        let pattern = arguments
            .get("pattern")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        format!("Buscar texto: {}", pattern)
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolResult {
        let pattern = match arguments.get("pattern").and_then(|v| v.as_str()) {
            Some(p) => p,
            None => return ToolResult::error("Falta el argumento 'pattern'"),
        };
        let regex = match Regex::new(pattern) {
            Ok(r) => r,
            Err(e) => return ToolResult::error(format!("Expresión regular inválida: {}", e)),
        };
        let start = match self
            .sandbox
            .resolve(arguments.get("path").and_then(|v| v.as_str()).unwrap_or("."))
        {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };

        let mut files = Vec::new();
        collect_files(&start, &cancel, &mut files);

        let mut matches = Vec::new();
        let mut limited = false;
        'files: for file in files {
            if cancel.is_cancelled() {
                return ToolResult::error("Búsqueda cancelada");
            }
            let Ok(content) = fs::read_to_string(&file) else {
                continue;
            };
            let shown = self.sandbox.display(&file);
            for (i, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    if matches.len() >= MAX_MATCHES {
                        limited = true;
                        break 'files;
                    }
                    matches.push(format!("{}:{}: {}", shown, i + 1, truncate_line(line)));
                }
            }
        }

        if matches.is_empty() {
            return ToolResult::text("Sin coincidencias");
        }
        let mut output = matches.join("\n");
        if limited {
            output.push_str(&format!("\n\n(primeras {} coincidencias)", MAX_MATCHES));
        }
        ToolResult::text(output)
    }
}

/// Files under `path` in name order, skipping hidden entries and build output.
fn collect_files(path: &Path, cancel: &CancellationToken, files: &mut Vec<PathBuf>) {
    if path.is_file() {
        files.push(path.to_path_buf());
        return;
    }
    let Ok(read_dir) = fs::read_dir(path) else {
        return;
    };
    let mut entries: Vec<_> = read_dir.flatten().collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        if cancel.is_cancelled() {
            return;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_str()) {
            continue;
        }
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            collect_files(&entry.path(), cancel, files);
        } else if file_type.is_file()
            && entry.metadata().map(|m| m.len() <= MAX_FILE_BYTES).unwrap_or(false)
        {
            files.push(entry.path());
        }
    }
}

fn truncate_line(line: &str) -> String {
    let line = line.trim();
    if line.chars().count() > MAX_LINE_CHARS {
        format!("{}...", line.chars().take(MAX_LINE_CHARS).collect::<String>())
    } else {
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_sandbox;

    #[tokio::test]
    async fn test_finds_matches_with_locations() {
        let (dir, sandbox) = test_sandbox();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "fn a() {}\n// TODO: b\nfn c() {}\n").unwrap();
        std::fs::write(dir.path().join("notes.md"), "TODO: c\n").unwrap();
        let tool = SearchTextTool::new(sandbox);

        let result = tool
            .execute("1", json!({"pattern": "TODO"}), CancellationToken::new())
            .await;
        assert_eq!(
            result.text_content(),
            "notes.md:1: TODO: c\nsrc/lib.rs:2: // TODO: b"
        );
    }

    #[tokio::test]
    async fn test_skips_hidden_and_build_dirs() {
        let (dir, sandbox) = test_sandbox();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::create_dir(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join(".git/config"), "needle").unwrap();
        std::fs::write(dir.path().join("target/out"), "needle").unwrap();
        let tool = SearchTextTool::new(sandbox);

        let result = tool
            .execute("1", json!({"pattern": "needle"}), CancellationToken::new())
            .await;
        assert_eq!(result.text_content(), "Sin coincidencias");
    }

    #[tokio::test]
    async fn test_match_limit() {
        let (dir, sandbox) = test_sandbox();
        let body = "x\n".repeat(MAX_MATCHES + 10);
        std::fs::write(dir.path().join("many.txt"), body).unwrap();
        let tool = SearchTextTool::new(sandbox);

        let result = tool
            .execute("1", json!({"pattern": "^x$"}), CancellationToken::new())
            .await;
        let text = result.text_content();
        assert_eq!(text.lines().filter(|l| l.starts_with("many.txt:")).count(), MAX_MATCHES);
        assert!(text.ends_with("(primeras 100 coincidencias)"));
    }

    #[tokio::test]
    async fn test_invalid_regex() {
        let (_dir, sandbox) = test_sandbox();
        let tool = SearchTextTool::new(sandbox);
        let result = tool
            .execute("1", json!({"pattern": "("}), CancellationToken::new())
            .await;
        assert!(result.is_error);
    }
}
