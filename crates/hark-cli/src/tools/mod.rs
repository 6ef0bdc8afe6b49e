//! Local tools, confined to the project root

mod list;
mod read;
mod search;
mod shell;
mod write;

pub use list::ListDirTool;
pub use read::ReadFileTool;
pub use search::SearchTextTool;
pub use shell::RunShellTool;
pub use write::WriteFileTool;

use hark_agent::tool::BoxedTool;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Resolves tool paths against the project root and rejects escapes.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self {
            root: root.as_ref().canonicalize()?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path for `path`, which may be relative to the root.
    ///
    /// `..` is folded lexically, then the deepest existing ancestor is
    /// canonicalized so a symlink cannot lead outside the root.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let joined = self.root.join(path.trim());
        let mut normalized = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(outside(path));
                    }
                }
                Component::CurDir => {}
                other => normalized.push(other),
            }
        }
        if !normalized.starts_with(&self.root) {
            return Err(outside(path));
        }

        let mut existing = normalized.as_path();
        while !existing.exists() {
            match existing.parent() {
                Some(parent) => existing = parent,
                None => break,
            }
        }
        if let Ok(real) = existing.canonicalize() {
            if !real.starts_with(&self.root) {
                return Err(outside(path));
            }
        }
        Ok(normalized)
    }

    /// `path` relative to the root, for display.
    pub fn display(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.display().to_string(),
            Err(_) => path.display().to_string(),
        }
    }
}

fn outside(path: &str) -> String {
    format!("Ruta fuera del directorio permitido: {}", path)
}

/// Keep the last `max` characters of `text`.
pub(crate) fn tail_chars(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    text.chars().skip(count - max).collect()
}

/// Every local tool, sharing one sandbox.
pub fn local_tools(sandbox: Arc<Sandbox>, allow_shell: bool) -> Vec<BoxedTool> {
    vec![
        Arc::new(RunShellTool::new(sandbox.clone(), allow_shell)),
        Arc::new(ReadFileTool::new(sandbox.clone())),
        Arc::new(WriteFileTool::new(sandbox.clone())),
        Arc::new(ListDirTool::new(sandbox.clone())),
        Arc::new(SearchTextTool::new(sandbox)),
    ]
}

#[cfg(test)]
pub(crate) fn test_sandbox() -> (tempfile::TempDir, Arc<Sandbox>) {
    let dir = tempfile::tempdir().unwrap();
    let sandbox = Arc::new(Sandbox::new(dir.path()).unwrap());
    (dir, sandbox)
}
