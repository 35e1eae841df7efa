//! Built-in project tools.
//!
//! Read-only views of the project tree for the model. Every path is
//! relative to the project root; anything that would escape it is
//! rejected.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;

use super::overlay::project_relative;
use super::tool_executor::{Tool, ToolError};

fn resolve(root: &Path, tool: &str, raw: &str) -> Result<PathBuf, ToolError> {
    let rel = project_relative(raw).ok_or_else(|| ToolError::PathOutsideProject {
        path: raw.to_string(),
    })?;
    if rel.as_os_str().is_empty() && tool.ends_with("read_file") {
        return Err(ToolError::InvalidArguments {
            tool: tool.to_string(),
            reason: "'path' must name a file".into(),
        });
    }
    Ok(root.join(rel))
}

fn str_arg<'a>(args: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

// ─── project.read_file ──────────────────────────────────────────────────────

/// `project.read_file {path}`: file contents as text.
pub struct ReadFileTool {
    root: PathBuf,
}

impl ReadFileTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "project.read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the project. Paths are relative to the project root."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path relative to the project root"}
            },
            "required": ["path"]
        })
    }

    async fn call(&self, args: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let raw = str_arg(&args, "path").ok_or_else(|| ToolError::InvalidArguments {
            tool: self.name().to_string(),
            reason: "missing string field 'path'".into(),
        })?;
        let path = resolve(&self.root, self.name(), raw)?;
        let bytes = tokio::fs::read(&path).await?;
        let content = String::from_utf8(bytes).map_err(|_| ToolError::Failed {
            reason: format!("{raw} is not a UTF-8 text file"),
        })?;
        Ok(serde_json::Value::String(content))
    }
}

// ─── project.list_directory ─────────────────────────────────────────────────

/// `project.list_directory {path?}`: one entry per line, directories
/// suffixed with `/`.
pub struct ListDirectoryTool {
    root: PathBuf,
}

impl ListDirectoryTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "project.list_directory"
    }

    fn description(&self) -> &str {
        "List the entries of a project directory. Defaults to the project root."
    }

    fn parameters(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory relative to the project root"}
            }
        })
    }

    async fn call(&self, args: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let raw = str_arg(&args, "path").unwrap_or(".");
        let dir = resolve(&self.root, self.name(), raw)?;

        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                entries.push(format!("{name}/"));
            } else {
                entries.push(format!("{name} ({} bytes)", meta.len()));
            }
        }
        entries.sort();

        if entries.is_empty() {
            return Ok(json!("Directory is empty."));
        }
        Ok(serde_json::Value::String(entries.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.ts"), "export const a = 1;\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "hi").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_read_file() {
        let dir = project();
        let tool = ReadFileTool::new(dir.path());
        let out = tool.call(json!({"path": "src/a.ts"})).await.unwrap();
        assert_eq!(out, json!("export const a = 1;\n"));
    }

    #[tokio::test]
    async fn test_read_file_rejects_escape() {
        let dir = project();
        let tool = ReadFileTool::new(dir.path());
        let err = tool.call(json!({"path": "../etc/passwd"})).await.unwrap_err();
        assert!(matches!(err, ToolError::PathOutsideProject { .. }));
        let err = tool.call(json!({"path": "/etc/passwd"})).await.unwrap_err();
        assert!(matches!(err, ToolError::PathOutsideProject { .. }));
    }

    #[tokio::test]
    async fn test_read_file_missing_arg() {
        let dir = project();
        let err = ReadFileTool::new(dir.path())
            .call(json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn test_list_directory_root() {
        let dir = project();
        let out = ListDirectoryTool::new(dir.path())
            .call(json!({}))
            .await
            .unwrap();
        assert_eq!(out, json!("README.md (2 bytes)\nsrc/"));
    }

    #[tokio::test]
    async fn test_list_directory_missing_dir_is_io_error() {
        let dir = project();
        let err = ListDirectoryTool::new(dir.path())
            .call(json!({"path": "nope"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Io { .. }));
    }
}
