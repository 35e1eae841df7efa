//! Codebase context for the system prompt.
//!
//! Walks the project in sorted order and renders text files as
//! `<file path="...">` blocks until a file-count or byte budget runs out.

use std::path::Path;

const SKIP_DIRS: &[&str] = &["node_modules", "target", "dist", "build"];

/// Bytes sniffed for NUL when deciding whether a file is binary.
const BINARY_SNIFF_BYTES: usize = 8000;

/// Limits on how much of the project goes into the prompt.
#[derive(Debug, Clone, Copy)]
pub struct ContextLimits {
    pub max_files: usize,
    pub max_bytes: usize,
}

/// Render the project at `root` as `<file>` blocks.
///
/// Files that would push the total past `max_bytes` are skipped; the walk
/// stops once `max_files` files are included.
pub fn codebase_context(root: &Path, limits: ContextLimits) -> String {
    let mut files = Vec::new();
    collect_files(root, root, &mut files);

    let mut out = String::new();
    let mut included = 0usize;
    for rel in files {
        if included >= limits.max_files {
            break;
        }
        let Ok(bytes) = std::fs::read(root.join(&rel)) else {
            continue;
        };
        if is_binary(&bytes) {
            continue;
        }
        let Ok(content) = String::from_utf8(bytes) else {
            continue;
        };
        let block = format!("<file path=\"{rel}\">\n{content}\n</file>\n");
        if out.len() + block.len() > limits.max_bytes {
            continue;
        }
        out.push_str(&block);
        included += 1;
    }

    tracing::debug!(files = included, bytes = out.len(), "built codebase context");
    out
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = read_dir.filter_map(Result::ok).collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let path = entry.path();
        if file_type.is_dir() {
            if !SKIP_DIRS.contains(&name.as_str()) {
                collect_files(root, &path, out);
            }
        } else if file_type.is_file() {
            if let Ok(rel) = path.strip_prefix(root) {
                let rel: Vec<String> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                out.push(rel.join("/"));
            }
        }
    }
}

fn is_binary(bytes: &[u8]) -> bool {
    bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0)
}
