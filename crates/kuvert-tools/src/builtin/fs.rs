// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Built-in file tools: the zero-dependency backend used when no MCP server
//! is configured.  Every operation returns a `{success, …, error?}` value;
//! errors are data, not panics.

use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::debug;

const DEFAULT_TREE_DEPTH: u64 = 3;

/// Local file operations rooted at a working directory.
#[derive(Debug, Clone, Default)]
pub struct BuiltinTools {
    /// Relative paths resolve against this; `None` means the process cwd.
    root: Option<PathBuf>,
}

impl BuiltinTools {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    pub fn tool_names() -> [&'static str; 8] {
        [
            "create_file",
            "read_file",
            "edit_file",
            "delete_file",
            "list_files",
            "create_directory",
            "directory_tree",
            "get_cwd",
        ]
    }

    /// Parameter names each tool understands; extra keys are dropped by the
    /// dispatcher before execution.
    pub fn expected_params(tool: &str) -> Option<&'static [&'static str]> {
        match tool {
            "create_file" => Some(&["path", "content"]),
            "read_file" | "delete_file" | "create_directory" => Some(&["path"]),
            "edit_file" => Some(&["path", "old_string", "new_string"]),
            "list_files" => Some(&["path"]),
            "directory_tree" => Some(&["path", "max_depth"]),
            "get_cwd" => Some(&[]),
            _ => None,
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            return p.to_path_buf();
        }
        match &self.root {
            Some(root) => root.join(p),
            None => p.to_path_buf(),
        }
    }

    pub async fn execute(&self, tool: &str, args: &Value) -> Value {
        debug!(tool, "builtin tool");
        match tool {
            "create_file" => self.create_file(args).await,
            "read_file" => self.read_file(args).await,
            "edit_file" => self.edit_file(args).await,
            "delete_file" => self.delete_file(args).await,
            "list_files" => self.list_files(args).await,
            "create_directory" => self.create_directory(args).await,
            "directory_tree" => self.directory_tree(args),
            "get_cwd" => self.get_cwd(),
            other => failure(format!("Unknown built-in tool: {other}")),
        }
    }

    async fn create_file(&self, args: &Value) -> Value {
        let path = string_arg(args, "path");
        let content = args["content"].as_str().unwrap_or_default();
        let full = self.resolve(&path);

        if let Some(parent) = full.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = tokio::fs::create_dir_all(parent).await {
                    return failure(e.to_string());
                }
            }
        }
        match tokio::fs::write(&full, content).await {
            Ok(()) => json!({
                "success": true,
                "path": path,
                "size": content.len(),
                "message": format!("Created {path} ({} bytes)", content.len()),
            }),
            Err(e) => failure(e.to_string()),
        }
    }

    async fn read_file(&self, args: &Value) -> Value {
        let path = string_arg(args, "path");
        match tokio::fs::read_to_string(self.resolve(&path)).await {
            Ok(content) => json!({
                "success": true,
                "path": path,
                "size": content.len(),
                "content": content,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                failure(format!("File not found: {path}"))
            }
            Err(e) => failure(e.to_string()),
        }
    }

    async fn edit_file(&self, args: &Value) -> Value {
        let path = string_arg(args, "path");
        let old_string = args["old_string"].as_str().unwrap_or_default();
        let new_string = args["new_string"].as_str().unwrap_or_default();
        let full = self.resolve(&path);

        let content = match tokio::fs::read_to_string(&full).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return failure(format!("File not found: {path}"))
            }
            Err(e) => return failure(e.to_string()),
        };

        let replacements = content.matches(old_string).count();
        if old_string.is_empty() || replacements == 0 {
            let preview: String = old_string.chars().take(50).collect();
            return failure(format!("String not found: {preview}..."));
        }

        let new_content = content.replace(old_string, new_string);
        match tokio::fs::write(&full, new_content).await {
            Ok(()) => json!({
                "success": true,
                "path": path,
                "replacements": replacements,
                "message": format!("Replaced {replacements} occurrence(s)"),
            }),
            Err(e) => failure(e.to_string()),
        }
    }

    async fn delete_file(&self, args: &Value) -> Value {
        let path = string_arg(args, "path");
        match tokio::fs::remove_file(self.resolve(&path)).await {
            Ok(()) => json!({
                "success": true,
                "path": path,
                "message": format!("Deleted {path}"),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                failure(format!("File not found: {path}"))
            }
            Err(e) => failure(e.to_string()),
        }
    }

    async fn list_files(&self, args: &Value) -> Value {
        let path = args["path"].as_str().unwrap_or(".").to_string();
        let mut entries = match tokio::fs::read_dir(self.resolve(&path)).await {
            Ok(rd) => rd,
            Err(e) => return failure(e.to_string()),
        };
        let mut files = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => files.push(entry.file_name().to_string_lossy().into_owned()),
                Ok(None) => break,
                Err(e) => return failure(e.to_string()),
            }
        }
        files.sort();
        json!({
            "success": true,
            "path": path,
            "count": files.len(),
            "files": files,
        })
    }

    async fn create_directory(&self, args: &Value) -> Value {
        let path = string_arg(args, "path");
        match tokio::fs::create_dir_all(self.resolve(&path)).await {
            Ok(()) => json!({
                "success": true,
                "path": path,
                "message": format!("Created directory {path}"),
            }),
            Err(e) => failure(e.to_string()),
        }
    }

    fn directory_tree(&self, args: &Value) -> Value {
        let path = args["path"].as_str().unwrap_or(".").to_string();
        let max_depth = args["max_depth"].as_u64().unwrap_or(DEFAULT_TREE_DEPTH) as usize;
        let full = self.resolve(&path);

        let header = full
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());
        let mut lines = vec![header];
        build_tree(&full, 0, max_depth, &mut lines);
        json!({
            "success": true,
            "path": path,
            "tree": lines.join("\n"),
        })
    }

    fn get_cwd(&self) -> Value {
        let cwd = match &self.root {
            Some(root) => root.clone(),
            None => match std::env::current_dir() {
                Ok(d) => d,
                Err(e) => return failure(e.to_string()),
            },
        };
        json!({"success": true, "cwd": cwd.to_string_lossy()})
    }
}

fn string_arg(args: &Value, key: &str) -> String {
    args[key].as_str().unwrap_or_default().to_string()
}

fn failure(error: String) -> Value {
    json!({"success": false, "error": error})
}

/// Depth-first listing, directories first then case-insensitive by name.
/// Unreadable directories are skipped.
fn build_tree(dir: &Path, depth: usize, max_depth: usize, lines: &mut Vec<String>) {
    if depth > max_depth {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut items: Vec<(bool, String, PathBuf)> = entries
        .flatten()
        .map(|e| {
            let is_dir = e.path().is_dir();
            (is_dir, e.file_name().to_string_lossy().into_owned(), e.path())
        })
        .collect();
    items.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then_with(|| a.1.to_lowercase().cmp(&b.1.to_lowercase()))
    });
    for (is_dir, name, path) in items {
        let indent = "  ".repeat(depth);
        let prefix = if is_dir { "[D] " } else { "[F] " };
        lines.push(format!("{indent}{prefix}{name}"));
        if is_dir {
            build_tree(&path, depth + 1, max_depth, lines);
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
