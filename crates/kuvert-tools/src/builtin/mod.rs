// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod fs;

pub use fs::BuiltinTools;

/// Tool catalogue lines shown to the model, with brief I/O hints.
pub const CATALOG: [&str; 8] = [
    "create_file  -> {path, size, message}",
    "read_file    -> {path, content, size}",
    "edit_file    -> {path, replacements, message}",
    "delete_file  -> {path, message}",
    "list_files   -> {path, files, count}",
    "create_directory -> {path, message}",
    "directory_tree  -> {path, tree}",
    "get_cwd      -> {cwd}",
];
