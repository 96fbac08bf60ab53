// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod edit;
mod find;
mod glob;
mod grep;
mod multi_edit;
mod read;
mod shell;
mod think;
mod undo_edit;
mod web_fetch;
mod web_search;

pub use edit::EditTool;
pub use find::FindTool;
pub use glob::GlobTool;
pub use grep::GrepTool;
pub use multi_edit::MultiEditTool;
pub use read::ReadTool;
pub use shell::ShellTool;
pub use think::ThinkTool;
pub use undo_edit::UndoEditTool;
pub use web_fetch::WebFetchTool;
pub use web_search::WebSearchTool;

use std::path::{Path, PathBuf};

/// Resolve a tool-supplied path against the workspace root.
pub(crate) fn resolve_path(workspace_root: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        workspace_root.join(p)
    }
}
