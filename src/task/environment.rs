//! Environment details appended to every user turn.
//!
//! Gives the model the facts it cannot see in the conversation: the time, the workspace,
//! the active mode and what the task has spent so far.

use std::path::Path;

use super::Mode;
use crate::cost::TokenUsage;

/// Maximum number of workspace entries listed on the first turn.
const MAX_LISTED_FILES: usize = 200;

/// Structured environment snapshot for one turn.
#[derive(Debug, Clone)]
pub struct EnvironmentDetails {
    /// Current time (formatted)
    pub time: String,
    /// Working directory path
    pub working_dir: String,
    pub mode: Mode,
    /// Context size of the previous request, in tokens
    pub context_tokens: u64,
    /// Cost of the task so far, in USD
    pub total_cost: f64,
    /// Top-level workspace entries; `None` when not collected for this turn
    pub files: Option<Vec<String>>,
}

impl EnvironmentDetails {
    /// Collect the details for a turn. The workspace listing is only gathered when asked.
    pub async fn collect(working_dir: &Path, mode: Mode, usage: &TokenUsage, context_tokens: u64, include_files: bool) -> Self {
        let files = if include_files {
            Some(list_workspace(working_dir).await)
        } else {
            None
        };

        Self {
            time: chrono::Local::now().format("%Y-%m-%d %H:%M:%S %:z").to_string(),
            working_dir: working_dir.display().to_string(),
            mode,
            context_tokens,
            total_cost: usage.total_cost,
            files,
        }
    }

    /// Format as a block for the model.
    pub fn format(&self) -> String {
        let mut out = format!(
            "<environment_details>\n# Current Time\n{}\n\n# Current Context Size (Tokens)\n{}\n\n# Current Cost\n${:.2}\n\n# Current Mode\n<slug>{}</slug>\n",
            self.time, self.context_tokens, self.total_cost, self.mode
        );

        if let Some(files) = &self.files {
            out.push_str(&format!("\n# Current Workspace Directory ({}) Files\n", self.working_dir));
            if files.is_empty() {
                out.push_str("(No files found)\n");
            } else {
                for file in files {
                    out.push_str(file);
                    out.push('\n');
                }
                if files.len() >= MAX_LISTED_FILES {
                    out.push_str("(File list truncated)\n");
                }
            }
        }

        out.push_str("</environment_details>");
        out
    }
}

async fn list_workspace(working_dir: &Path) -> Vec<String> {
    let mut entries = match tokio::fs::read_dir(working_dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = %working_dir.display(), "Cannot list workspace: {}", e);
            return Vec::new();
        }
    };

    let mut files = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        files.push(if is_dir { format!("{}/", name) } else { name });
    }
    files.sort();
    files.truncate(MAX_LISTED_FILES);
    files
}
