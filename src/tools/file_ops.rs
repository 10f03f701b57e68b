//! File reading tool.
//!
//! Relative paths resolve from the workspace; absolute paths are an escape hatch for
//! system files. Reading asks the caller for approval first.

use std::path::Path;

use async_trait::async_trait;

use super::{ask_approval, format_feedback, resolve_path, Approval, Tool, ToolCall, ToolContext, ToolOutcome, ToolParam};
use crate::task::TaskError;

const PARAMETERS: &[ToolParam] = &[
    ToolParam::required(
        "path",
        "File path. Use relative paths (e.g., 'src/main.rs') for workspace files, or absolute paths for system files.",
    ),
    ToolParam::optional("start_line", "Start reading from this line number (1-indexed)"),
    ToolParam::optional("end_line", "Stop reading at this line number (inclusive)"),
];

/// Read the contents of a file.
pub struct ReadFile;

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file's contents with line numbers. Use relative paths like 'src/main.rs' (recommended) or absolute paths like '/etc/hosts' for system files."
    }

    fn parameters(&self) -> &[ToolParam] {
        PARAMETERS
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext<'_>) -> Result<ToolOutcome, TaskError> {
        let path = call.params.non_empty("path").unwrap_or_default();

        let feedback = match ask_approval(ctx.task, call).await? {
            Approval::Approved { feedback } => feedback,
            Approval::Denied { feedback } => return Ok(ToolOutcome::Rejected { feedback }),
        };

        let start_line = parse_line(call.params.get("start_line"));
        let end_line = parse_line(call.params.get("end_line"));

        let mut output = match read_lines(path, ctx.working_dir, start_line, end_line).await {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!(path, "read_file failed: {}", e);
                return Ok(ToolOutcome::Failed(e.to_string()));
            }
        };

        if let Some(feedback) = feedback {
            output.push_str("\n\n");
            output.push_str(&format_feedback(&feedback));
        }
        Ok(ToolOutcome::Output(output))
    }
}

fn parse_line(raw: Option<&str>) -> Option<usize> {
    raw.and_then(|value| value.trim().parse::<usize>().ok())
}

async fn read_lines(
    path: &str,
    working_dir: &Path,
    start_line: Option<usize>,
    end_line: Option<usize>,
) -> anyhow::Result<String> {
    let resolution = resolve_path(path, working_dir);

    if !resolution.resolved.exists() {
        anyhow::bail!(
            "File not found: {} (resolved to: {})",
            path,
            resolution.resolved.display()
        );
    }

    let bytes = tokio::fs::read(&resolution.resolved).await?;
    let byte_len = bytes.len();
    let content = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(_) => {
            return Ok(format!(
                "Binary file detected: {} ({} bytes). Cannot display binary content directly.",
                resolution.resolved.display(),
                byte_len
            ));
        }
    };

    let lines: Vec<&str> = content.lines().collect();
    let total_lines = lines.len();
    let start = start_line.unwrap_or(1).saturating_sub(1).min(total_lines);
    let end = end_line.unwrap_or(total_lines).min(total_lines);
    let (start, end) = if start > end { (end, start) } else { (start, end) };

    if total_lines > 0 && start >= total_lines {
        return Ok(format!(
            "File has {} lines, requested start line {} is beyond end of file",
            total_lines,
            start + 1
        ));
    }

    let numbered: Vec<String> = lines[start..end]
        .iter()
        .enumerate()
        .map(|(i, line)| format!("{:4}| {}", start + i + 1, line))
        .collect();

    let note = resolution.note();
    if note.is_empty() {
        Ok(numbered.join("\n"))
    } else {
        Ok(format!("{}\n{}", note, numbered.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_reads_numbered_range() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), "one\ntwo\nthree\nfour")
            .await
            .unwrap();

        let all = assert_ok!(read_lines("notes.txt", dir.path(), None, None).await);
        assert_eq!(all, "   1| one\n   2| two\n   3| three\n   4| four");

        let middle = assert_ok!(read_lines("notes.txt", dir.path(), Some(2), Some(3)).await);
        assert_eq!(middle, "   2| two\n   3| three");

        let beyond = assert_ok!(read_lines("notes.txt", dir.path(), Some(9), None).await);
        assert!(beyond.contains("beyond end of file"));
    }

    #[tokio::test]
    async fn test_missing_and_binary_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = read_lines("nope.txt", dir.path(), None, None).await;
        assert!(missing.unwrap_err().to_string().starts_with("File not found"));

        tokio::fs::write(dir.path().join("blob.bin"), [0xff, 0xfe, 0x00])
            .await
            .unwrap();
        let binary = assert_ok!(read_lines("blob.bin", dir.path(), None, None).await);
        assert!(binary.starts_with("Binary file detected"));
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line(Some(" 12 ")), Some(12));
        assert_eq!(parse_line(Some("x")), None);
        assert_eq!(parse_line(None), None);
    }
}
