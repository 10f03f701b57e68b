//! Tool system for tasks.
//!
//! Tools are what a task does between model turns. The model invokes them through the
//! XML-style text protocol parsed by [`parser`]; the task loop validates parameters,
//! consults the repetition detector and then calls [`Tool::execute`].
//!
//! ## Workspace-First Design
//!
//! File tools resolve paths **relative to the workspace** by default:
//! - Relative paths (e.g., `src/main.rs`) resolve from the working directory
//! - Absolute paths (e.g., `/etc/hosts`) work as an escape hatch

mod completion;
mod file_ops;
mod followup;
mod new_task;
pub mod parser;
mod repetition;

pub use completion::AttemptCompletion;
pub use file_ops::ReadFile;
pub use followup::AskFollowupQuestion;
pub use new_task::NewTask;
pub use parser::{AssistantBlock, ToolGrammar, ToolParams, ToolUseBlock};
pub use repetition::{RepetitionCheck, ToolRepetitionDetector};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::messages::{AskKind, AskResponse, MessageContent, SayKind};
use crate::task::{Mode, Task, TaskError};

// ============================================================================
// Path Resolution Utilities
// ============================================================================

/// Result of resolving a path relative to the workspace.
#[derive(Debug, Clone)]
pub struct PathResolution {
    /// The fully resolved path.
    pub resolved: PathBuf,
    /// Whether the resolved path is outside the workspace.
    pub is_outside_workspace: bool,
    /// Whether the original path was absolute.
    pub was_absolute: bool,
}

impl PathResolution {
    /// A note for tool output when the path left the workspace; empty otherwise.
    pub fn note(&self) -> String {
        if self.was_absolute {
            format!("[absolute path: {}]", self.resolved.display())
        } else if self.is_outside_workspace {
            format!("[resolved to: {}]", self.resolved.display())
        } else {
            String::new()
        }
    }
}

/// Resolve a path relative to the workspace.
///
/// - Relative paths are joined with `workspace`
/// - Absolute paths are used as-is
pub fn resolve_path(path_str: &str, workspace: &Path) -> PathResolution {
    let path = Path::new(path_str);
    let was_absolute = path.is_absolute();

    let resolved = if was_absolute {
        path.to_path_buf()
    } else {
        workspace.join(path)
    };

    // Canonicalize for accurate comparison (handles .., symlinks, etc.)
    let canonical_resolved = resolved.canonicalize().unwrap_or_else(|_| resolved.clone());
    let canonical_workspace = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());

    PathResolution {
        is_outside_workspace: !canonical_resolved.starts_with(&canonical_workspace),
        resolved,
        was_absolute,
    }
}

// ============================================================================
// Tool Trait and Registry
// ============================================================================

/// One parameter a tool accepts.
#[derive(Debug, Clone, Copy)]
pub struct ToolParam {
    pub name: &'static str,
    pub description: &'static str,
    pub required: bool,
}

impl ToolParam {
    pub const fn required(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            required: false,
        }
    }
}

/// A complete tool invocation, as recorded in history.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Identifier linking the call to its result block
    pub id: String,
    pub name: String,
    pub params: ToolParams,
}

/// What a tool can reach while it runs.
pub struct ToolContext<'a> {
    pub task: &'a Arc<Task>,
    pub working_dir: &'a Path,
}

/// Result of running a tool.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    /// Text handed back to the model
    Output(String),
    /// The tool ran and failed; the message is handed back to the model as an error
    Failed(String),
    /// The caller declined the operation; no further tools run this turn
    Rejected { feedback: Option<String> },
    /// The task is finished with this result
    Completed { result: String },
}

/// Information about a tool for display purposes.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
}

/// Trait for implementing tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool, also its XML tag.
    fn name(&self) -> &str;

    /// A description of what this tool does.
    fn description(&self) -> &str;

    /// Parameters in the order they are documented.
    fn parameters(&self) -> &[ToolParam];

    /// Whether running the tool can change the workspace (and so warrants a checkpoint).
    fn modifies_workspace(&self) -> bool {
        false
    }

    /// Execute the tool. Required parameters are already known to be present.
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext<'_>) -> Result<ToolOutcome, TaskError>;
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create a new registry with the built-in tools.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(AttemptCompletion));
        registry.register(Arc::new(NewTask));
        registry.register(Arc::new(AskFollowupQuestion));
        registry.register(Arc::new(ReadFile));
        tracing::debug!("ToolRegistry created with {} tools", registry.tools.len());
        registry
    }

    /// Create an empty registry (no built-in tools).
    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Add a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// List all available tools, sorted by name.
    pub fn list_tools(&self) -> Vec<ToolInfo> {
        self.sorted()
            .into_iter()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
            })
            .collect()
    }

    /// Tags the response parser should recognize.
    pub fn grammar(&self) -> ToolGrammar {
        self.sorted().into_iter().fold(ToolGrammar::new(), |grammar, tool| {
            grammar.with_tool(tool.name(), tool.parameters().iter().map(|p| p.name))
        })
    }

    /// System prompt describing the tool protocol and every registered tool.
    pub fn system_prompt(&self, mode: &Mode, working_dir: &Path) -> String {
        let mut prompt = String::from(
            "You are a highly skilled software engineer working through a task one step at a time.\n\n\
             ====\n\nTOOL USE\n\n\
             You have access to a set of tools. You use exactly one tool per message and receive \
             its result in the user's response. Tool uses are formatted using XML-style tags:\n\n\
             <tool_name>\n<parameter1_name>value1</parameter1_name>\n</tool_name>\n\n# Tools\n",
        );

        for tool in self.sorted() {
            prompt.push_str(&format!("\n## {}\nDescription: {}\nParameters:\n", tool.name(), tool.description()));
            if tool.parameters().is_empty() {
                prompt.push_str("- (none)\n");
            }
            for param in tool.parameters() {
                let required = if param.required { "required" } else { "optional" };
                prompt.push_str(&format!("- {}: ({}) {}\n", param.name, required, param.description));
            }
            prompt.push_str(&format!("Usage:\n<{}>\n", tool.name()));
            for param in tool.parameters() {
                prompt.push_str(&format!("<{}>...</{}>\n", param.name, param.name));
            }
            prompt.push_str(&format!("</{}>\n", tool.name()));
        }

        prompt.push_str(&format!(
            "\n====\n\nRULES\n\n\
             - The current working directory is {}.\n\
             - You are operating in the '{}' mode.\n\
             - Use one tool per message and wait for its result before continuing.\n\
             - When the task is done, use attempt_completion with a final result. Do not end the \
             result with a question.\n",
            working_dir.display(),
            mode
        ));
        prompt
    }

    fn sorted(&self) -> Vec<&Arc<dyn Tool>> {
        let mut tools: Vec<_> = self.tools.values().collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The caller's verdict on a tool that needs approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Approval {
    Approved { feedback: Option<String> },
    Denied { feedback: Option<String> },
}

/// Ask the caller to approve a tool call.
///
/// A yes (optionally with text) approves; anything else denies. Text the caller typed is
/// echoed as user feedback.
pub async fn ask_approval(task: &Task, call: &ToolCall) -> Result<Approval, TaskError> {
    let request = serde_json::json!({
        "tool": call.name,
        "params": call.params.to_json(),
    });
    let reply = task.ask(AskKind::Tool, Some(request.to_string()), None).await?;
    let feedback = reply.feedback().map(str::to_string);

    if let Some(text) = &feedback {
        task.say(
            SayKind::UserFeedback,
            MessageContent::text(text.clone()).with_images(reply.images.clone()),
            None,
        )
        .await?;
    }

    Ok(match reply.response {
        AskResponse::YesButtonClicked => Approval::Approved { feedback },
        AskResponse::NoButtonClicked | AskResponse::MessageResponse => Approval::Denied { feedback },
    })
}

/// Wrap caller feedback the way the model expects to read it.
pub fn format_feedback(feedback: &str) -> String {
    format!("<feedback>\n{}\n</feedback>", feedback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_tools_are_registered() {
        let registry = ToolRegistry::new();
        let names: Vec<_> = registry.list_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec!["ask_followup_question", "attempt_completion", "new_task", "read_file"]
        );
    }

    #[test]
    fn test_grammar_recognizes_registered_tools() {
        let registry = ToolRegistry::new();
        let blocks = parser::parse_assistant_message(
            "<new_task><mode>code</mode><message>do it</message></new_task>",
            &registry.grammar(),
        );
        let AssistantBlock::ToolUse(block) = &blocks[0] else {
            panic!("expected tool use");
        };
        assert_eq!(block.name, "new_task");
        assert_eq!(block.params.get("message"), Some("do it"));
    }

    #[test]
    fn test_system_prompt_lists_parameters_and_mode() {
        let registry = ToolRegistry::new();
        let prompt = registry.system_prompt(&Mode::new("architect"), Path::new("/work"));
        assert!(prompt.contains("## read_file"));
        assert!(prompt.contains("- path: (required)"));
        assert!(prompt.contains("'architect' mode"));
        assert!(prompt.contains("/work"));
    }

    #[test]
    fn test_resolve_path() {
        let dir = tempfile::tempdir().unwrap();
        let inside = resolve_path("src/lib.rs", dir.path());
        assert!(!inside.was_absolute);
        assert!(!inside.is_outside_workspace);
        assert!(inside.note().is_empty());

        let outside = resolve_path("/etc/hosts", dir.path());
        assert!(outside.was_absolute);
        assert!(outside.note().starts_with("[absolute path"));
    }
}
