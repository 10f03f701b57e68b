//! Incremental parser for the XML-style tool protocol.
//!
//! The assistant writes prose interleaved with tool calls such as
//!
//! ```text
//! Let me check the file.
//! <read_file>
//! <path>src/main.rs</path>
//! </read_file>
//! ```
//!
//! The parser runs over the accumulated text after every streamed chunk. Only tool and
//! parameter names registered in the [`ToolGrammar`] are recognized; any other tag stays
//! prose. Blocks still being written are returned with `partial: true`.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

/// Ordered parameter map with unique keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolParams(Vec<(String, String)>);

impl ToolParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a parameter, keeping its first position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(key, _)| *key == name) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// The value if present and not blank.
    pub fn non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| !v.trim().is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_vec(&self) -> Vec<(String, String)> {
        self.0.clone()
    }

    /// JSON object of the parameters in call order.
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .0
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        Value::Object(map)
    }

    pub fn from_json(value: &Value) -> Self {
        let mut params = Self::new();
        if let Some(map) = value.as_object() {
            for (key, value) in map {
                let value = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
                params.insert(key.clone(), value);
            }
        }
        params
    }
}

/// A parsed tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolUseBlock {
    pub name: String,
    pub params: ToolParams,
    pub partial: bool,
}

/// One block of assistant output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssistantBlock {
    Text { content: String, partial: bool },
    ToolUse(ToolUseBlock),
}

impl AssistantBlock {
    pub fn is_partial(&self) -> bool {
        match self {
            AssistantBlock::Text { partial, .. } => *partial,
            AssistantBlock::ToolUse(tool) => tool.partial,
        }
    }
}

#[derive(Debug, Clone)]
struct ParamTags {
    name: String,
    open: String,
    close: String,
}

#[derive(Debug, Clone)]
struct ToolTags {
    name: String,
    open: String,
    close: String,
    params: Vec<ParamTags>,
}

/// The tool and parameter names the parser recognizes.
#[derive(Debug, Clone, Default)]
pub struct ToolGrammar {
    tools: Vec<ToolTags>,
}

impl ToolGrammar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool<I, S>(mut self, name: &str, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tools.push(ToolTags {
            name: name.to_string(),
            open: format!("<{}>", name),
            close: format!("</{}>", name),
            params: params
                .into_iter()
                .map(|p| {
                    let p = p.as_ref();
                    ParamTags {
                        name: p.to_string(),
                        open: format!("<{}>", p),
                        close: format!("</{}>", p),
                    }
                })
                .collect(),
        });
        self
    }

    fn tool(&self, index: usize) -> &ToolTags {
        &self.tools[index]
    }
}

enum State {
    Text,
    Tool {
        tool: usize,
        block: ToolUseBlock,
    },
    Param {
        tool: usize,
        param: usize,
        block: ToolUseBlock,
        value_start: usize,
    },
}

/// Parse everything the assistant has written so far.
pub fn parse_assistant_message(text: &str, grammar: &ToolGrammar) -> Vec<AssistantBlock> {
    let mut blocks = Vec::new();
    let mut text_start = 0;
    let mut state = State::Text;

    for (i, ch) in text.char_indices() {
        let end = i + ch.len_utf8();
        let seen = &text[..end];

        state = match state {
            State::Param {
                tool,
                param,
                mut block,
                value_start,
            } => {
                let tags = &grammar.tool(tool).params[param];
                if seen.ends_with(&tags.close) {
                    let value = text[value_start..end - tags.close.len()].trim();
                    block.params.insert(tags.name.clone(), value);
                    State::Tool { tool, block }
                } else {
                    State::Param {
                        tool,
                        param,
                        block,
                        value_start,
                    }
                }
            }
            State::Tool { tool, mut block } => {
                let tags = grammar.tool(tool);
                if seen.ends_with(&tags.close) {
                    block.partial = false;
                    blocks.push(AssistantBlock::ToolUse(block));
                    text_start = end;
                    State::Text
                } else if let Some(param) = tags.params.iter().position(|p| seen.ends_with(&p.open)) {
                    State::Param {
                        tool,
                        param,
                        block,
                        value_start: end,
                    }
                } else {
                    State::Tool { tool, block }
                }
            }
            State::Text => match grammar.tools.iter().position(|t| seen.ends_with(&t.open)) {
                Some(tool) => {
                    let tags = grammar.tool(tool);
                    let preceding = text[text_start..end - tags.open.len()].trim();
                    if !preceding.is_empty() {
                        blocks.push(AssistantBlock::Text {
                            content: preceding.to_string(),
                            partial: false,
                        });
                    }
                    State::Tool {
                        tool,
                        block: ToolUseBlock {
                            name: tags.name.clone(),
                            params: ToolParams::new(),
                            partial: true,
                        },
                    }
                }
                None => State::Text,
            },
        };
    }

    match state {
        State::Param {
            tool,
            param,
            mut block,
            value_start,
        } => {
            let name = grammar.tool(tool).params[param].name.clone();
            block.params.insert(name, text[value_start..].trim());
            blocks.push(AssistantBlock::ToolUse(block));
        }
        State::Tool { block, .. } => blocks.push(AssistantBlock::ToolUse(block)),
        State::Text => {
            let rest = text[text_start..].trim();
            if !rest.is_empty() {
                blocks.push(AssistantBlock::Text {
                    content: rest.to_string(),
                    partial: true,
                });
            }
        }
    }

    blocks
}

/// Mark every block complete once the stream has ended.
pub fn finalize_blocks(blocks: &mut [AssistantBlock]) {
    for block in blocks {
        match block {
            AssistantBlock::Text { partial, .. } => *partial = false,
            AssistantBlock::ToolUse(tool) => tool.partial = false,
        }
    }
}

static THINKING_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</?thinking>").expect("valid regex"));
static TRAILING_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s?</?[A-Za-z_]*$").expect("valid regex"));

/// Text as shown to the caller: thinking tags removed, and while streaming, a half-written
/// tag at the end hidden.
pub fn display_text(content: &str, partial: bool) -> String {
    let cleaned = THINKING_TAG.replace_all(content, "");
    let cleaned = if partial {
        TRAILING_TAG.replace(&cleaned, "").into_owned()
    } else {
        cleaned.into_owned()
    };
    cleaned.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grammar() -> ToolGrammar {
        ToolGrammar::new()
            .with_tool("read_file", ["path", "start_line"])
            .with_tool("attempt_completion", ["result"])
    }

    #[test]
    fn test_text_tool_text() {
        let text = "Let me look.\n<read_file>\n<path>src/main.rs</path>\n</read_file>\nDone reading.";
        let blocks = parse_assistant_message(text, &grammar());

        assert_eq!(blocks.len(), 3);
        assert_eq!(
            blocks[0],
            AssistantBlock::Text {
                content: "Let me look.".to_string(),
                partial: false
            }
        );
        let AssistantBlock::ToolUse(tool) = &blocks[1] else {
            panic!("expected tool use");
        };
        assert_eq!(tool.name, "read_file");
        assert_eq!(tool.params.get("path"), Some("src/main.rs"));
        assert!(!tool.partial);
        assert!(blocks[2].is_partial());
    }

    #[test]
    fn test_streaming_prefixes_yield_partial_blocks() {
        let text = "<read_file>\n<path>src/ma";
        let blocks = parse_assistant_message(text, &grammar());
        assert_eq!(blocks.len(), 1);
        let AssistantBlock::ToolUse(tool) = &blocks[0] else {
            panic!("expected tool use");
        };
        assert!(tool.partial);
        assert_eq!(tool.params.get("path"), Some("src/ma"));
    }

    #[test]
    fn test_tool_without_parameters() {
        let blocks = parse_assistant_message("<attempt_completion>\n</attempt_completion>", &grammar());
        assert_eq!(
            blocks,
            vec![AssistantBlock::ToolUse(ToolUseBlock {
                name: "attempt_completion".to_string(),
                params: ToolParams::new(),
                partial: false,
            })]
        );
    }

    #[test]
    fn test_unknown_tags_stay_prose() {
        let blocks = parse_assistant_message("Use <b>bold</b> here", &grammar());
        assert_eq!(
            blocks,
            vec![AssistantBlock::Text {
                content: "Use <b>bold</b> here".to_string(),
                partial: true
            }]
        );
    }

    #[test]
    fn test_repeated_parameter_keeps_last_value_in_first_position() {
        let text = "<read_file><path>a</path><start_line>3</start_line><path>b</path></read_file>";
        let blocks = parse_assistant_message(text, &grammar());
        let AssistantBlock::ToolUse(tool) = &blocks[0] else {
            panic!("expected tool use");
        };
        assert_eq!(
            tool.params.to_vec(),
            vec![
                ("path".to_string(), "b".to_string()),
                ("start_line".to_string(), "3".to_string())
            ]
        );
    }

    #[test]
    fn test_finalize_blocks() {
        let mut blocks = parse_assistant_message("thinking out loud", &grammar());
        assert!(blocks[0].is_partial());
        finalize_blocks(&mut blocks);
        assert!(!blocks[0].is_partial());
    }

    #[test]
    fn test_display_text_hides_half_written_tags() {
        assert_eq!(display_text("Reading now <read_fi", true), "Reading now");
        assert_eq!(display_text("<thinking>plan</thinking> go", false), "plan go");
        assert_eq!(display_text("a < b", true), "a < b");
    }

    #[test]
    fn test_params_json_round_trip_preserves_order() {
        let mut params = ToolParams::new();
        params.insert("z", "1");
        params.insert("a", "2");
        let json = params.to_json();
        assert_eq!(ToolParams::from_json(&json), params);
    }
}
