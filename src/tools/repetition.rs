//! Detects a model stuck calling the same tool with the same arguments.

use super::ToolUseBlock;

/// Identical consecutive calls tolerated before the next one is refused.
pub const DEFAULT_REPETITION_LIMIT: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepetitionCheck {
    Allowed,
    /// The call repeats the previous one too often and must not run
    LimitReached { tool: String },
}

#[derive(Debug, Clone)]
pub struct ToolRepetitionDetector {
    previous: Option<String>,
    repeats: u32,
    limit: u32,
}

impl ToolRepetitionDetector {
    /// A limit of zero disables the check.
    pub fn new(limit: u32) -> Self {
        Self {
            previous: None,
            repeats: 0,
            limit,
        }
    }

    /// Record a call and decide whether it may run.
    ///
    /// After refusing a call the detector starts over, so the model gets a fresh allowance
    /// once it has seen the refusal.
    pub fn check(&mut self, block: &ToolUseBlock) -> RepetitionCheck {
        let key = format!("{}:{}", block.name, block.params.to_json());

        if self.previous.as_deref() == Some(key.as_str()) {
            self.repeats += 1;
        } else {
            self.repeats = 0;
            self.previous = Some(key);
        }

        if self.limit > 0 && self.repeats >= self.limit {
            self.repeats = 0;
            self.previous = None;
            return RepetitionCheck::LimitReached {
                tool: block.name.clone(),
            };
        }

        RepetitionCheck::Allowed
    }
}

impl Default for ToolRepetitionDetector {
    fn default() -> Self {
        Self::new(DEFAULT_REPETITION_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolParams;

    fn call(path: &str) -> ToolUseBlock {
        let mut params = ToolParams::new();
        params.insert("path", path);
        ToolUseBlock {
            name: "read_file".to_string(),
            params,
            partial: false,
        }
    }

    #[test]
    fn test_fourth_identical_call_is_refused() {
        let mut detector = ToolRepetitionDetector::default();
        for _ in 0..3 {
            assert_eq!(detector.check(&call("a.rs")), RepetitionCheck::Allowed);
        }
        assert_eq!(
            detector.check(&call("a.rs")),
            RepetitionCheck::LimitReached {
                tool: "read_file".to_string()
            }
        );
        assert_eq!(detector.check(&call("a.rs")), RepetitionCheck::Allowed);
    }

    #[test]
    fn test_different_arguments_reset_the_count() {
        let mut detector = ToolRepetitionDetector::new(2);
        assert_eq!(detector.check(&call("a.rs")), RepetitionCheck::Allowed);
        assert_eq!(detector.check(&call("a.rs")), RepetitionCheck::Allowed);
        assert_eq!(detector.check(&call("b.rs")), RepetitionCheck::Allowed);
        assert_eq!(detector.check(&call("b.rs")), RepetitionCheck::Allowed);
        assert!(matches!(
            detector.check(&call("b.rs")),
            RepetitionCheck::LimitReached { .. }
        ));
    }

    #[test]
    fn test_zero_limit_disables_detection() {
        let mut detector = ToolRepetitionDetector::new(0);
        for _ in 0..10 {
            assert_eq!(detector.check(&call("a.rs")), RepetitionCheck::Allowed);
        }
    }
}
