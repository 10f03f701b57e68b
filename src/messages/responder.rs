//! Deterministic answers for tasks that run without an interactive caller.

use async_trait::async_trait;

use super::{AskKind, AskReply};

/// Answers asks on behalf of an automated caller.
///
/// Every ask kind must get an answer; returning is the only way an unattended task makes
/// progress past an ask.
#[async_trait]
pub trait AskResponder: Send + Sync {
    async fn respond(&self, kind: AskKind, text: Option<&str>) -> AskReply;
}

/// Default policy for agent-pool tasks.
///
/// Approves tools, commands, retries and resumption, accepts completion results, answers
/// follow-up questions with a fixed nudge, and declines the policy-breach prompts so a runaway
/// task stops instead of spending more.
#[derive(Debug, Clone)]
pub struct AutoResponder {
    followup_answer: String,
}

impl AutoResponder {
    pub fn new() -> Self {
        Self {
            followup_answer:
                "No user is available to answer. Proceed with your best judgement and state any assumptions you make."
                    .to_string(),
        }
    }

    pub fn with_followup_answer(mut self, answer: impl Into<String>) -> Self {
        self.followup_answer = answer.into();
        self
    }
}

impl Default for AutoResponder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AskResponder for AutoResponder {
    async fn respond(&self, kind: AskKind, _text: Option<&str>) -> AskReply {
        match kind {
            AskKind::Followup => AskReply::message(self.followup_answer.clone()),
            AskKind::Tool
            | AskKind::Command
            | AskKind::CommandOutput
            | AskKind::ApiReqFailed
            | AskKind::ResumeTask
            | AskKind::ResumeCompletedTask
            | AskKind::CompletionResult => AskReply::yes(),
            AskKind::MistakeLimitReached
            | AskKind::AutoApprovalMaxReqReached
            | AskKind::AutoApprovalMaxCostReached => AskReply::no(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::AskResponse;

    #[tokio::test]
    async fn test_auto_responder_policy() {
        let responder = AutoResponder::new();

        assert_eq!(
            responder.respond(AskKind::Tool, None).await.response,
            AskResponse::YesButtonClicked
        );
        assert_eq!(
            responder.respond(AskKind::CompletionResult, Some("done")).await.response,
            AskResponse::YesButtonClicked
        );
        assert_eq!(
            responder.respond(AskKind::MistakeLimitReached, None).await.response,
            AskResponse::NoButtonClicked
        );

        let followup = responder
            .with_followup_answer("use defaults")
            .respond(AskKind::Followup, Some("which db?"))
            .await;
        assert_eq!(followup.response, AskResponse::MessageResponse);
        assert_eq!(followup.feedback(), Some("use defaults"));
    }
}
