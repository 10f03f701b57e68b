//! The ordered display log of one task and its partial-update rules.
//!
//! # Invariants
//! - A `partial: Some(true)` write either updates the trailing message (same kind and still
//!   partial) or appends a new trailing partial message.
//! - A `partial: Some(false)` write finalizes exactly one trailing message, or appends a single
//!   atomic message when there is nothing to finalize.
//! - Timestamps are strictly increasing, so a timestamp identifies one message.

use super::{DisplayMessage, MessageContent, MessageDetail, MessageKind};

/// What a write did to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// A new message was appended
    Created,
    /// The trailing partial message was updated and is still partial
    Updated,
    /// The trailing partial message was finalized
    Finalized,
}

#[derive(Debug, Default)]
pub struct MessageLog {
    messages: Vec<DisplayMessage>,
    last_ts: i64,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from persisted messages.
    pub fn from_messages(messages: Vec<DisplayMessage>) -> Self {
        let last_ts = messages.iter().map(|m| m.ts).max().unwrap_or(0);
        Self { messages, last_ts }
    }

    pub fn messages(&self) -> &[DisplayMessage] {
        &self.messages
    }

    pub fn snapshot(&self) -> Vec<DisplayMessage> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&DisplayMessage> {
        self.messages.last()
    }

    pub fn get(&self, ts: i64) -> Option<&DisplayMessage> {
        self.messages.iter().rev().find(|m| m.ts == ts)
    }

    /// Append or update a message according to the partial rules.
    ///
    /// Returns the timestamp of the affected message and what happened to it.
    pub fn apply(
        &mut self,
        kind: MessageKind,
        content: MessageContent,
        partial: Option<bool>,
    ) -> (i64, UpdateOutcome) {
        let updates_trailing = self
            .messages
            .last()
            .map(|last| last.is_partial() && last.kind == kind)
            .unwrap_or(false);

        match (partial, updates_trailing) {
            (Some(true), true) => {
                let ts = self.overwrite_trailing(content, Some(true));
                (ts, UpdateOutcome::Updated)
            }
            (Some(false), true) => {
                let ts = self.overwrite_trailing(content, Some(false));
                (ts, UpdateOutcome::Finalized)
            }
            (Some(true), false) => {
                let ts = self.push(kind, content, Some(true));
                (ts, UpdateOutcome::Created)
            }
            (Some(false), false) | (None, _) => {
                let ts = self.push(kind, content, None);
                (ts, UpdateOutcome::Created)
            }
        }
    }

    /// Replace the detail of the message with the given timestamp.
    pub fn set_detail(&mut self, ts: i64, detail: MessageDetail) -> bool {
        match self.messages.iter_mut().rev().find(|m| m.ts == ts) {
            Some(message) => {
                message.detail = Some(detail);
                true
            }
            None => false,
        }
    }

    /// Drop trailing messages matching the predicate.
    pub fn pop_trailing_while(&mut self, mut predicate: impl FnMut(&DisplayMessage) -> bool) {
        while self.messages.last().map(&mut predicate).unwrap_or(false) {
            self.messages.pop();
        }
    }

    fn next_ts(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.last_ts = now.max(self.last_ts + 1);
        self.last_ts
    }

    fn push(&mut self, kind: MessageKind, content: MessageContent, partial: Option<bool>) -> i64 {
        let ts = self.next_ts();
        self.messages.push(DisplayMessage {
            ts,
            kind,
            text: content.text,
            images: content.images,
            partial,
            progress_status: content.progress_status,
            detail: content.detail,
        });
        ts
    }

    fn overwrite_trailing(&mut self, content: MessageContent, partial: Option<bool>) -> i64 {
        match self.messages.last_mut() {
            Some(last) => {
                last.text = content.text;
                last.images = content.images;
                last.partial = partial;
                if content.progress_status.is_some() {
                    last.progress_status = content.progress_status;
                }
                if content.detail.is_some() {
                    last.detail = content.detail;
                }
                last.ts
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AskKind, SayKind};

    fn say(kind: SayKind) -> MessageKind {
        MessageKind::Say(kind)
    }

    #[test]
    fn test_partial_then_final_say_yields_one_message() {
        let mut log = MessageLog::new();

        let (first, outcome) = log.apply(say(SayKind::Text), MessageContent::text("Hel"), Some(true));
        assert_eq!(outcome, UpdateOutcome::Created);
        let (second, outcome) =
            log.apply(say(SayKind::Text), MessageContent::text("Hello"), Some(true));
        assert_eq!(outcome, UpdateOutcome::Updated);
        let (third, outcome) =
            log.apply(say(SayKind::Text), MessageContent::text("Hello world"), Some(false));
        assert_eq!(outcome, UpdateOutcome::Finalized);

        assert_eq!(first, second);
        assert_eq!(second, third);
        assert_eq!(log.len(), 1);
        let message = log.last().unwrap();
        assert_eq!(message.partial, Some(false));
        assert_eq!(message.text.as_deref(), Some("Hello world"));
    }

    #[test]
    fn test_partial_of_other_kind_starts_new_message() {
        let mut log = MessageLog::new();
        log.apply(say(SayKind::Reasoning), MessageContent::text("think"), Some(true));
        log.apply(say(SayKind::Text), MessageContent::text("answer"), Some(true));

        assert_eq!(log.len(), 2);
        assert!(log.messages().iter().all(|m| m.is_partial()));
    }

    #[test]
    fn test_final_without_partial_appends_atomic_message() {
        let mut log = MessageLog::new();
        log.apply(say(SayKind::Text), MessageContent::text("done"), None);
        let (_, outcome) = log.apply(say(SayKind::Text), MessageContent::text("again"), Some(false));

        assert_eq!(outcome, UpdateOutcome::Created);
        assert_eq!(log.len(), 2);
        assert_eq!(log.last().unwrap().partial, None);
    }

    #[test]
    fn test_finalized_message_is_not_updated_again() {
        let mut log = MessageLog::new();
        log.apply(say(SayKind::Text), MessageContent::text("a"), Some(true));
        log.apply(say(SayKind::Text), MessageContent::text("ab"), Some(false));
        log.apply(say(SayKind::Text), MessageContent::text("c"), Some(true));

        assert_eq!(log.len(), 2);
        assert_eq!(log.messages()[0].text.as_deref(), Some("ab"));
    }

    #[test]
    fn test_timestamps_strictly_increase() {
        let mut log = MessageLog::new();
        let mut previous = 0;
        for _ in 0..50 {
            let (ts, _) = log.apply(MessageKind::Ask(AskKind::Tool), MessageContent::default(), None);
            assert!(ts > previous);
            previous = ts;
        }
    }

    #[test]
    fn test_from_messages_continues_after_restored_timestamps() {
        let mut log = MessageLog::new();
        log.apply(say(SayKind::Text), MessageContent::text("x"), None);
        let far_future = log.last().unwrap().ts + 1_000_000;
        let mut restored = log.snapshot();
        restored[0].ts = far_future;

        let mut log = MessageLog::from_messages(restored);
        let (ts, _) = log.apply(say(SayKind::Text), MessageContent::text("y"), None);
        assert!(ts > far_future);
    }
}
