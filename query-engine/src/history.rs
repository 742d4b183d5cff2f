use std::collections::VecDeque;

use common::utils::tokens::TokenCounter;
use serde::{Deserialize, Serialize};

use crate::context::table::{section_banner, ContextTable, DEFAULT_COLUMN_DELIMITER};
use crate::llm::{ChatMessage, ChatRole};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: ChatRole,
    pub content: String,
}

/// A user question together with the assistant answers that followed it.
#[derive(Debug, Clone)]
pub struct QaTurn {
    pub user_query: ConversationTurn,
    pub assistant_answers: Vec<ConversationTurn>,
}

impl QaTurn {
    pub fn answer_text(&self) -> Option<String> {
        if self.assistant_answers.is_empty() {
            return None;
        }
        Some(
            self.assistant_answers
                .iter()
                .map(|turn| turn.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    }
}

/// Rendering knobs for [`ConversationHistory::build_context`].
#[derive(Debug, Clone)]
pub struct HistoryContextParams {
    pub include_user_turns_only: bool,
    pub max_qa_turns: usize,
    pub max_tokens: usize,
    pub recency_bias: bool,
    pub column_delimiter: char,
    pub context_name: String,
}

impl Default for HistoryContextParams {
    fn default() -> Self {
        Self {
            include_user_turns_only: true,
            max_qa_turns: 5,
            max_tokens: 8000,
            recency_bias: true,
            column_delimiter: DEFAULT_COLUMN_DELIMITER,
            context_name: "Conversation History".to_string(),
        }
    }
}

/// Insertion-ordered turn log, bounded by `max_length`: appending past the
/// bound discards the eldest turn.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    turns: VecDeque<ConversationTurn>,
    max_length: Option<usize>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            max_length: Some(max_length),
        }
    }

    pub fn from_messages(messages: &[ChatMessage]) -> Self {
        let mut history = Self::new();
        for message in messages {
            history.add_turn(message.role, message.content.clone());
        }
        history
    }

    pub fn add_turn(&mut self, role: ChatRole, content: impl Into<String>) {
        self.turns.push_back(ConversationTurn {
            role,
            content: content.into(),
        });
        if let Some(max) = self.max_length {
            while self.turns.len() > max {
                self.turns.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn to_messages(&self) -> Vec<ChatMessage> {
        self.turns
            .iter()
            .map(|turn| ChatMessage {
                role: turn.role,
                content: turn.content.clone(),
            })
            .collect()
    }

    /// Groups turns into QA turns. Assistant turns before any user turn are
    /// dropped; a user turn directly following another user turn closes the
    /// previous QA turn with no answers.
    pub fn to_qa_turns(&self) -> Vec<QaTurn> {
        let mut qa_turns: Vec<QaTurn> = Vec::new();
        let mut current: Option<QaTurn> = None;
        for turn in &self.turns {
            match turn.role {
                ChatRole::User => {
                    if let Some(finished) = current.take() {
                        qa_turns.push(finished);
                    }
                    current = Some(QaTurn {
                        user_query: turn.clone(),
                        assistant_answers: Vec::new(),
                    });
                }
                ChatRole::Assistant => {
                    if let Some(qa) = current.as_mut() {
                        qa.assistant_answers.push(turn.clone());
                    }
                }
                ChatRole::System => {}
            }
        }
        if let Some(finished) = current {
            qa_turns.push(finished);
        }
        qa_turns
    }

    /// The most recent `max_user_turns` user contents, oldest first.
    pub fn get_user_turns(&self, max_user_turns: usize) -> Vec<String> {
        let user_turns: Vec<&ConversationTurn> = self
            .turns
            .iter()
            .filter(|turn| turn.role == ChatRole::User)
            .collect();
        user_turns
            .iter()
            .skip(user_turns.len().saturating_sub(max_user_turns))
            .map(|turn| turn.content.clone())
            .collect()
    }

    /// Renders the history as a `turn|content` table under the banner
    /// header, growing row-by-row. Emits the last snapshot that stays
    /// within `max_tokens`.
    pub fn build_context(
        &self,
        counter: &TokenCounter,
        params: &HistoryContextParams,
    ) -> (String, ContextTable) {
        let mut qa_turns = self.to_qa_turns();
        if params.include_user_turns_only {
            for qa in &mut qa_turns {
                qa.assistant_answers.clear();
            }
        }
        if params.recency_bias {
            qa_turns.reverse();
        }
        if params.max_qa_turns > 0 && qa_turns.len() > params.max_qa_turns {
            qa_turns.truncate(params.max_qa_turns);
        }

        if qa_turns.is_empty() {
            return (String::new(), ContextTable::new(&["turn", "content"]));
        }

        let header = section_banner(&params.context_name);
        let mut current = ContextTable::new(&["turn", "content"]);
        let mut candidate = current.clone();
        for qa in &qa_turns {
            candidate.push_row(vec![
                ChatRole::User.to_string(),
                qa.user_query.content.clone(),
            ]);
            if let Some(answers) = qa.answer_text() {
                candidate.push_row(vec![ChatRole::Assistant.to_string(), answers]);
            }
            let rendered = format!(
                "{header}{}",
                candidate.to_delimited(params.column_delimiter)
            );
            if counter.count(&rendered) > params.max_tokens {
                break;
            }
            current = candidate.clone();
        }

        let text = format!("{header}{}", current.to_delimited(params.column_delimiter));
        (text, current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> TokenCounter {
        TokenCounter::new("cl100k_base").unwrap()
    }

    fn history_from(pairs: &[(ChatRole, &str)]) -> ConversationHistory {
        let mut history = ConversationHistory::new();
        for (role, content) in pairs {
            history.add_turn(*role, *content);
        }
        history
    }

    #[test]
    fn test_bound_discards_eldest() {
        let mut history = ConversationHistory::with_max_length(2);
        history.add_turn(ChatRole::User, "one");
        history.add_turn(ChatRole::Assistant, "two");
        history.add_turn(ChatRole::User, "three");
        assert_eq!(history.len(), 2);
        assert_eq!(history.to_messages()[0].content, "two");
    }

    #[test]
    fn test_qa_turns_group_answers() {
        let history = history_from(&[
            (ChatRole::Assistant, "dangling"),
            (ChatRole::User, "q1"),
            (ChatRole::Assistant, "a1"),
            (ChatRole::Assistant, "a2"),
            (ChatRole::User, "q2"),
            (ChatRole::User, "q3"),
        ]);
        let qa = history.to_qa_turns();
        assert_eq!(qa.len(), 3);
        assert_eq!(qa[0].user_query.content, "q1");
        assert_eq!(qa[0].answer_text().as_deref(), Some("a1\na2"));
        assert!(qa[1].answer_text().is_none());
        assert_eq!(qa[2].user_query.content, "q3");
    }

    #[test]
    fn test_get_user_turns_most_recent_oldest_first() {
        let history = history_from(&[
            (ChatRole::User, "first"),
            (ChatRole::Assistant, "a"),
            (ChatRole::User, "second"),
            (ChatRole::User, "third"),
        ]);
        assert_eq!(history.get_user_turns(2), vec!["second", "third"]);
        assert_eq!(history.get_user_turns(10).len(), 3);
    }

    #[test]
    fn test_build_context_renders_table() {
        let history = history_from(&[(ChatRole::User, "hello"), (ChatRole::Assistant, "hi")]);
        let params = HistoryContextParams {
            include_user_turns_only: false,
            recency_bias: false,
            ..HistoryContextParams::default()
        };
        let (text, table) = history.build_context(&counter(), &params);
        assert!(text.starts_with("-----Conversation History-----\n"));
        assert!(text.contains("turn|content"));
        assert!(text.contains("user|hello"));
        assert!(text.contains("assistant|hi"));
        assert_eq!(table.rows.len(), 2);
    }

    #[test]
    fn test_build_context_respects_token_budget() {
        let mut history = ConversationHistory::new();
        for i in 0..50 {
            history.add_turn(ChatRole::User, format!("question number {i} with padding"));
        }
        let params = HistoryContextParams {
            max_qa_turns: 50,
            max_tokens: 40,
            recency_bias: false,
            ..HistoryContextParams::default()
        };
        let (text, table) = history.build_context(&counter(), &params);
        assert!(counter().count(&text) <= 40);
        assert!(table.rows.len() < 50);
        assert!(!table.rows.is_empty());
    }

    #[test]
    fn test_empty_history_renders_empty() {
        let history = ConversationHistory::new();
        let (text, table) = history.build_context(&counter(), &HistoryContextParams::default());
        assert!(text.is_empty());
        assert!(table.is_empty());
    }
}
