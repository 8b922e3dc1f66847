use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Round;

/// Ordered, append-only list of rounds for one session.
///
/// Rounds are 1-indexed and contiguous; no round is ever deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub rounds: Vec<Round>,
}

impl Conversation {
    pub fn init() -> Self {
        Self { rounds: Vec::new() }
    }

    pub fn add_round(&mut self, round: Round) {
        self.rounds.push(round);
    }

    pub fn round_by_id(&self, round_id: &str) -> Option<&Round> {
        self.rounds.iter().find(|r| r.id == round_id)
    }

    pub fn round_by_id_mut(&mut self, round_id: &str) -> Option<&mut Round> {
        self.rounds.iter_mut().find(|r| r.id == round_id)
    }

    /// 1-based index of a round, if present.
    pub fn round_index(&self, round_id: &str) -> Option<usize> {
        self.rounds.iter().position(|r| r.id == round_id).map(|i| i + 1)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Load a conversation, stripping unknown-kind attachments everywhere.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let mut conversation: Conversation = serde_json::from_value(value)?;
        for round in &mut conversation.rounds {
            for post in &mut round.posts {
                post.attachments.retain(|a| a.kind.is_known());
            }
        }
        Ok(conversation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_index_is_one_based() {
        let mut conversation = Conversation::init();
        let first = Round::create("a");
        let second = Round::create("b");
        let first_id = first.id.clone();
        let second_id = second.id.clone();
        conversation.add_round(first);
        conversation.add_round(second);

        assert_eq!(conversation.round_index(&first_id), Some(1));
        assert_eq!(conversation.round_index(&second_id), Some(2));
        assert_eq!(conversation.round_index("round-missing"), None);
    }
}
