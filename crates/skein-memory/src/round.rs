use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Post;

/// Lifecycle state of a round. Transitions are monotonic:
/// `Created -> Finished` or `Created -> Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    Created,
    Finished,
    Failed,
}

impl RoundState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundState::Finished | RoundState::Failed)
    }
}

/// One user query and all ensuing posts until termination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Round {
    pub id: String,
    pub user_query: String,
    pub state: RoundState,
    pub posts: Vec<Post>,
    pub created_at: DateTime<Utc>,
}

impl Round {
    pub fn create(user_query: impl Into<String>) -> Self {
        Self {
            id: format!("round-{}", uuid::Uuid::new_v4()),
            user_query: user_query.into(),
            state: RoundState::Created,
            posts: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn add_post(&mut self, post: Post) {
        self.posts.push(post);
    }

    pub fn last_post(&self) -> Option<&Post> {
        self.posts.last()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Load a round, stripping unknown-kind attachments from every post.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let mut round: Round = serde_json::from_value(value)?;
        for post in &mut round.posts {
            post.attachments.retain(|a| a.kind.is_known());
        }
        Ok(round)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_starts_created() {
        let round = Round::create("hello");
        assert_eq!(round.state, RoundState::Created);
        assert!(!round.state.is_terminal());
        assert!(round.posts.is_empty());
    }

    #[test]
    fn test_round_round_trips() {
        let mut round = Round::create("query");
        round.add_post(Post::new("User").with_send_to("Planner").with_message("query"));
        let back = Round::from_value(round.to_value()).expect("load");
        assert_eq!(round, back);
    }
}
