use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;

use crate::{
    AttachmentKind, CompactedMessage, Conversation, EntryScope, Post, Round, RoundState,
    SharedMemoryEntry,
};

/// Invoked after a round is appended, with the new total round count.
pub type RoundAddedCallback = Box<dyn Fn(usize) + Send + Sync>;

/// Per-role compaction attachment point.
///
/// The store never calls into a provider while holding its own lock.
pub trait CompactionProvider: Send + Sync {
    fn get_compaction(&self) -> Option<CompactedMessage>;
    fn notify_rounds_changed(&self, total_rounds: usize);
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("unknown role: {0}")]
    UnknownRole(String),
    #[error("round not found: {0}")]
    RoundNotFound(String),
    #[error("round {round_id} is already {from:?}; cannot move to {to:?}")]
    InvalidTransition {
        round_id: String,
        from: RoundState,
        to: RoundState,
    },
}

/// Roles that are always addressable without registration.
const BUILTIN_ROLES: [&str; 2] = ["User", "Unknown"];

/// The Conversation Store: exclusive owner of all rounds and posts for one
/// session. All mutating operations are serialized; readers observe
/// consistent snapshots.
pub struct Memory {
    session_id: String,
    conversation: RwLock<Conversation>,
    roles: RwLock<HashSet<String>>,
    callbacks: Mutex<Vec<RoundAddedCallback>>,
    compaction: RwLock<HashMap<String, Arc<dyn CompactionProvider>>>,
}

impl Memory {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            conversation: RwLock::new(Conversation::init()),
            roles: RwLock::new(HashSet::new()),
            callbacks: Mutex::new(Vec::new()),
            compaction: RwLock::new(HashMap::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Register a role alias as a valid sender/receiver.
    pub fn register_role(&self, alias: impl Into<String>) {
        self.roles.write().expect("roles lock").insert(alias.into());
    }

    pub fn is_known_role(&self, alias: &str) -> bool {
        BUILTIN_ROLES.contains(&alias) || self.roles.read().expect("roles lock").contains(alias)
    }

    /// Append a new round and notify round-added observers.
    pub fn create_round(&self, user_query: impl Into<String>) -> Round {
        let round = Round::create(user_query);
        let total = {
            let mut conversation = self.conversation.write().expect("conversation lock");
            conversation.add_round(round.clone());
            conversation.rounds.len()
        };

        // Observers run outside the store lock; they must not re-enter
        // mutating operations.
        for callback in self.callbacks.lock().expect("callbacks lock").iter() {
            callback(total);
        }
        let providers: Vec<Arc<dyn CompactionProvider>> = self
            .compaction
            .read()
            .expect("compaction lock")
            .values()
            .cloned()
            .collect();
        for provider in providers {
            provider.notify_rounds_changed(total);
        }
        round
    }

    pub fn append_post(&self, round_id: &str, post: Post) -> Result<(), MemoryError> {
        if !self.is_known_role(&post.send_from) {
            return Err(MemoryError::UnknownRole(post.send_from));
        }
        if !self.is_known_role(&post.send_to) {
            return Err(MemoryError::UnknownRole(post.send_to));
        }
        let mut conversation = self.conversation.write().expect("conversation lock");
        let round = conversation
            .round_by_id_mut(round_id)
            .ok_or_else(|| MemoryError::RoundNotFound(round_id.to_string()))?;
        round.add_post(post);
        Ok(())
    }

    /// Move a round to a terminal state. Transitions are monotonic; a
    /// terminal round cannot change state again.
    pub fn update_round_state(&self, round_id: &str, state: RoundState) -> Result<(), MemoryError> {
        let mut conversation = self.conversation.write().expect("conversation lock");
        let round = conversation
            .round_by_id_mut(round_id)
            .ok_or_else(|| MemoryError::RoundNotFound(round_id.to_string()))?;
        if round.state.is_terminal() && round.state != state {
            return Err(MemoryError::InvalidTransition {
                round_id: round_id.to_string(),
                from: round.state,
                to: state,
            });
        }
        round.state = state;
        Ok(())
    }

    pub fn total_rounds(&self) -> usize {
        self.conversation.read().expect("conversation lock").rounds.len()
    }

    /// Point-in-time snapshot of the whole conversation.
    pub fn conversation_snapshot(&self) -> Conversation {
        self.conversation.read().expect("conversation lock").clone()
    }

    pub fn round_snapshot(&self, round_id: &str) -> Result<Round, MemoryError> {
        self.conversation
            .read()
            .expect("conversation lock")
            .round_by_id(round_id)
            .cloned()
            .ok_or_else(|| MemoryError::RoundNotFound(round_id.to_string()))
    }

    /// Rounds involving `role` as sender or receiver, excluding failed
    /// rounds unless `include_failures`. Each returned round carries only
    /// the posts visible to the role.
    pub fn get_role_rounds(
        &self,
        role: &str,
        include_failures: bool,
    ) -> Result<Vec<Round>, MemoryError> {
        if !self.is_known_role(role) {
            return Err(MemoryError::UnknownRole(role.to_string()));
        }
        let conversation = self.conversation.read().expect("conversation lock");
        let mut out = Vec::new();
        for round in &conversation.rounds {
            if round.state == RoundState::Failed && !include_failures {
                continue;
            }
            let mut filtered = Round {
                id: round.id.clone(),
                user_query: round.user_query.clone(),
                state: round.state,
                posts: Vec::new(),
                created_at: round.created_at,
            };
            for post in &round.posts {
                if post.send_from == role || post.send_to == role {
                    filtered.posts.push(post.clone());
                }
            }
            out.push(filtered);
        }
        Ok(out)
    }

    /// Role rounds together with the role's current compaction, if any.
    pub fn get_role_rounds_with_compaction(
        &self,
        role: &str,
        include_failures: bool,
    ) -> Result<(Vec<Round>, Option<CompactedMessage>), MemoryError> {
        let rounds = self.get_role_rounds(role, include_failures)?;
        let compaction = self
            .compaction
            .read()
            .expect("compaction lock")
            .get(role)
            .and_then(|p| p.get_compaction());
        Ok((rounds, compaction))
    }

    pub fn register_round_callback(&self, callback: RoundAddedCallback) {
        self.callbacks.lock().expect("callbacks lock").push(callback);
    }

    /// Attach a compaction provider for a role. The first registration for a
    /// role wins; later ones are ignored.
    pub fn register_compaction_provider(&self, role: &str, provider: Arc<dyn CompactionProvider>) {
        let mut providers = self.compaction.write().expect("compaction lock");
        providers.entry(role.to_string()).or_insert(provider);
    }

    /// Collect shared memory entries of the given type, in emission order.
    ///
    /// Round-scoped entries are only visible while their round is the last
    /// round; when multiple entries share a sender, the latest wins.
    pub fn get_shared_memory_entries(&self, entry_type: &str) -> Vec<SharedMemoryEntry> {
        let conversation = self.conversation.read().expect("conversation lock");
        let last_round_id = conversation.rounds.last().map(|r| r.id.clone());
        let mut by_sender: HashMap<String, (SharedMemoryEntry, usize)> = HashMap::new();
        let mut order_at = 0usize;

        for round in &conversation.rounds {
            let is_last_round = Some(&round.id) == last_round_id.as_ref();
            for post in &round.posts {
                for attachment in &post.attachments {
                    if attachment.kind != AttachmentKind::SharedMemoryEntry {
                        continue;
                    }
                    let Ok(entry) =
                        serde_json::from_value::<SharedMemoryEntry>(attachment.extra.clone())
                    else {
                        tracing::warn!(
                            attachment_id = %attachment.id,
                            "shared memory attachment with undecodable extra; skipping"
                        );
                        continue;
                    };
                    if entry.entry_type != entry_type {
                        continue;
                    }
                    if entry.scope == EntryScope::Conversation || is_last_round {
                        by_sender.insert(post.send_from.clone(), (entry, order_at));
                        order_at += 1;
                    }
                }
            }
        }

        let mut entries: Vec<(SharedMemoryEntry, usize)> = by_sender.into_values().collect();
        entries.sort_by_key(|(_, at)| *at);
        entries.into_iter().map(|(entry, _)| entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Attachment;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn memory_with_roles() -> Memory {
        let memory = Memory::new("s1");
        memory.register_role("Planner");
        memory.register_role("CodeInterpreter");
        memory
    }

    #[test]
    fn test_rounds_are_contiguous_and_one_indexed() {
        let memory = memory_with_roles();
        let first = memory.create_round("a");
        let second = memory.create_round("b");

        let snapshot = memory.conversation_snapshot();
        assert_eq!(snapshot.round_index(&first.id), Some(1));
        assert_eq!(snapshot.round_index(&second.id), Some(2));
        assert_eq!(memory.total_rounds(), 2);
    }

    #[test]
    fn test_append_post_rejects_unknown_round() {
        let memory = memory_with_roles();
        let err = memory
            .append_post("round-missing", Post::new("User").with_send_to("Planner"))
            .unwrap_err();
        assert!(matches!(err, MemoryError::RoundNotFound(_)));
    }

    #[test]
    fn test_append_post_rejects_unknown_role() {
        let memory = memory_with_roles();
        let round = memory.create_round("q");
        let err = memory
            .append_post(&round.id, Post::new("Impostor").with_send_to("Planner"))
            .unwrap_err();
        assert!(matches!(err, MemoryError::UnknownRole(_)));
    }

    #[test]
    fn test_role_rounds_filter_posts_and_failed_rounds() {
        let memory = memory_with_roles();
        let r1 = memory.create_round("one");
        memory
            .append_post(&r1.id, Post::new("User").with_send_to("Planner"))
            .unwrap();
        memory
            .append_post(
                &r1.id,
                Post::new("Planner").with_send_to("CodeInterpreter"),
            )
            .unwrap();
        memory
            .append_post(&r1.id, Post::new("CodeInterpreter").with_send_to("Planner"))
            .unwrap();
        memory.update_round_state(&r1.id, RoundState::Failed).unwrap();

        let r2 = memory.create_round("two");
        memory
            .append_post(&r2.id, Post::new("User").with_send_to("Planner"))
            .unwrap();
        memory
            .append_post(&r2.id, Post::new("Planner").with_send_to("User"))
            .unwrap();
        memory.update_round_state(&r2.id, RoundState::Finished).unwrap();

        let visible = memory.get_role_rounds("Planner", false).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, r2.id);

        let with_failures = memory.get_role_rounds("Planner", true).unwrap();
        assert_eq!(with_failures.len(), 2);
        // CodeInterpreter never saw the user post of round two.
        let ci = memory.get_role_rounds("CodeInterpreter", true).unwrap();
        assert!(ci[1].posts.is_empty());
    }

    #[test]
    fn test_role_rounds_rejects_unknown_role() {
        let memory = memory_with_roles();
        assert!(matches!(
            memory.get_role_rounds("Nobody", false),
            Err(MemoryError::UnknownRole(_))
        ));
    }

    #[test]
    fn test_round_state_is_monotonic() {
        let memory = memory_with_roles();
        let round = memory.create_round("q");
        memory.update_round_state(&round.id, RoundState::Finished).unwrap();
        let err = memory
            .update_round_state(&round.id, RoundState::Failed)
            .unwrap_err();
        assert!(matches!(err, MemoryError::InvalidTransition { .. }));
    }

    #[test]
    fn test_round_callbacks_see_total() {
        let memory = memory_with_roles();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        memory.register_round_callback(Box::new(move |total| {
            seen_cb.store(total, Ordering::SeqCst);
        }));
        memory.create_round("a");
        memory.create_round("b");
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_shared_memory_round_scope_only_visible_in_last_round() {
        let memory = memory_with_roles();
        let r1 = memory.create_round("one");
        let entry = SharedMemoryEntry::new("experience", EntryScope::Round, "old");
        let mut post = Post::new("Planner").with_send_to("User");
        post.add_attachment(
            Attachment::new(AttachmentKind::SharedMemoryEntry, "")
                .with_extra(serde_json::to_value(&entry).unwrap()),
        );
        memory.append_post(&r1.id, post).unwrap();

        assert_eq!(memory.get_shared_memory_entries("experience").len(), 1);

        memory.create_round("two");
        assert!(memory.get_shared_memory_entries("experience").is_empty());
    }

    #[test]
    fn test_shared_memory_conversation_scope_keeps_latest_per_sender() {
        let memory = memory_with_roles();
        let r1 = memory.create_round("one");
        for content in ["first", "second"] {
            let entry = SharedMemoryEntry::new("notes", EntryScope::Conversation, content);
            let mut post = Post::new("Planner").with_send_to("User");
            post.add_attachment(
                Attachment::new(AttachmentKind::SharedMemoryEntry, "")
                    .with_extra(serde_json::to_value(&entry).unwrap()),
            );
            memory.append_post(&r1.id, post).unwrap();
        }
        let entries = memory.get_shared_memory_entries("notes");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "second");
    }
}
