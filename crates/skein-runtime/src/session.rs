use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};

use skein_compaction::ContextCompactor;
use skein_events::{SessionEventEmitter, SessionEventType};
use skein_memory::{AttachmentKind, Memory, Post, Round, RoundState};

use crate::role::{Role, RoleContext};
use crate::SessionError;

/// One conversation session: the store, the bus, the planner and its
/// workers, and the background compactors, wired together.
pub struct Session {
    session_id: String,
    memory: Arc<Memory>,
    emitter: Arc<SessionEventEmitter>,
    planner: Arc<dyn Role>,
    workers: HashMap<String, Arc<dyn Role>>,
    compactors: Vec<Arc<ContextCompactor>>,
    session_vars: Arc<Mutex<HashMap<String, String>>>,
    max_internal_hops: usize,
}

pub struct SessionBuilder {
    session_id: String,
    planner: Option<Arc<dyn Role>>,
    workers: Vec<Arc<dyn Role>>,
    compactors: Vec<Arc<ContextCompactor>>,
    max_internal_hops: usize,
}

impl SessionBuilder {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            planner: None,
            workers: Vec::new(),
            compactors: Vec::new(),
            max_internal_hops: 10,
        }
    }

    pub fn planner(mut self, planner: Arc<dyn Role>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn worker(mut self, worker: Arc<dyn Role>) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn compactor(mut self, compactor: Arc<ContextCompactor>) -> Self {
        self.compactors.push(compactor);
        self
    }

    pub fn max_internal_hops(mut self, max: usize) -> Self {
        self.max_internal_hops = max;
        self
    }

    pub fn build(self) -> Result<Session, SessionError> {
        let planner = self
            .planner
            .ok_or_else(|| SessionError::Bootstrap("a planner role is required".to_string()))?;
        let memory = Arc::new(Memory::new(self.session_id.clone()));
        memory.register_role(planner.alias());
        let mut workers = HashMap::new();
        for worker in self.workers {
            memory.register_role(worker.alias());
            workers.insert(worker.alias().to_string(), worker);
        }
        let emitter = Arc::new(SessionEventEmitter::new());
        emitter.emit_session_event(SessionEventType::SessionStart, &self.session_id);
        Ok(Session {
            session_id: self.session_id,
            memory,
            emitter,
            planner,
            workers,
            compactors: self.compactors,
            session_vars: Arc::new(Mutex::new(HashMap::new())),
            max_internal_hops: self.max_internal_hops,
        })
    }
}

impl Session {
    pub fn builder(session_id: impl Into<String>) -> SessionBuilder {
        SessionBuilder::new(session_id)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn memory(&self) -> &Arc<Memory> {
        &self.memory
    }

    pub fn emitter(&self) -> &Arc<SessionEventEmitter> {
        &self.emitter
    }

    /// Register a compactor with the store and start its worker.
    pub fn attach_compactor(&mut self, role: &str, compactor: Arc<ContextCompactor>) {
        compactor.start();
        self.memory.register_compaction_provider(role, compactor.clone());
        self.compactors.push(compactor);
    }

    pub fn set_session_var(&self, name: impl Into<String>, value: impl Into<String>) {
        self.session_vars
            .lock()
            .expect("session vars lock")
            .insert(name.into(), value.into());
    }

    /// Working directory of the first worker with an execution session.
    pub fn execution_cwd(&self) -> Option<PathBuf> {
        self.workers.values().find_map(|w| w.execution_cwd())
    }

    /// Forward an uploaded file to the first worker that handles it.
    pub fn upload_file(&self, name: &str, content: &[u8]) -> Result<bool, SessionError> {
        for worker in self.workers.values() {
            let handled = worker.stage_file(name, content).map_err(|source| {
                SessionError::RoleFailed {
                    role: worker.alias().to_string(),
                    source,
                }
            })?;
            if handled {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Drive one conversation turn to completion.
    ///
    /// The round finishes when a post is addressed to the user or carries a
    /// `stop` attachment; any role failure fails the round and propagates.
    pub fn send_message(&self, user_query: &str) -> Result<Round, SessionError> {
        self.send_message_with_files(user_query, &[])
    }

    pub fn send_message_with_files(
        &self,
        user_query: &str,
        files: &[(String, Vec<u8>)],
    ) -> Result<Round, SessionError> {
        for (name, content) in files {
            if let Err(err) = self.upload_file(name, content) {
                tracing::warn!(file = %name, error = %err, "failed to stage uploaded file");
            }
        }

        let round = self.memory.create_round(user_query);
        self.emitter.start_round(&round.id);
        tracing::info!(
            session_id = %self.session_id,
            round_id = %round.id,
            "round started"
        );

        let outcome = self.drive_round(&round.id, user_query);
        match outcome {
            Ok(()) => {
                self.memory
                    .update_round_state(&round.id, RoundState::Finished)?;
                self.emitter.end_round(&round.id);
                Ok(self.memory.round_snapshot(&round.id)?)
            }
            Err(err) => {
                if let Err(state_err) = self
                    .memory
                    .update_round_state(&round.id, RoundState::Failed)
                {
                    tracing::error!(error = %state_err, "failed to mark round as failed");
                }
                self.emitter.fail_round(&round.id, &err.to_string());
                self.emitter.end_round(&round.id);
                tracing::warn!(
                    session_id = %self.session_id,
                    round_id = %round.id,
                    error = %err,
                    "round failed"
                );
                Err(err)
            }
        }
    }

    fn drive_round(&self, round_id: &str, user_query: &str) -> Result<(), SessionError> {
        self.memory.append_post(
            round_id,
            Post::new("User")
                .with_send_to(self.planner.alias())
                .with_message(user_query),
        )?;

        let ctx = RoleContext {
            emitter: self.emitter.clone(),
            round_id: round_id.to_string(),
            session_vars: self.session_vars.clone(),
            retries_used: Arc::new(AtomicUsize::new(0)),
        };

        let mut current = self.planner.clone();
        let mut hops = 0usize;
        loop {
            if hops >= self.max_internal_hops {
                return Err(SessionError::HopLimitExceeded(hops));
            }
            let post = current
                .reply(&self.memory, &ctx)
                .map_err(|source| SessionError::RoleFailed {
                    role: current.alias().to_string(),
                    source,
                })?;
            let send_to = post.send_to.clone();
            let stopped = send_to == "User" || post.has_attachment(AttachmentKind::Stop);
            self.memory.append_post(round_id, post)?;
            if stopped {
                return Ok(());
            }

            current = if send_to == self.planner.alias() {
                self.planner.clone()
            } else {
                self.workers
                    .get(&send_to)
                    .cloned()
                    .ok_or(SessionError::UnknownRole(send_to))?
            };
            hops += 1;
        }
    }

    /// Tear the session down: cancel outstanding confirmations, stop the
    /// compactors, and release role resources.
    pub fn stop(&self) {
        self.emitter
            .emit_session_event(SessionEventType::SessionEnd, &self.session_id);
        self.emitter.teardown();
        for compactor in &self.compactors {
            compactor.stop();
        }
        for worker in self.workers.values() {
            worker.shutdown();
        }
        self.planner.shutdown();
        tracing::info!(session_id = %self.session_id, "session stopped");
    }
}
