//! Background, per-role summarization of conversation history.
//!
//! Each compactor owns one worker thread. `notify_rounds_changed` is
//! non-blocking and only signals the worker; the worker snapshots the
//! role's rounds, summarizes everything up to `total - retain_recent`, and
//! atomically replaces the previous [`CompactedMessage`]. The raw history
//! store is never mutated.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;

use skein_memory::{CompactedMessage, CompactionProvider, Memory, Round};

const MESSAGE_PREVIEW_CHARS: usize = 1024;

const DEFAULT_PROMPT_TEMPLATE: &str = "Summarize the following conversation history concisely.
Focus on: key decisions made, important information exchanged, and current state.
Preserve any critical details that would be needed to continue the conversation.

## Previous summary
{PREVIOUS_SUMMARY}

## Conversation to summarize
{content}

Provide a clear, structured summary:";

#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("summarization failed: {0}")]
    Summarization(String),
    #[error("summarizer returned an empty summary")]
    EmptySummary,
    #[error("prompt template error: {0}")]
    Template(String),
}

/// Compaction callback seam: renders a summary from the prepared prompt.
/// Implementations may block on network; they run off the orchestrator
/// thread.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, prompt: &str) -> Result<String, CompactionError>;
}

/// Supplies the rounds a compactor may summarize.
pub trait RoundsSource: Send + Sync {
    fn rounds(&self) -> Vec<Round>;
}

/// Rounds source backed by the Conversation Store, filtered to one role.
/// Holds a weak reference: compaction never keeps a session alive.
pub struct MemoryRoundsSource {
    memory: Weak<Memory>,
    role: String,
}

impl MemoryRoundsSource {
    pub fn new(memory: &Arc<Memory>, role: impl Into<String>) -> Self {
        Self {
            memory: Arc::downgrade(memory),
            role: role.into(),
        }
    }
}

impl RoundsSource for MemoryRoundsSource {
    fn rounds(&self) -> Vec<Round> {
        let Some(memory) = self.memory.upgrade() else {
            return Vec::new();
        };
        memory.get_role_rounds(&self.role, false).unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct CompactorConfig {
    /// Uncompacted round count that triggers a cycle.
    pub threshold: usize,
    /// Recent rounds always excluded from compaction.
    pub retain_recent: usize,
    pub prompt_template_path: Option<PathBuf>,
    pub enabled: bool,
    /// Bound on the join wait at shutdown; the worker is daemonic beyond it.
    pub shutdown_timeout: Duration,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            retain_recent: 3,
            prompt_template_path: None,
            enabled: true,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct WorkerSignals {
    work: bool,
    stop: bool,
}

struct CompactorInner {
    config: CompactorConfig,
    template: String,
    summarizer: Arc<dyn Summarizer>,
    source: Arc<dyn RoundsSource>,
    signals: Mutex<WorkerSignals>,
    cond: Condvar,
    // The worker thread is the sole writer.
    compacted: Mutex<Option<CompactedMessage>>,
    compacting: AtomicBool,
}

/// One background compactor per (session, role) that opts in.
pub struct ContextCompactor {
    inner: Arc<CompactorInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ContextCompactor {
    pub fn new(
        config: CompactorConfig,
        summarizer: Arc<dyn Summarizer>,
        source: Arc<dyn RoundsSource>,
    ) -> Self {
        let template = load_prompt_template(config.prompt_template_path.as_deref());
        Self {
            inner: Arc::new(CompactorInner {
                config,
                template,
                summarizer,
                source,
                signals: Mutex::new(WorkerSignals::default()),
                cond: Condvar::new(),
                compacted: Mutex::new(None),
                compacting: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the worker thread. Safe to call repeatedly; disabled
    /// compactors never spawn a worker.
    pub fn start(&self) {
        if !self.inner.config.enabled {
            return;
        }
        let mut worker = self.worker.lock().expect("worker lock");
        if worker.is_some() {
            return;
        }
        let inner = self.inner.clone();
        *worker = Some(std::thread::spawn(move || worker_loop(inner)));
        tracing::debug!("compactor worker started");
    }

    /// Stop the worker, waiting at most `shutdown_timeout` for it to drain.
    pub fn stop(&self) {
        {
            let mut signals = self.inner.signals.lock().expect("signals lock");
            signals.stop = true;
            self.inner.cond.notify_all();
        }
        let handle = self.worker.lock().expect("worker lock").take();
        if let Some(handle) = handle {
            let deadline = Instant::now() + self.inner.config.shutdown_timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                // Leave the thread detached; it exits at the next signal check.
                tracing::warn!("compactor worker did not stop in time; detaching");
            }
        }
        tracing::debug!("compactor worker stopped");
    }

    pub fn is_compacting(&self) -> bool {
        self.inner.compacting.load(Ordering::SeqCst)
    }

    pub fn compaction(&self) -> Option<CompactedMessage> {
        self.inner.compacted.lock().expect("compacted lock").clone()
    }
}

impl CompactionProvider for ContextCompactor {
    fn get_compaction(&self) -> Option<CompactedMessage> {
        self.compaction()
    }

    fn notify_rounds_changed(&self, total_rounds: usize) {
        if !self.inner.config.enabled {
            return;
        }
        let compacted_end = self
            .compaction()
            .map(|c| c.end_index)
            .unwrap_or(0);
        let uncompacted = total_rounds.saturating_sub(compacted_end);
        if uncompacted < self.inner.config.threshold {
            return;
        }
        if self.inner.compacting.load(Ordering::SeqCst) {
            return;
        }
        let mut signals = self.inner.signals.lock().expect("signals lock");
        signals.work = true;
        self.inner.cond.notify_all();
    }
}

fn worker_loop(inner: Arc<CompactorInner>) {
    loop {
        {
            let mut signals = inner.signals.lock().expect("signals lock");
            while !signals.work && !signals.stop {
                signals = inner.cond.wait(signals).expect("signals lock");
            }
            if signals.stop {
                return;
            }
            signals.work = false;
        }
        inner.compacting.store(true, Ordering::SeqCst);
        if let Err(err) = try_compact(&inner) {
            tracing::warn!(error = %err, "compaction cycle failed; keeping previous summary");
        }
        inner.compacting.store(false, Ordering::SeqCst);
    }
}

fn try_compact(inner: &CompactorInner) -> Result<(), CompactionError> {
    let rounds = inner.source.rounds();
    let total = rounds.len();
    if total == 0 {
        return Ok(());
    }

    let previous = inner.compacted.lock().expect("compacted lock").clone();
    let compacted_end = previous.as_ref().map(|c| c.end_index).unwrap_or(0);
    let uncompacted = total.saturating_sub(compacted_end);
    if uncompacted < inner.config.threshold {
        return Ok(());
    }

    let new_end = total.saturating_sub(inner.config.retain_recent);
    if new_end == 0 || compacted_end >= new_end {
        return Ok(());
    }

    tracing::info!(
        start = compacted_end + 1,
        end = new_end,
        uncompacted,
        "compacting conversation rounds"
    );

    let content = render_rounds(&rounds, compacted_end, new_end);
    let previous_summary = previous
        .as_ref()
        .map(|c| c.summary.as_str())
        .unwrap_or("None");
    let prompt = inner
        .template
        .replace("{PREVIOUS_SUMMARY}", previous_summary)
        .replace("{content}", &content);

    let summary = inner.summarizer.summarize(&prompt)?;
    if summary.trim().is_empty() {
        return Err(CompactionError::EmptySummary);
    }

    let mut compacted = inner.compacted.lock().expect("compacted lock");
    *compacted = Some(CompactedMessage {
        start_index: 1,
        end_index: new_end,
        summary,
    });
    tracing::info!(end = new_end, "compaction complete");
    Ok(())
}

fn render_rounds(rounds: &[Round], start_from: usize, new_end: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for (i, round) in rounds.iter().enumerate().take(new_end).skip(start_from) {
        parts.push(format!("\n--- Round {} ---", i + 1));
        parts.push(format!("User Query: {}", round.user_query));
        for post in &round.posts {
            parts.push(format!(
                "  {} -> {}: {}",
                post.send_from,
                post.send_to,
                preview(&post.message)
            ));
        }
    }
    parts.join("\n")
}

fn preview(message: &str) -> String {
    let count = message.chars().count();
    if count <= MESSAGE_PREVIEW_CHARS {
        return message.to_string();
    }
    let mut clipped: String = message.chars().take(MESSAGE_PREVIEW_CHARS).collect();
    clipped.push_str("...");
    clipped
}

fn load_prompt_template(path: Option<&Path>) -> String {
    let Some(path) = path else {
        return DEFAULT_PROMPT_TEMPLATE.to_string();
    };
    match std::fs::read_to_string(path)
        .map_err(|e| CompactionError::Template(e.to_string()))
        .and_then(|raw| {
            serde_yaml::from_str::<serde_yaml::Value>(&raw)
                .map_err(|e| CompactionError::Template(e.to_string()))
        }) {
        Ok(value) => value
            .get("content")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| DEFAULT_PROMPT_TEMPLATE.to_string()),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to load compaction prompt template; using default");
            DEFAULT_PROMPT_TEMPLATE.to_string()
        }
    }
}
