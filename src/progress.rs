//! Download progress side channel.
//!
//! The pipeline is the only writer for its session; pollers read whatever
//! was written last.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStage {
    #[default]
    Init,
    Download,
    Tar,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressState {
    pub active: bool,
    pub current: u64,
    pub total: u64,
    pub percent: u8,
    pub message: String,
    pub stage: ProgressStage,
}

/// What pollers get when no download is running for their session.
pub fn idle_state() -> ProgressState {
    ProgressState {
        message: "no active download".to_string(),
        ..ProgressState::default()
    }
}

/// `round(current / total * 100)`, clamped to 0..=100.  Zero total is 0%.
pub fn percent(current: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (current as f64 / total as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

/// Keyed progress slots, one per session.
pub trait ProgressStore: Send + Sync {
    fn name(&self) -> &'static str;
    fn set(&self, session: &str, state: ProgressState);
    fn get(&self, session: &str) -> Option<ProgressState>;
    fn clear(&self, session: &str);
}

/// Lock-guarded in-memory store.  Last write wins.
#[derive(Default)]
pub struct MemoryProgressStore {
    states: Mutex<HashMap<String, ProgressState>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ProgressState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProgressStore for MemoryProgressStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn set(&self, session: &str, state: ProgressState) {
        self.lock().insert(session.to_string(), state);
    }

    fn get(&self, session: &str) -> Option<ProgressState> {
        self.lock().get(session).cloned()
    }

    fn clear(&self, session: &str) {
        self.lock().remove(session);
    }
}

/// Drops every update.  For library callers that do not poll.
pub struct NoopProgressStore;

impl ProgressStore for NoopProgressStore {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn set(&self, _session: &str, _state: ProgressState) {}

    fn get(&self, _session: &str) -> Option<ProgressState> {
        None
    }

    fn clear(&self, _session: &str) {}
}

/// Renders updates on a terminal progress bar.  Sessions are ignored; the
/// CLI runs one download at a time.
pub struct BarProgressStore {
    bar: ProgressBar,
    last: Mutex<Option<ProgressState>>,
}

impl BarProgressStore {
    pub fn new() -> Self {
        Self::with_bar(ProgressBar::new(100))
    }

    pub fn with_bar(bar: ProgressBar) -> Self {
        if let Ok(style) =
            ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        Self {
            bar,
            last: Mutex::new(None),
        }
    }

    pub fn bar(&self) -> &ProgressBar {
        &self.bar
    }
}

impl Default for BarProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressStore for BarProgressStore {
    fn name(&self) -> &'static str {
        "terminal"
    }

    fn set(&self, _session: &str, state: ProgressState) {
        self.bar.set_position(u64::from(state.percent));
        self.bar.set_message(state.message.clone());
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(state);
    }

    fn get(&self, _session: &str) -> Option<ProgressState> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn clear(&self, _session: &str) {
        self.bar.finish_and_clear();
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Writes checkpoint updates for one session.
#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<dyn ProgressStore>,
    session: String,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn ProgressStore>, session: impl Into<String>) -> Self {
        Self {
            store,
            session: session.into(),
        }
    }

    /// A reporter whose updates go nowhere.
    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopProgressStore), "")
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn preparing(&self) {
        self.set(ProgressStage::Init, 0, 0, "Preparing download...".to_string());
    }

    pub fn downloading(&self, total: u64) {
        self.set(
            ProgressStage::Download,
            0,
            total,
            format!("Starting download of {} layers...", total),
        );
    }

    /// `current` is 1-based.
    pub fn layer(&self, current: u64, total: u64) {
        self.set(
            ProgressStage::Download,
            current,
            total,
            format!("Downloading layer {} of {}...", current, total),
        );
    }

    pub fn packing(&self, total: u64) {
        self.store.set(
            &self.session,
            ProgressState {
                active: true,
                current: total,
                total,
                percent: 100,
                message: "Building archive...".to_string(),
                stage: ProgressStage::Tar,
            },
        );
    }

    /// Clear the slot; called on success and on failure.
    pub fn finish(&self) {
        self.store.clear(&self.session);
    }

    pub fn current(&self) -> ProgressState {
        self.store.get(&self.session).unwrap_or_else(idle_state)
    }

    fn set(&self, stage: ProgressStage, current: u64, total: u64, message: String) {
        self.store.set(
            &self.session,
            ProgressState {
                active: true,
                current,
                total,
                percent: percent(current, total),
                message,
                stage,
            },
        );
    }
}
