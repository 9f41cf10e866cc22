//! Turn-taking: outstanding-mark accounting and interruption detection.
//!
//! While any mark is outstanding the far end is still hearing this agent's
//! voice. Caller speech detected in that window, long enough to pass the
//! noise filter, is an interruption: the session sends one clear signal and
//! the mark set is emptied optimistically.

use std::collections::HashSet;
use tracing::debug;

/// Configuration for interruption detection.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Minimum utterance length (chars, after trimming) that counts as an
    /// interruption. Rejects noise and backchannel sounds ("mm", "ok").
    pub min_utterance_chars: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            min_utterance_chars: 5,
        }
    }
}

/// Tracks utterances that have been handed to the transport but not yet
/// confirmed played.
///
/// Two states: Idle (no outstanding marks) and Speaking (at least one).
#[derive(Debug)]
pub struct TurnMonitor {
    config: TurnConfig,
    outstanding: HashSet<String>,
}

impl TurnMonitor {
    pub fn new(config: TurnConfig) -> Self {
        Self {
            config,
            outstanding: HashSet::new(),
        }
    }

    /// A segment finished frame emission; its mark is now outstanding.
    pub fn audio_sent(&mut self, mark: String) {
        self.outstanding.insert(mark);
    }

    /// The transport reported a mark as played. Acknowledgments for marks
    /// already discarded by an interruption are ignored.
    pub fn mark_played(&mut self, name: &str) {
        if !self.outstanding.remove(name) {
            debug!(mark = name, "acknowledgment for unknown or cleared mark");
        }
    }

    /// Caller speech while we are speaking. Returns true when the utterance
    /// passes the length filter and an interruption should be raised; the
    /// mark set is emptied in the same step, so at most one clear fires per
    /// burst of speech. Optimistic: whatever the far end still had queued is
    /// assumed dropped, and any late mark acknowledgment is ignored.
    pub fn on_utterance(&mut self, text: &str) -> bool {
        if self.outstanding.is_empty() {
            return false;
        }
        if text.trim().chars().count() <= self.config.min_utterance_chars {
            return false;
        }
        self.outstanding.clear();
        true
    }

    pub fn is_speaking(&self) -> bool {
        !self.outstanding.is_empty()
    }

    /// Current state (for testing/debugging).
    pub fn state(&self) -> &'static str {
        if self.outstanding.is_empty() {
            "idle"
        } else {
            "speaking"
        }
    }
}
