//! Backpressure validation of claimed completions.
//!
//! A session claiming "done" must prove it: the `build.done` payload has to
//! carry textual evidence that tests and lint passed. The scan is a tolerant
//! case-insensitive substring search — the assistant is a black box whose
//! free text is the only signal, so a stricter scheme would just move the
//! unreliability up a layer.

use crate::config::BackpressureConfig;
use crate::events::{self, Event};

/// Evidence parsed out of a completion payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEvidence {
    pub tests_passed: bool,
    pub lint_passed: bool,
}

impl CompletionEvidence {
    /// Parses evidence from a completion payload.
    pub fn parse(payload: &str) -> Self {
        let lower = payload.to_lowercase();
        Self {
            tests_passed: lower.contains("tests: pass") || lower.contains("test pass"),
            lint_passed: lower.contains("lint: pass") || lower.contains("lint pass"),
        }
    }

    /// Returns true if every evidence the configuration requires is present.
    pub fn satisfies(&self, config: &BackpressureConfig) -> bool {
        (!config.require_tests || self.tests_passed) && (!config.require_lint || self.lint_passed)
    }
}

/// Validates that a claimed completion carries the required evidence.
///
/// Looks for the first `build.done` / `init.done` event; absent a completion
/// event this returns false regardless of configuration.
pub fn validate_completion(events: &[Event], config: &BackpressureConfig) -> bool {
    let payload = events
        .iter()
        .find(|e| e.topic == events::topic::BUILD_DONE || e.topic == events::topic::INIT_DONE)
        .map(|e| e.payload.as_str());

    match payload {
        Some(payload) => CompletionEvidence::parse(payload).satisfies(config),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;

    fn config(require_tests: bool, require_lint: bool) -> BackpressureConfig {
        BackpressureConfig {
            require_tests,
            require_lint,
        }
    }

    #[test]
    fn full_evidence_passes() {
        let events = vec![Event::new("build.done", "tests: pass, lint: pass")];
        assert!(validate_completion(&events, &config(true, true)));
    }

    #[test]
    fn evidence_scan_is_case_insensitive() {
        let events = vec![Event::new("build.done", "Tests: PASS, Lint: Pass")];
        assert!(validate_completion(&events, &config(true, true)));
    }

    #[test]
    fn missing_lint_rejected_when_required() {
        let events = vec![Event::new("build.done", "tests: pass")];
        assert!(!validate_completion(&events, &config(true, true)));
        assert!(validate_completion(&events, &config(true, false)));
    }

    #[test]
    fn missing_tests_rejected_when_required() {
        let events = vec![Event::new("build.done", "lint: pass")];
        assert!(!validate_completion(&events, &config(true, true)));
        assert!(validate_completion(&events, &config(false, true)));
    }

    #[test]
    fn no_completion_event_is_always_invalid() {
        let events = vec![Event::new("build.blocked", "stuck")];
        assert!(!validate_completion(&events, &config(false, false)));
        assert!(!validate_completion(&[], &config(false, false)));
    }

    #[test]
    fn nothing_required_needs_only_the_event() {
        let events = vec![Event::new("init.done", "plan written")];
        assert!(validate_completion(&events, &config(false, false)));
    }

    #[test]
    fn evidence_parse_flags() {
        let ev = CompletionEvidence::parse("tests: pass but lint: fail");
        assert!(ev.tests_passed);
        assert!(!ev.lint_passed);
    }
}
