//! Stall detection.
//!
//! Three independent predicates guard against unproductive loops:
//!
//! - **No-commit stall**: a subtask keeps finishing sessions without a single
//!   commit.
//! - **Consecutive failures**: tracked by the loop driver itself (the counter
//!   lives in `LoopState`); the threshold comes from the same config block.
//! - **Circular approaches**: the assistant keeps paraphrasing the same
//!   failing idea, caught by word-set Jaccard similarity over the approach
//!   strings.
//!
//! The detector holds no state of its own across iterations; it reads the
//! attempt log through the recovery store each time it is asked, so there is
//! no cache to drift out of sync.

use crate::config::StallDetectionConfig;
use crate::stores::{RecoveryStore, StoreError};
use std::collections::HashSet;

/// Words too generic to carry signal in an approach description.
const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "then", "was", "are", "will",
    "have", "has", "not", "but", "when", "using",
];

/// A positive stall verdict, mapped to its termination reason by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallVerdict {
    /// Consecutive zero-commit sessions on this subtask.
    NoCommitStall,
    /// The recent approaches are rephrasings of each other.
    CircularApproaches,
}

/// Stateless stall detector over the recovery store's attempt log.
pub struct StallDetector<'a> {
    recovery: &'a RecoveryStore,
    config: &'a StallDetectionConfig,
}

impl<'a> StallDetector<'a> {
    pub fn new(recovery: &'a RecoveryStore, config: &'a StallDetectionConfig) -> Self {
        Self { recovery, config }
    }

    /// Checks the per-subtask predicates and returns the first positive
    /// verdict, if any.
    pub fn check(&self, subtask_id: &str) -> Result<Option<StallVerdict>, StoreError> {
        if self.no_commit_stall(subtask_id)? {
            return Ok(Some(StallVerdict::NoCommitStall));
        }
        if self.circular_approaches(subtask_id)? {
            return Ok(Some(StallVerdict::CircularApproaches));
        }
        Ok(None)
    }

    /// True when the N most recent sessions for this subtask each produced
    /// zero commits. A session that commits resets the streak by virtue of
    /// carrying a commit in its attempt record.
    fn no_commit_stall(&self, subtask_id: &str) -> Result<bool, StoreError> {
        let threshold = self.config.max_no_commit_sessions as usize;
        if threshold == 0 {
            return Ok(false);
        }
        let attempts = self.recovery.attempts_for(subtask_id)?;
        if attempts.len() < threshold {
            return Ok(false);
        }
        Ok(attempts
            .iter()
            .rev()
            .take(threshold)
            .all(|a| a.commit.is_none()))
    }

    /// True when the latest approach matches at least two of the three
    /// approaches recorded before it (Jaccard ≥ threshold).
    fn circular_approaches(&self, subtask_id: &str) -> Result<bool, StoreError> {
        let attempts = self.recovery.attempts_for(subtask_id)?;
        let approaches: Vec<&str> = attempts.iter().map(|a| a.approach.as_str()).collect();
        let Some((latest, earlier)) = approaches.split_last() else {
            return Ok(false);
        };
        if earlier.len() < 2 {
            return Ok(false);
        }

        let similar = earlier
            .iter()
            .rev()
            .take(3)
            .filter(|prior| jaccard_similarity(latest, prior) >= self.config.circular_fix_threshold)
            .count();

        Ok(similar >= 2)
    }
}

/// Jaccard similarity over significant words.
///
/// Words are lowercased; stop words and words of two characters or fewer are
/// dropped before comparison. Not a perfect test, but robust enough to catch
/// the common pattern of repeatedly paraphrasing the same failing idea.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let set_a = significant_words(a);
    let set_b = significant_words(b);

    if set_a.is_empty() && set_b.is_empty() {
        return 0.0;
    }

    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

fn significant_words(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2 && !STOP_WORDS.contains(w))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, RecoveryStore, StallDetectionConfig) {
        let tmp = TempDir::new().unwrap();
        let recovery = RecoveryStore::new(tmp.path());
        (tmp, recovery, StallDetectionConfig::default())
    }

    #[test]
    fn jaccard_identical_texts() {
        assert!((jaccard_similarity("retry database connection", "retry database connection") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn jaccard_disjoint_texts() {
        assert_eq!(
            jaccard_similarity("refactor parser module", "update websocket handshake"),
            0.0
        );
    }

    #[test]
    fn jaccard_ignores_stop_words_and_short_words() {
        // "to", "with", "the", "and" all drop out before comparison.
        let a = "try to retry with the timeout";
        let b = "retry and increase timeout";
        let sim = jaccard_similarity(a, b);
        assert!(sim >= 0.5, "similarity was {sim}");
    }

    #[test]
    fn no_commit_stall_trips_at_threshold() {
        let (_tmp, recovery, config) = setup();
        let detector = StallDetector::new(&recovery, &config);

        recovery.record_attempt("a", 1, false, "x", None).unwrap();
        recovery.record_attempt("a", 2, false, "y", None).unwrap();
        assert_eq!(detector.check("a").unwrap(), None);

        recovery.record_attempt("a", 3, false, "z", None).unwrap();
        assert_eq!(
            detector.check("a").unwrap(),
            Some(StallVerdict::NoCommitStall)
        );
    }

    #[test]
    fn commit_resets_no_commit_streak() {
        let (_tmp, recovery, config) = setup();
        let detector = StallDetector::new(&recovery, &config);

        recovery.record_attempt("a", 1, false, "x", None).unwrap();
        recovery.record_attempt("a", 2, false, "y", None).unwrap();
        recovery
            .record_attempt("a", 3, true, "landed it", Some("abc".to_string()))
            .unwrap();
        assert_eq!(detector.check("a").unwrap(), None);
    }

    #[test]
    fn circular_approaches_detected_on_paraphrases() {
        let (_tmp, recovery, config) = setup();
        let detector = StallDetector::new(&recovery, &config);

        // Commits present so the no-commit predicate stays quiet.
        let commit = Some("abc".to_string());
        recovery
            .record_attempt("a", 1, false, "increase connection timeout for database", commit.clone())
            .unwrap();
        recovery
            .record_attempt("a", 2, false, "increase database connection timeout", commit.clone())
            .unwrap();
        recovery
            .record_attempt("a", 3, false, "bump the database connection timeout higher", commit)
            .unwrap();

        assert_eq!(
            detector.check("a").unwrap(),
            Some(StallVerdict::CircularApproaches)
        );
    }

    #[test]
    fn distinct_approaches_do_not_trip_circular() {
        let (_tmp, recovery, config) = setup();
        let detector = StallDetector::new(&recovery, &config);

        let commit = Some("abc".to_string());
        recovery
            .record_attempt("a", 1, false, "switch serializer library", commit.clone())
            .unwrap();
        recovery
            .record_attempt("a", 2, false, "rewrite the caching layer", commit.clone())
            .unwrap();
        recovery
            .record_attempt("a", 3, false, "add integration coverage first", commit)
            .unwrap();

        assert_eq!(detector.check("a").unwrap(), None);
    }

    #[test]
    fn fewer_than_three_attempts_never_circular() {
        let (_tmp, recovery, config) = setup();
        let detector = StallDetector::new(&recovery, &config);

        let commit = Some("abc".to_string());
        recovery
            .record_attempt("a", 1, false, "same exact idea again", commit.clone())
            .unwrap();
        recovery
            .record_attempt("a", 2, false, "same exact idea again", commit)
            .unwrap();
        assert_eq!(detector.check("a").unwrap(), None);
    }
}
