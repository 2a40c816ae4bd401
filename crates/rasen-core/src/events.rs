//! Event extraction from assistant output.
//!
//! Events are the sole structured channel from the assistant back to the
//! supervisor: `<event topic="build.done">tests: pass, lint: pass</event>`.
//! Extraction is deliberately tolerant — multi-line payloads are accepted,
//! malformed tags are skipped, and unrecognized topics are retained so that
//! new topics do not require parser changes.

use regex::Regex;
use std::sync::OnceLock;

/// Recognized event topics.
pub mod topic {
    pub const INIT_DONE: &str = "init.done";
    pub const BUILD_DONE: &str = "build.done";
    pub const BUILD_BLOCKED: &str = "build.blocked";
    pub const REVIEW_APPROVED: &str = "review.approved";
    pub const REVIEW_CHANGES_REQUESTED: &str = "review.changes_requested";
    pub const QA_APPROVED: &str = "qa.approved";
    pub const QA_REJECTED: &str = "qa.rejected";
}

/// An event extracted from assistant output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub topic: String,
    pub payload: String,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

fn event_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // (?s) so payloads may span lines.
        Regex::new(r#"(?s)<event\s+topic="([^"]+)">(.*?)</event>"#)
            .expect("event regex is valid")
    })
}

/// Extracts all `<event>` tags from raw assistant output.
///
/// Topic and payload are both whitespace-stripped. Anything that does not
/// match the tag shape is ignored.
pub fn parse_events(output: &str) -> Vec<Event> {
    event_regex()
        .captures_iter(output)
        .map(|cap| Event::new(cap[1].trim(), cap[2].trim()))
        .collect()
}

/// Returns true if any event signals completion (`build.done` or `init.done`).
pub fn has_completion_event(events: &[Event]) -> bool {
    events
        .iter()
        .any(|e| e.topic == topic::BUILD_DONE || e.topic == topic::INIT_DONE)
}

/// Returns true if any event signals a block.
pub fn has_blocked_event(events: &[Event]) -> bool {
    events.iter().any(|e| e.topic == topic::BUILD_BLOCKED)
}

/// Payload of the first event with the given topic.
pub fn event_payload<'a>(events: &'a [Event], wanted: &str) -> Option<&'a str> {
    events
        .iter()
        .find(|e| e.topic == wanted)
        .map(|e| e.payload.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_event() {
        let events = parse_events(r#"done <event topic="build.done">tests: pass</event>"#);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].topic, "build.done");
        assert_eq!(events[0].payload, "tests: pass");
    }

    #[test]
    fn parses_multiline_payload() {
        let output = "<event topic=\"qa.rejected\">\nmissing validation\nflaky test\n</event>";
        let events = parse_events(output);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, "missing validation\nflaky test");
    }

    #[test]
    fn parses_multiple_events_in_order() {
        let output = r#"
            <event topic="build.done">tests: pass, lint: pass</event>
            <event topic="custom.note">kept for forward compat</event>
        "#;
        let events = parse_events(output);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].topic, "build.done");
        assert_eq!(events[1].topic, "custom.note");
    }

    #[test]
    fn ignores_malformed_tags() {
        let output = r#"<event topic=build.done>no quotes</event> <event>no topic</event>"#;
        assert!(parse_events(output).is_empty());
    }

    #[test]
    fn strips_whitespace_from_topic_and_payload() {
        let events = parse_events("<event topic=\" build.done \">  tests: pass  </event>");
        assert_eq!(events[0].topic, "build.done");
        assert_eq!(events[0].payload, "tests: pass");
    }

    #[test]
    fn completion_and_blocked_detection() {
        let done = vec![Event::new(topic::INIT_DONE, "")];
        assert!(has_completion_event(&done));
        assert!(!has_blocked_event(&done));

        let blocked = vec![Event::new(topic::BUILD_BLOCKED, "stuck on auth")];
        assert!(!has_completion_event(&blocked));
        assert!(has_blocked_event(&blocked));
    }

    #[test]
    fn event_payload_returns_first_match() {
        let events = vec![
            Event::new("qa.rejected", "first"),
            Event::new("qa.rejected", "second"),
        ];
        assert_eq!(event_payload(&events, "qa.rejected"), Some("first"));
        assert_eq!(event_payload(&events, "qa.approved"), None);
    }
}
