//! Conversation memory with bounded prompts.
//!
//! The store keeps an append-only log of turns. The window handed to the
//! model is always: the first two turns (system prompt and goal) verbatim, an
//! optional synthetic memory turn summarizing the middle of the log, the
//! trailing `window_size` turns verbatim, and an optional persistent-state
//! turn. Summaries are produced incrementally by a [`Summarizer`]; when it
//! fails a keyword heuristic takes over so the window is always produced.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::types::{RequestRecord, Role, Turn};

/// Number of anchoring turns (system prompt and goal) always kept verbatim.
pub const ANCHOR_TURNS: usize = 2;

pub const MEMORY_PREFIX: &str = "[Conversation memory]\n";
pub const STATE_PREFIX: &str = "[Persistent agent state]\n";

/// Truncations closer together than this raise a frequent-truncation alert.
const TRUNCATION_ALERT_WINDOW: Duration = Duration::from_secs(3600);

/// Max characters of each turn shown to the heuristic extractor.
const HEURISTIC_LINE_CHARS: usize = 200;
/// Max bullets the heuristic extractor emits per increment.
const HEURISTIC_MAX_BULLETS: usize = 20;

/// Produces rolling summaries of conversation turns.
pub trait Summarizer {
    /// Summarizes `turns`, folding in `previous` when it exists. `None` or an
    /// empty string means the summarizer could not help and the heuristic
    /// extractor is used instead.
    fn summarize(&self, previous: Option<&str>, turns: &[Turn]) -> Option<String>;
}

/// Summarizer that always defers to the heuristic extractor.
pub struct HeuristicOnly;

impl Summarizer for HeuristicOnly {
    fn summarize(&self, _previous: Option<&str>, _turns: &[Turn]) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextLimits {
    pub window_size: usize,
    pub min_messages_before_summary: usize,
    pub summary_char_limit: usize,
    pub max_request_history: usize,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            window_size: 20,
            min_messages_before_summary: 3,
            summary_char_limit: 5000,
            max_request_history: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SummaryMetrics {
    pub initial_summaries: u64,
    pub update_summaries: u64,
    pub heuristic_summaries: u64,
    pub total_turns_summarized: u64,
    pub truncation_count: u64,
    pub frequent_truncation_alerts: u64,
    pub summary_chars: usize,
    pub summarized_upto: usize,
}

#[derive(Debug)]
pub struct ContextStore {
    limits: ContextLimits,
    turns: Vec<Turn>,
    summary: Option<String>,
    /// Index one past the last turn folded into `summary`.
    summarized_upto: usize,
    requests: VecDeque<RequestRecord>,
    next_request_id: u64,
    metrics: SummaryMetrics,
    last_truncation: Option<Instant>,
}

impl ContextStore {
    pub fn new(limits: ContextLimits) -> Self {
        Self {
            limits,
            turns: Vec::new(),
            summary: None,
            summarized_upto: ANCHOR_TURNS,
            requests: VecDeque::new(),
            next_request_id: 1,
            metrics: SummaryMetrics::default(),
            last_truncation: None,
        }
    }

    pub fn limits(&self) -> ContextLimits {
        self.limits
    }

    pub fn append(&mut self, role: Role, content: impl Into<String>) {
        self.turns.push(Turn::new(role, content));
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Full, unsummarized log.
    pub fn transcript(&self) -> &[Turn] {
        &self.turns
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn summary_metrics(&self) -> SummaryMetrics {
        SummaryMetrics {
            summary_chars: self.summary.as_ref().map_or(0, |s| s.chars().count()),
            summarized_upto: self.summarized_upto,
            ..self.metrics.clone()
        }
    }

    /// Builds the bounded prompt window, folding newly aged-out turns into
    /// the rolling summary when enough of them have accumulated.
    pub fn window(&mut self, summarizer: &dyn Summarizer, state: Option<&Value>) -> Vec<Turn> {
        let window_size = self.limits.window_size;
        let mut window = Vec::new();

        if self.turns.len() <= ANCHOR_TURNS + window_size {
            window.extend(self.turns.iter().cloned());
        } else {
            let recent_start = self.turns.len() - window_size;
            let pending = recent_start.saturating_sub(self.summarized_upto);
            if pending > 0 && pending >= self.limits.min_messages_before_summary {
                let increment = self.turns[self.summarized_upto..recent_start].to_vec();
                let summary = self.summarize_increment(summarizer, &increment);
                self.store_summary(summary);
                self.metrics.total_turns_summarized += increment.len() as u64;
                self.summarized_upto = recent_start;
                debug!(
                    summarized = increment.len(),
                    summarized_upto = self.summarized_upto,
                    "context summary updated"
                );
            }

            window.extend(self.turns[..ANCHOR_TURNS].iter().cloned());
            if let Some(summary) = &self.summary {
                window.push(Turn::system(format!("{MEMORY_PREFIX}{summary}")));
            }
            window.extend(self.turns[recent_start..].iter().cloned());
        }

        if let Some(state) = state {
            window.push(Turn::system(format!("{STATE_PREFIX}{}", render_state(state))));
        }
        window
    }

    /// Summarizes `turns` on top of the current summary, preferring the
    /// summarizer and falling back to the heuristic extractor.
    pub fn summarize_increment(&mut self, summarizer: &dyn Summarizer, turns: &[Turn]) -> String {
        let previous = self.summary.as_deref();
        let delegated = summarizer
            .summarize(previous, turns)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        match delegated {
            Some(summary) => {
                if previous.is_some() {
                    self.metrics.update_summaries += 1;
                } else {
                    self.metrics.initial_summaries += 1;
                }
                summary
            }
            None => {
                self.metrics.heuristic_summaries += 1;
                let extracted = heuristic_summary(turns);
                match previous {
                    Some(previous) if !extracted.is_empty() => format!("{previous}\n{extracted}"),
                    Some(previous) => previous.to_string(),
                    None => extracted,
                }
            }
        }
    }

    fn store_summary(&mut self, summary: String) {
        let limit = self.limits.summary_char_limit;
        let total = summary.chars().count();
        if total <= limit {
            self.summary = Some(summary);
            return;
        }

        // Keep the newest material: drop from the front.
        let kept: String = summary.chars().skip(total - limit).collect();
        self.summary = Some(kept);
        self.metrics.truncation_count += 1;

        let now = Instant::now();
        let recent = self
            .last_truncation
            .is_some_and(|previous| now.duration_since(previous) < TRUNCATION_ALERT_WINDOW);
        if recent {
            self.metrics.frequent_truncation_alerts += 1;
            warn!(
                limit,
                truncations = self.metrics.truncation_count,
                "context summary truncated again within the hour; consider raising summary_char_limit"
            );
        } else {
            debug!(limit, original = total, "context summary truncated");
        }
        self.last_truncation = Some(now);
    }

    /// Records an accepted model turn in the bounded diagnostic history.
    pub fn record_request(&mut self, step: u32, assistant_json: impl Into<String>) -> u64 {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.requests.push_back(RequestRecord {
            request_id,
            step,
            assistant_json: assistant_json.into(),
        });
        while self.requests.len() > self.limits.max_request_history {
            self.requests.pop_front();
        }
        request_id
    }

    pub fn request_history(&self) -> impl Iterator<Item = &RequestRecord> {
        self.requests.iter()
    }

    /// Trims the diagnostic history to its newest `max_entries` records.
    pub fn cleanup_request_history(&mut self, max_entries: Option<usize>) -> usize {
        let keep = max_entries.unwrap_or(self.limits.max_request_history);
        let excess = self.requests.len().saturating_sub(keep);
        self.requests.drain(..excess);
        excess
    }

    /// Drops all turns, the summary, the request history and the summary
    /// metrics.
    pub fn clear(&mut self) {
        self.turns.clear();
        self.summary = None;
        self.summarized_upto = ANCHOR_TURNS;
        self.requests.clear();
        self.metrics = SummaryMetrics::default();
        self.last_truncation = None;
    }
}

fn render_state(state: &Value) -> String {
    match state {
        Value::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

#[derive(Clone, Copy)]
enum Bucket {
    Completed,
    Decisions,
    Pending,
    Notes,
}

impl Bucket {
    const ORDER: [Bucket; 4] = [
        Bucket::Completed,
        Bucket::Decisions,
        Bucket::Pending,
        Bucket::Notes,
    ];

    fn title(self) -> &'static str {
        match self {
            Bucket::Completed => "Completed",
            Bucket::Decisions => "Decisions",
            Bucket::Pending => "Pending",
            Bucket::Notes => "Notes",
        }
    }

    fn classify(line: &str) -> Bucket {
        let lower = line.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));
        if has(&["todo", "pending", "next step", "remaining", "still need"]) {
            Bucket::Pending
        } else if has(&["decide", "decision", "should", "will use", "chose", "plan to"]) {
            Bucket::Decisions
        } else if has(&["done", "completed", "success", "exit code 0", "written", "installed"]) {
            Bucket::Completed
        } else {
            Bucket::Notes
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Keyword-bucketed digest of the first line of each turn.
pub fn heuristic_summary(turns: &[Turn]) -> String {
    let mut buckets: [Vec<String>; 4] = Default::default();
    let mut emitted = 0;
    for turn in turns {
        if emitted == HEURISTIC_MAX_BULLETS {
            break;
        }
        let Some(first_line) = turn.content.lines().map(str::trim).find(|l| !l.is_empty()) else {
            continue;
        };
        let line: String = first_line.chars().take(HEURISTIC_LINE_CHARS).collect();
        let bucket = Bucket::classify(&line);
        buckets[bucket.index()].push(format!("- {}: {line}", turn.role.as_str()));
        emitted += 1;
    }

    let mut out = String::new();
    for bucket in Bucket::ORDER {
        let lines = &buckets[bucket.index()];
        if lines.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(bucket.title());
        out.push_str(":\n");
        out.push_str(&lines.join("\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    struct RecordingSummarizer {
        reply: Option<String>,
        calls: RefCell<Vec<(Option<String>, usize)>>,
    }

    impl RecordingSummarizer {
        fn replying(reply: Option<&str>) -> Self {
            Self {
                reply: reply.map(str::to_string),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl Summarizer for RecordingSummarizer {
        fn summarize(&self, previous: Option<&str>, turns: &[Turn]) -> Option<String> {
            self.calls
                .borrow_mut()
                .push((previous.map(str::to_string), turns.len()));
            self.reply.clone()
        }
    }

    fn limits(window_size: usize) -> ContextLimits {
        ContextLimits {
            window_size,
            min_messages_before_summary: 3,
            summary_char_limit: 5000,
            max_request_history: 4,
        }
    }

    fn store_with(turns: usize, window_size: usize) -> ContextStore {
        let mut store = ContextStore::new(limits(window_size));
        store.append(Role::System, "system prompt");
        store.append(Role::User, "goal: install nginx");
        for idx in 0..turns {
            let role = if idx % 2 == 0 { Role::Assistant } else { Role::User };
            store.append(role, format!("turn {idx}"));
        }
        store
    }

    #[test]
    fn short_logs_are_returned_verbatim() {
        let mut store = store_with(4, 5);
        let window = store.window(&HeuristicOnly, None);
        assert_eq!(window, store.transcript().to_vec());
    }

    #[test]
    fn window_is_bounded_and_anchored() {
        let summarizer = RecordingSummarizer::replying(Some("memory text"));
        for total in [8, 9, 15, 40] {
            let mut store = store_with(total, 5);
            let window = store.window(&summarizer, Some(&json!({"plan": "x"})));

            let verbatim: Vec<_> = window
                .iter()
                .filter(|t| {
                    !t.content.starts_with(MEMORY_PREFIX) && !t.content.starts_with(STATE_PREFIX)
                })
                .collect();
            assert_eq!(verbatim.len(), ANCHOR_TURNS + 5, "total={total}");
            assert_eq!(window[0].content, "system prompt");
            assert_eq!(window[1].content, "goal: install nginx");
            assert_eq!(
                window.last().map(|t| t.content.starts_with(STATE_PREFIX)),
                Some(true)
            );
            let tail = &store.transcript()[store.len() - 5..];
            let window_tail = &window[window.len() - 6..window.len() - 1];
            assert_eq!(window_tail, tail);
        }
    }

    #[test]
    fn text_state_is_rendered_verbatim() {
        let mut store = store_with(0, 5);
        let window = store.window(&HeuristicOnly, Some(&json!("Step 1 of 10\nplan")));
        assert_eq!(
            window.last().map(|t| t.content.as_str()),
            Some("[Persistent agent state]\nStep 1 of 10\nplan")
        );
        let window = store.window(&HeuristicOnly, Some(&json!({"step": 1})));
        assert_eq!(
            window.last().map(|t| t.content.as_str()),
            Some("[Persistent agent state]\n{\n  \"step\": 1\n}")
        );
    }

    #[test]
    fn summaries_wait_for_enough_aged_out_turns() {
        let summarizer = RecordingSummarizer::replying(Some("memory text"));
        let mut store = store_with(7, 5);
        // two turns aged out; below the minimum of three
        let window = store.window(&summarizer, None);
        assert!(summarizer.calls.borrow().is_empty());
        assert!(!window.iter().any(|t| t.content.starts_with(MEMORY_PREFIX)));

        store.append(Role::Assistant, "turn 7");
        let window = store.window(&summarizer, None);
        assert_eq!(summarizer.calls.borrow().as_slice(), &[(None, 3)]);
        assert_eq!(window[2].content, format!("{MEMORY_PREFIX}memory text"));
        assert_eq!(store.summary_metrics().initial_summaries, 1);
        assert_eq!(store.summary_metrics().summarized_upto, 5);
    }

    #[test]
    fn incremental_updates_pass_the_previous_summary() {
        let summarizer = RecordingSummarizer::replying(Some("memory text"));
        let mut store = store_with(8, 5);
        store.window(&summarizer, None);
        for idx in 0..3 {
            store.append(Role::User, format!("more {idx}"));
        }
        store.window(&summarizer, None);
        let calls = summarizer.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], (Some("memory text".to_string()), 3));
        assert_eq!(store.summary_metrics().update_summaries, 1);
        assert_eq!(store.summary_metrics().total_turns_summarized, 6);
    }

    #[test]
    fn falls_back_to_heuristic_summary() {
        let mut store = ContextStore::new(limits(2));
        store.append(Role::System, "system prompt");
        store.append(Role::User, "goal");
        store.append(Role::Assistant, "{\"tool\":\"bash\",\"command\":\"apt install nginx\"}");
        store.append(Role::User, "Command executed with exit code 0\nOutput: ok");
        store.append(Role::User, "TODO: configure firewall");
        store.append(Role::Assistant, "latest a");
        store.append(Role::User, "latest b");

        let window = store.window(&HeuristicOnly, None);
        let memory = &window[2].content;
        assert!(memory.starts_with(MEMORY_PREFIX));
        assert!(memory.contains("Completed:\n- user: Command executed with exit code 0"));
        assert!(memory.contains("Pending:\n- user: TODO: configure firewall"));
        assert!(memory.contains("Notes:\n- assistant:"));
        assert_eq!(store.summary_metrics().heuristic_summaries, 1);
    }

    #[test]
    fn summary_is_capped_keeping_the_newest_text() {
        let long = format!("{}END", "a".repeat(50));
        let summarizer = RecordingSummarizer::replying(Some(&long));
        let mut store = ContextStore::new(ContextLimits {
            summary_char_limit: 10,
            ..limits(2)
        });
        store.append(Role::System, "s");
        store.append(Role::User, "g");
        for idx in 0..5 {
            store.append(Role::User, format!("t{idx}"));
        }
        store.window(&summarizer, None);
        assert_eq!(store.summary(), Some("aaaaaaaEND"));
        let metrics = store.summary_metrics();
        assert_eq!(metrics.truncation_count, 1);
        assert_eq!(metrics.frequent_truncation_alerts, 0);

        for idx in 0..3 {
            store.append(Role::User, format!("u{idx}"));
        }
        store.window(&summarizer, None);
        let metrics = store.summary_metrics();
        assert_eq!(metrics.truncation_count, 2);
        assert_eq!(metrics.frequent_truncation_alerts, 1);
    }

    #[test]
    fn request_history_is_a_bounded_ring() {
        let mut store = ContextStore::new(limits(5));
        for step in 1..=6 {
            store.record_request(step, format!("{{\"step\":{step}}}"));
        }
        let ids: Vec<_> = store.request_history().map(|r| r.request_id).collect();
        assert_eq!(ids, vec![3, 4, 5, 6]);

        assert_eq!(store.cleanup_request_history(Some(1)), 3);
        let ids: Vec<_> = store.request_history().map(|r| r.request_id).collect();
        assert_eq!(ids, vec![6]);
    }

    #[test]
    fn clear_resets_everything() {
        let summarizer = RecordingSummarizer::replying(Some("memory"));
        let mut store = store_with(12, 3);
        store.window(&summarizer, None);
        store.record_request(1, "{}");
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.summary(), None);
        assert_eq!(store.request_history().count(), 0);
        assert_eq!(store.summary_metrics().summarized_upto, ANCHOR_TURNS);
    }

    #[test]
    fn clear_resets_summary_metrics() {
        let mut store = store_with(8, 2);
        store.window(&HeuristicOnly, None);
        assert_eq!(store.summary_metrics().heuristic_summaries, 1);

        store.clear();
        assert_eq!(
            store.summary_metrics(),
            SummaryMetrics {
                summarized_upto: ANCHOR_TURNS,
                ..SummaryMetrics::default()
            }
        );
    }
}
