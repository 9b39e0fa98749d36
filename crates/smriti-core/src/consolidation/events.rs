//! Event-chain extraction
//!
//! Turns a raw session into an ordered chain of typed events. Classification
//! comes first (core type from tool ratio and user-turn length, then an
//! extended domain when enough signal groups agree), then per-turn pattern
//! matching in priority order, deduplication, and a narrative rendering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{Session, ToolCall, Turn, TurnRole};

// ============================================================================
// CLASSIFICATION
// ============================================================================

/// Core session type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreSessionClass {
    Personal,
    Coding,
    Discussion,
    Mixed,
}

impl CoreSessionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoreSessionClass::Personal => "personal",
            CoreSessionClass::Coding => "coding",
            CoreSessionClass::Discussion => "discussion",
            CoreSessionClass::Mixed => "mixed",
        }
    }
}

/// Extended domain refinement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtendedDomain {
    Planning,
    Learning,
    Creative,
    Health,
    Finance,
    Social,
    Research,
    Reflection,
    Security,
    Operational,
}

impl ExtendedDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtendedDomain::Planning => "planning",
            ExtendedDomain::Learning => "learning",
            ExtendedDomain::Creative => "creative",
            ExtendedDomain::Health => "health",
            ExtendedDomain::Finance => "finance",
            ExtendedDomain::Social => "social",
            ExtendedDomain::Research => "research",
            ExtendedDomain::Reflection => "reflection",
            ExtendedDomain::Security => "security",
            ExtendedDomain::Operational => "operational",
        }
    }

    /// Signal word groups; a domain refines the core class when at least
    /// two of its groups match the session text
    fn signal_groups(&self) -> &'static [&'static [&'static str]] {
        match self {
            ExtendedDomain::Planning => &[
                &["plan", "roadmap", "milestone"],
                &["schedule", "deadline", "timeline"],
                &["sprint", "backlog", "priorit"],
            ],
            ExtendedDomain::Learning => &[
                &["learn", "tutorial", "course"],
                &["understand", "explain", "concept"],
                &["practice", "exercise", "study"],
            ],
            ExtendedDomain::Creative => &[
                &["design", "sketch", "draft"],
                &["story", "write", "compose"],
                &["idea", "brainstorm", "imagine"],
            ],
            ExtendedDomain::Health => &[
                &["health", "doctor", "symptom"],
                &["sleep", "exercise", "diet"],
                &["medication", "appointment", "therapy"],
            ],
            ExtendedDomain::Finance => &[
                &["budget", "invoice", "expense"],
                &["tax", "salary", "payment"],
                &["invest", "savings", "account"],
            ],
            ExtendedDomain::Social => &[
                &["meeting", "invite", "party"],
                &["friend", "family", "colleague"],
                &["email", "message", "reply"],
            ],
            ExtendedDomain::Research => &[
                &["paper", "benchmark", "experiment"],
                &["compare", "evaluate", "measure"],
                &["hypothesis", "evidence", "finding"],
            ],
            ExtendedDomain::Reflection => &[
                &["retrospective", "review", "lesson"],
                &["mistake", "improve", "better"],
                &["journal", "reflect", "felt"],
            ],
            ExtendedDomain::Security => &[
                &["vulnerability", "exploit", "cve"],
                &["auth", "token", "credential"],
                &["encrypt", "permission", "audit"],
            ],
            ExtendedDomain::Operational => &[
                &["deploy", "release", "rollback"],
                &["incident", "outage", "alert"],
                &["monitor", "metric", "uptime"],
            ],
        }
    }

    const ALL: [ExtendedDomain; 10] = [
        ExtendedDomain::Planning,
        ExtendedDomain::Learning,
        ExtendedDomain::Creative,
        ExtendedDomain::Health,
        ExtendedDomain::Finance,
        ExtendedDomain::Social,
        ExtendedDomain::Research,
        ExtendedDomain::Reflection,
        ExtendedDomain::Security,
        ExtendedDomain::Operational,
    ];
}

/// Full classification of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClass {
    pub core: CoreSessionClass,
    pub domain: Option<ExtendedDomain>,
}

impl SessionClass {
    /// Label used in narrative prefixes
    pub fn label(&self) -> String {
        match self.domain {
            Some(domain) => {
                let name = domain.as_str();
                let mut chars = name.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            }
            None => {
                let name = self.core.as_str();
                let mut chars = name.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                    None => String::new(),
                }
            }
        }
    }
}

/// Classify a session from tool-call ratio and user-turn length
pub fn classify(session: &Session) -> SessionClass {
    let assistant_turns: Vec<&Turn> = session
        .turns
        .iter()
        .filter(|t| t.role == TurnRole::Assistant)
        .collect();
    let with_tools = assistant_turns
        .iter()
        .filter(|t| !t.tool_calls.is_empty())
        .count();
    let tool_ratio = if assistant_turns.is_empty() {
        0.0
    } else {
        with_tools as f64 / assistant_turns.len() as f64
    };

    let user_turns: Vec<&Turn> = session
        .turns
        .iter()
        .filter(|t| t.role == TurnRole::User)
        .collect();
    let avg_user_len = if user_turns.is_empty() {
        0.0
    } else {
        user_turns.iter().map(|t| t.content.len()).sum::<usize>() as f64 / user_turns.len() as f64
    };

    let core = if tool_ratio >= 0.4 {
        CoreSessionClass::Coding
    } else if tool_ratio > 0.0 {
        CoreSessionClass::Mixed
    } else if avg_user_len >= 120.0 {
        CoreSessionClass::Discussion
    } else {
        CoreSessionClass::Personal
    };

    // Domain refinement: at least two signal groups must match
    let text: String = session
        .turns
        .iter()
        .map(|t| t.content.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    let mut best: Option<(ExtendedDomain, usize)> = None;
    for domain in ExtendedDomain::ALL {
        let matched = domain
            .signal_groups()
            .iter()
            .filter(|group| group.iter().any(|signal| text.contains(signal)))
            .count();
        if matched >= 2 && best.is_none_or(|(_, count)| matched > count) {
            best = Some((domain, matched));
        }
    }

    SessionClass {
        core,
        domain: best.map(|(domain, _)| domain),
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// What kind of event a chain entry is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Action,
    Fact,
    Preference,
    Question,
    Decision,
    Topic,
    ToolResult,
    FileModified,
    Error,
    Commit,
    OptionListed,
    Conclusion,
}

/// One entry of an event chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainEvent {
    pub kind: EventKind,
    pub summary: String,
    pub at: DateTime<Utc>,
    pub source_ordinal: u32,
}

/// The extracted chain for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventChain {
    pub session_id: String,
    pub project: String,
    pub class: SessionClass,
    pub events: Vec<ChainEvent>,
    pub narrative: String,
}

impl EventChain {
    /// Events of one kind
    pub fn of_kind(&self, kind: EventKind) -> impl Iterator<Item = &ChainEvent> {
        self.events.iter().filter(move |e| e.kind == kind)
    }
}

// ============================================================================
// EXTRACTION
// ============================================================================

const QUESTION_WORDS: &[&str] = &["what", "how", "why", "when", "where", "who", "which", "can", "should", "could"];

/// Replies at or past this length are discarded by the personal strategy
const PERSONAL_REPLY_CEILING: usize = 500;

fn first_meaningful_line(content: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .find(|line| line.len() >= 3 && !line.starts_with('`'))
        .map(|line| truncate_summary(line))
}

fn truncate_summary(line: &str) -> String {
    const MAX: usize = 160;
    if line.len() <= MAX {
        line.to_string()
    } else {
        let mut cut = MAX;
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &line[..cut])
    }
}

/// Normalise a summary for dedup: lowercase, punctuation out
fn normalize(summary: &str) -> String {
    summary
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Match one user turn against the pattern ladder; first rule wins
fn extract_user_event(turn: &Turn, is_first_user_turn: bool) -> Option<ChainEvent> {
    let content = turn.content.trim();
    if content.is_empty() {
        return None;
    }
    let lower = content.to_lowercase();
    let first_line = first_meaningful_line(content)?;

    let kind = if lower.contains("[tool]") || lower.contains("run ") && lower.len() < 120 {
        EventKind::Action
    } else if lower.contains("i live in")
        || lower.contains("my name is")
        || lower.contains("remember that")
    {
        EventKind::Fact
    } else if lower.starts_with("always ")
        || lower.starts_with("never ")
        || lower.contains("i prefer")
    {
        EventKind::Preference
    } else if content.trim_end().ends_with('?')
        || QUESTION_WORDS
            .iter()
            .any(|w| lower.starts_with(&format!("{w} ")))
    {
        EventKind::Question
    } else if content.len() < 160 && !is_first_user_turn {
        EventKind::Decision
    } else {
        EventKind::Topic
    };

    Some(ChainEvent {
        kind,
        summary: first_line,
        at: turn.created_at,
        source_ordinal: turn.ordinal,
    })
}

/// Coding strategy: tool results, modified files, errors, commits
fn extract_coding_events(turn: &Turn, out: &mut Vec<ChainEvent>) {
    for call in &turn.tool_calls {
        let kind = if call.is_error {
            EventKind::Error
        } else {
            EventKind::ToolResult
        };
        out.push(ChainEvent {
            kind,
            summary: format!("{}: {}", call.name, first_result_line(call)),
            at: turn.created_at,
            source_ordinal: turn.ordinal,
        });
        if let Some(path) = modified_file(call) {
            out.push(ChainEvent {
                kind: EventKind::FileModified,
                summary: path,
                at: turn.created_at,
                source_ordinal: turn.ordinal,
            });
        }
    }
    for line in turn.content.lines() {
        let lower = line.to_lowercase();
        if lower.contains("committed") || lower.starts_with("commit ") {
            out.push(ChainEvent {
                kind: EventKind::Commit,
                summary: truncate_summary(line.trim()),
                at: turn.created_at,
                source_ordinal: turn.ordinal,
            });
        }
    }
}

/// Discussion strategy: topics, option lists, conclusion sentences
fn extract_discussion_events(turn: &Turn, out: &mut Vec<ChainEvent>) {
    let mut options = 0usize;
    for line in turn.content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("- ") || trimmed.starts_with("* ") {
            options += 1;
        }
    }
    if options >= 2 {
        out.push(ChainEvent {
            kind: EventKind::OptionListed,
            summary: format!("{options} options listed"),
            at: turn.created_at,
            source_ordinal: turn.ordinal,
        });
    }
    for line in turn.content.lines() {
        let lower = line.to_lowercase();
        if lower.starts_with("in conclusion")
            || lower.starts_with("to summarize")
            || lower.starts_with("overall,")
        {
            out.push(ChainEvent {
                kind: EventKind::Conclusion,
                summary: truncate_summary(line.trim()),
                at: turn.created_at,
                source_ordinal: turn.ordinal,
            });
        }
    }
}

fn first_result_line(call: &ToolCall) -> String {
    call.result
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(truncate_summary)
        .unwrap_or_else(|| "(no output)".to_string())
}

/// Pull a file path out of a write-like tool input
fn modified_file(call: &ToolCall) -> Option<String> {
    let write_like = ["write", "edit", "patch", "create"];
    if !write_like.iter().any(|w| call.name.to_lowercase().contains(w)) {
        return None;
    }
    let input: serde_json::Value = serde_json::from_str(&call.input).ok()?;
    for key in ["path", "file", "file_path", "filename"] {
        if let Some(path) = input.get(key).and_then(|v| v.as_str()) {
            return Some(path.to_string());
        }
    }
    None
}

/// Extract the full event chain for a session
pub fn extract(session: &Session) -> EventChain {
    let class = classify(session);
    let mut events: Vec<ChainEvent> = Vec::new();
    let mut seen_user_turn = false;

    for turn in &session.turns {
        match turn.role {
            TurnRole::User => {
                if let Some(event) = extract_user_event(turn, !seen_user_turn) {
                    events.push(event);
                }
                seen_user_turn = true;
            }
            TurnRole::Assistant => match class.core {
                CoreSessionClass::Coding => extract_coding_events(turn, &mut events),
                CoreSessionClass::Discussion => extract_discussion_events(turn, &mut events),
                CoreSessionClass::Mixed => {
                    extract_coding_events(turn, &mut events);
                    extract_discussion_events(turn, &mut events);
                }
                CoreSessionClass::Personal => {
                    // Short replies count as actions; long ones are noise
                    let content = turn.content.trim();
                    if !content.is_empty() && content.len() < PERSONAL_REPLY_CEILING {
                        if let Some(summary) = first_meaningful_line(content) {
                            events.push(ChainEvent {
                                kind: EventKind::Action,
                                summary,
                                at: turn.created_at,
                                source_ordinal: turn.ordinal,
                            });
                        }
                    }
                }
            },
        }
    }

    // Dedup same-kind events whose normalised summaries match
    let mut seen: std::collections::HashSet<(EventKind, String)> = std::collections::HashSet::new();
    events.retain(|event| seen.insert((event.kind, normalize(&event.summary))));

    events.sort_by(|a, b| a.at.cmp(&b.at).then(a.source_ordinal.cmp(&b.source_ordinal)));

    let narrative = events
        .iter()
        .map(|event| {
            format!(
                "{} {} [{}]: {}",
                event.at.format("%H:%M"),
                session.meta.agent,
                class.label(),
                event.summary
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    EventChain {
        session_id: session.meta.id.clone(),
        project: session.meta.project.clone(),
        class,
        events,
        narrative,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionMeta;

    fn session_with(turns: Vec<Turn>) -> Session {
        let now = Utc::now();
        Session {
            meta: SessionMeta {
                id: "session-2025-06-15-abcd1234".into(),
                project: "/p".into(),
                title: "t".into(),
                created: now,
                updated: now,
                agent: "claude".into(),
                model: "m".into(),
                parent: None,
                branch: None,
                tags: vec![],
                total_cost: 0.0,
                total_tokens: 0,
            },
            turns,
        }
    }

    fn turn(ordinal: u32, role: TurnRole, content: &str) -> Turn {
        Turn {
            ordinal,
            role,
            content: content.into(),
            tool_calls: vec![],
            agent: None,
            model: None,
            created_at: Utc::now() + chrono::Duration::seconds(ordinal as i64),
        }
    }

    fn tool_turn(ordinal: u32, name: &str, input: &str, result: &str, is_error: bool) -> Turn {
        let mut t = turn(ordinal, TurnRole::Assistant, "ran it");
        t.tool_calls = vec![ToolCall {
            name: name.into(),
            input: input.into(),
            result: result.into(),
            is_error,
        }];
        t
    }

    #[test]
    fn test_classify_coding_by_tool_ratio() {
        let session = session_with(vec![
            turn(1, TurnRole::User, "fix the bug"),
            tool_turn(2, "edit_file", "{\"path\": \"src/lib.rs\"}", "done", false),
            tool_turn(3, "run_tests", "{}", "ok", false),
        ]);
        assert_eq!(classify(&session).core, CoreSessionClass::Coding);
    }

    #[test]
    fn test_classify_personal_vs_discussion() {
        let short = session_with(vec![
            turn(1, TurnRole::User, "good morning"),
            turn(2, TurnRole::Assistant, "morning!"),
        ]);
        assert_eq!(classify(&short).core, CoreSessionClass::Personal);

        let long_user = "I have been thinking about the tradeoffs between the two storage designs and I want to walk through the consequences for replication and backup carefully.";
        let discussion = session_with(vec![
            turn(1, TurnRole::User, long_user),
            turn(2, TurnRole::Assistant, "Let us go through them."),
        ]);
        assert_eq!(classify(&discussion).core, CoreSessionClass::Discussion);
    }

    #[test]
    fn test_domain_needs_two_groups() {
        // Only one security group matches
        let weak = session_with(vec![turn(1, TurnRole::User, "rotate the auth token")]);
        assert_eq!(classify(&weak).domain, None);

        // Two groups: auth/token plus audit/permission
        let strong = session_with(vec![turn(
            1,
            TurnRole::User,
            "rotate the auth token and audit the permission model",
        )]);
        assert_eq!(classify(&strong).domain, Some(ExtendedDomain::Security));
    }

    #[test]
    fn test_user_pattern_ladder() {
        let session = session_with(vec![
            turn(1, TurnRole::User, "Let's look at the parser today"),
            turn(3, TurnRole::User, "remember that I deploy on Fridays"),
            turn(5, TurnRole::User, "I prefer explicit errors"),
            turn(7, TurnRole::User, "why does the cache miss?"),
            turn(9, TurnRole::User, "use the second option"),
        ]);
        let chain = extract(&session);
        let kinds: Vec<EventKind> = chain.events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Topic,
                EventKind::Fact,
                EventKind::Preference,
                EventKind::Question,
                EventKind::Decision,
            ]
        );
    }

    #[test]
    fn test_coding_strategy_extracts_tools_files_errors() {
        let session = session_with(vec![
            turn(1, TurnRole::User, "fix it"),
            tool_turn(2, "edit_file", "{\"path\": \"src/a.rs\"}", "edited ok", false),
            tool_turn(3, "run_tests", "{}", "assertion failed", true),
        ]);
        let chain = extract(&session);
        assert!(chain.of_kind(EventKind::ToolResult).count() >= 1);
        assert!(chain
            .of_kind(EventKind::FileModified)
            .any(|e| e.summary == "src/a.rs"));
        assert!(chain.of_kind(EventKind::Error).count() == 1);
    }

    #[test]
    fn test_personal_strategy_discards_long_replies() {
        let long_reply = "x".repeat(600);
        let session = session_with(vec![
            turn(1, TurnRole::User, "hi there friend"),
            turn(2, TurnRole::Assistant, &long_reply),
            turn(3, TurnRole::Assistant, "short and sweet"),
        ]);
        let chain = extract(&session);
        let actions: Vec<&ChainEvent> = chain.of_kind(EventKind::Action).collect();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].summary, "short and sweet");
    }

    #[test]
    fn test_dedup_by_normalized_summary() {
        let session = session_with(vec![
            turn(1, TurnRole::User, "why is it slow?"),
            turn(3, TurnRole::User, "Why is it slow!?"),
        ]);
        let chain = extract(&session);
        assert_eq!(chain.of_kind(EventKind::Question).count(), 1);
    }

    #[test]
    fn test_narrative_prefix_shape() {
        let session = session_with(vec![turn(1, TurnRole::User, "what broke in the deploy?")]);
        let chain = extract(&session);
        let line = chain.narrative.lines().next().unwrap();
        // HH:MM provider [Domain]: summary
        assert!(line.contains(" claude ["));
        assert!(line.contains("]: what broke in the deploy?"));
        let time = &line[..5];
        assert!(time.chars().nth(2) == Some(':'));
    }
}
