//! Session markdown codec
//!
//! One file per session: a front-matter block with the header fields, one
//! `## Turn <n> — <role>` section per turn with optional `### Tool:`
//! subsections, and a totals footer. The file is the source of truth; the
//! relational index is rebuilt from it on mismatch.
//!
//! Content lines that would otherwise parse as a structural boundary (turn
//! headings, tool headings, `---`, `</details>`) are escaped with a leading
//! backslash on write and unescaped on read, so arbitrary conversation text
//! roundtrips.

use chrono::{DateTime, Utc};

use super::{Session, SessionMeta, ToolCall, Turn, TurnRole};
use crate::error::{MemoryError, Result};

// ============================================================================
// ESCAPING
// ============================================================================

fn is_boundary(line: &str) -> bool {
    line.starts_with("## Turn ")
        || line.starts_with("### Tool:")
        || line.trim_end() == "---"
        || line.trim_end() == "</details>"
}

fn escape_line(line: &str) -> String {
    if is_boundary(line) || line.starts_with('\\') {
        format!("\\{line}")
    } else {
        line.to_string()
    }
}

fn unescape_line(line: &str) -> String {
    match line.strip_prefix('\\') {
        Some(rest) => rest.to_string(),
        None => line.to_string(),
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn unquote(s: &str) -> String {
    let trimmed = s.trim();
    let inner = trimmed
        .strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .unwrap_or(trimmed);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn quote_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|i| quote(i)).collect();
    format!("[{}]", quoted.join(", "))
}

fn unquote_list(s: &str) -> Vec<String> {
    let trimmed = s.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|r| r.strip_suffix(']'))
        .unwrap_or(trimmed)
        .trim();
    if inner.is_empty() {
        return Vec::new();
    }
    // Split on commas outside quotes
    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    for c in inner.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                current.push(c);
                in_quotes = !in_quotes;
            }
            ',' if !in_quotes => {
                items.push(unquote(current.trim()));
                current.clear();
            }
            c => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        items.push(unquote(current.trim()));
    }
    items
}

// ============================================================================
// WRITER
// ============================================================================

/// Render a session to its markdown form
pub fn write_session(session: &Session) -> String {
    let meta = &session.meta;
    let mut out = String::new();

    out.push_str("---\n");
    out.push_str(&format!("id: {}\n", quote(&meta.id)));
    out.push_str(&format!("project: {}\n", quote(&meta.project)));
    out.push_str(&format!("title: {}\n", quote(&meta.title)));
    out.push_str(&format!("created: {}\n", quote(&meta.created.to_rfc3339())));
    out.push_str(&format!("updated: {}\n", quote(&meta.updated.to_rfc3339())));
    out.push_str(&format!("agent: {}\n", quote(&meta.agent)));
    out.push_str(&format!("model: {}\n", quote(&meta.model)));
    if let Some(parent) = &meta.parent {
        out.push_str(&format!("parent: {}\n", quote(parent)));
    }
    if let Some(branch) = &meta.branch {
        out.push_str(&format!("branch: {}\n", quote(branch)));
    }
    out.push_str(&format!("tags: {}\n", quote_list(&meta.tags)));
    out.push_str(&format!("totalCost: {:.6}\n", meta.total_cost));
    out.push_str(&format!("totalTokens: {}\n", meta.total_tokens));
    out.push_str("---\n");

    for turn in &session.turns {
        out.push('\n');
        out.push_str(&format!("## Turn {} — {}", turn.ordinal, turn.role));
        match (&turn.agent, &turn.model) {
            (Some(agent), Some(model)) => {
                out.push_str(&format!(" (agent: {agent}, model: {model})"))
            }
            (Some(agent), None) => out.push_str(&format!(" (agent: {agent})")),
            (None, Some(model)) => out.push_str(&format!(" (model: {model})")),
            (None, None) => {}
        }
        out.push('\n');
        out.push('\n');
        for line in turn.content.lines() {
            out.push_str(&escape_line(line));
            out.push('\n');
        }

        for call in &turn.tool_calls {
            out.push('\n');
            out.push_str(&format!("### Tool: {}\n", call.name));
            out.push('\n');
            out.push_str("**Input**\n");
            out.push('\n');
            out.push_str("```json\n");
            for line in call.input.lines() {
                out.push_str(line);
                out.push('\n');
            }
            out.push_str("```\n");
            out.push('\n');
            out.push_str("<details>\n");
            out.push_str(&format!(
                "<summary>{}</summary>\n",
                if call.is_error { "Error" } else { "Result" }
            ));
            out.push('\n');
            for line in call.result.lines() {
                out.push_str(&escape_line(line));
                out.push('\n');
            }
            out.push('\n');
            out.push_str("</details>\n");
        }
    }

    out.push('\n');
    out.push_str("---\n");
    out.push('\n');
    out.push_str(&format!(
        "**Totals:** cost=${:.6} tokens={}\n",
        meta.total_cost, meta.total_tokens
    ));

    out
}

// ============================================================================
// PARSER
// ============================================================================

struct FrontMatter {
    fields: Vec<(String, String)>,
}

impl FrontMatter {
    fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| MemoryError::Invariant(format!("front-matter missing field: {key}")))
    }

    fn datetime(&self, key: &str) -> Result<DateTime<Utc>> {
        let raw = unquote(self.require(key)?);
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| MemoryError::Invariant(format!("front-matter field {key} is not a timestamp: {raw}")))
    }
}

fn parse_front_matter<'a>(lines: &mut std::iter::Peekable<std::str::Lines<'a>>) -> Result<FrontMatter> {
    match lines.next() {
        Some(line) if line.trim_end() == "---" => {}
        _ => {
            return Err(MemoryError::Invariant(
                "session file does not start with front-matter".to_string(),
            ))
        }
    }
    let mut fields = Vec::new();
    for line in lines.by_ref() {
        if line.trim_end() == "---" {
            return Ok(FrontMatter { fields });
        }
        if line.trim().is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(MemoryError::Invariant(format!(
                "malformed front-matter line: {line}"
            )));
        };
        fields.push((key.trim().to_string(), value.trim().to_string()));
    }
    Err(MemoryError::Invariant(
        "unterminated front-matter block".to_string(),
    ))
}

fn parse_turn_heading(line: &str) -> Result<(u32, TurnRole, Option<String>, Option<String>)> {
    let rest = line
        .strip_prefix("## Turn ")
        .ok_or_else(|| MemoryError::Invariant(format!("not a turn heading: {line}")))?;
    let (ordinal_str, rest) = rest
        .split_once(" — ")
        .ok_or_else(|| MemoryError::Invariant(format!("malformed turn heading: {line}")))?;
    let ordinal: u32 = ordinal_str
        .trim()
        .parse()
        .map_err(|_| MemoryError::Invariant(format!("bad turn ordinal in: {line}")))?;

    let rest = rest.trim();
    let (role_str, annotations) = match rest.split_once(" (") {
        Some((role, tail)) => (role, tail.strip_suffix(')').unwrap_or(tail)),
        None => (rest, ""),
    };
    let role = TurnRole::parse_name(role_str)?;

    let mut agent = None;
    let mut model = None;
    for part in annotations.split(", ").filter(|p| !p.is_empty()) {
        if let Some(value) = part.strip_prefix("agent: ") {
            agent = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("model: ") {
            model = Some(value.to_string());
        }
    }
    Ok((ordinal, role, agent, model))
}

fn trim_blank_edges(lines: &mut Vec<String>) {
    while lines.first().is_some_and(|l| l.trim().is_empty()) {
        lines.remove(0);
    }
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
}

/// Parse the markdown form back into a session
///
/// Timestamps of turns are not stored per line in the file; the session
/// store persists them in the index and stitches them back on load. The
/// parser assigns the session `created` time to every turn as a baseline.
pub fn parse_session(text: &str) -> Result<Session> {
    let mut lines = text.lines().peekable();
    let front = parse_front_matter(&mut lines)?;

    let meta = SessionMeta {
        id: unquote(front.require("id")?),
        project: unquote(front.require("project")?),
        title: unquote(front.require("title")?),
        created: front.datetime("created")?,
        updated: front.datetime("updated")?,
        agent: unquote(front.require("agent")?),
        model: unquote(front.require("model")?),
        parent: front
            .get("parent")
            .filter(|v| v.trim() != "null")
            .map(unquote),
        branch: front
            .get("branch")
            .filter(|v| v.trim() != "null")
            .map(unquote),
        tags: front.get("tags").map(unquote_list).unwrap_or_default(),
        total_cost: front
            .get("totalCost")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0.0),
        total_tokens: front
            .get("totalTokens")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0),
    };

    let baseline = meta.created;
    let mut turns: Vec<Turn> = Vec::new();
    let mut content_lines: Vec<String> = Vec::new();

    fn finish_turn(turns: &mut [Turn], content_lines: &mut Vec<String>) {
        trim_blank_edges(content_lines);
        if content_lines.is_empty() {
            return;
        }
        if let Some(turn) = turns.last_mut() {
            // Content may continue after a tool section; append rather than
            // overwrite so nothing is lost.
            if turn.content.is_empty() {
                turn.content = content_lines.join("\n");
            } else {
                turn.content.push('\n');
                turn.content.push_str(&content_lines.join("\n"));
            }
        }
        content_lines.clear();
    }

    while let Some(line) = lines.next() {
        if line.starts_with("## Turn ") {
            finish_turn(&mut turns, &mut content_lines);
            let (ordinal, role, agent, model) = parse_turn_heading(line)?;
            turns.push(Turn {
                ordinal,
                role,
                content: String::new(),
                tool_calls: Vec::new(),
                agent,
                model,
                created_at: baseline,
            });
        } else if line.starts_with("### Tool:") {
            finish_turn(&mut turns, &mut content_lines);
            let name = line
                .strip_prefix("### Tool:")
                .unwrap_or_default()
                .trim()
                .to_string();
            let call = parse_tool_section(&mut lines, name)?;
            match turns.last_mut() {
                Some(turn) => turn.tool_calls.push(call),
                None => {
                    return Err(MemoryError::Invariant(
                        "tool section before any turn".to_string(),
                    ))
                }
            }
        } else if line.trim_end() == "---" {
            // Totals footer; canonical totals live in the front-matter
            finish_turn(&mut turns, &mut content_lines);
            break;
        } else if !turns.is_empty() {
            content_lines.push(unescape_line(line));
        } else if !line.trim().is_empty() {
            return Err(MemoryError::Invariant(format!(
                "unexpected content before first turn: {line}"
            )));
        }
    }
    finish_turn(&mut turns, &mut content_lines);

    let session = Session { meta, turns };
    session.check_invariants()?;
    Ok(session)
}

fn parse_tool_section(
    lines: &mut std::iter::Peekable<std::str::Lines<'_>>,
    name: String,
) -> Result<ToolCall> {
    // Skip to the opening json fence
    let mut input_lines: Vec<String> = Vec::new();
    let mut found_fence = false;
    for line in lines.by_ref() {
        let trimmed = line.trim_end();
        if trimmed == "```json" {
            found_fence = true;
            break;
        }
        if trimmed.starts_with("## Turn ") || trimmed == "---" {
            return Err(MemoryError::Invariant(format!(
                "tool section {name} has no input block"
            )));
        }
    }
    if !found_fence {
        return Err(MemoryError::Invariant(format!(
            "tool section {name} has no input block"
        )));
    }
    for line in lines.by_ref() {
        if line.trim_end() == "```" {
            break;
        }
        input_lines.push(line.to_string());
    }

    // Details block with Result or Error summary
    let mut is_error = false;
    let mut in_details = false;
    for line in lines.by_ref() {
        let trimmed = line.trim_end();
        if trimmed == "<details>" {
            in_details = true;
        } else if trimmed == "<summary>Error</summary>" {
            is_error = true;
            break;
        } else if trimmed == "<summary>Result</summary>" {
            break;
        } else if in_details && !trimmed.is_empty() {
            return Err(MemoryError::Invariant(format!(
                "tool section {name} has a malformed details block"
            )));
        }
    }

    let mut result_lines: Vec<String> = Vec::new();
    for line in lines.by_ref() {
        if line.trim_end() == "</details>" {
            break;
        }
        result_lines.push(unescape_line(line));
    }
    trim_blank_edges(&mut result_lines);

    Ok(ToolCall {
        name,
        input: input_lines.join("\n"),
        result: result_lines.join("\n"),
        is_error,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> SessionMeta {
        let created = DateTime::parse_from_rfc3339("2025-06-15T10:00:00+00:00")
            .unwrap()
            .with_timezone(&Utc);
        SessionMeta {
            id: "session-2025-06-15-ab12cd34".into(),
            project: "/p".into(),
            title: "Hello".into(),
            created,
            updated: created,
            agent: "c".into(),
            model: "m".into(),
            parent: None,
            branch: None,
            tags: vec![],
            total_cost: 0.0,
            total_tokens: 0,
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
            created_at: meta().created,
        }
    }

    fn roundtrip(session: &Session) -> Session {
        parse_session(&write_session(session)).unwrap()
    }

    #[test]
    fn test_roundtrip_simple() {
        let session = Session {
            meta: meta(),
            turns: vec![
                turn(1, TurnRole::User, "hi"),
                turn(2, TurnRole::Assistant, "yo"),
            ],
        };
        assert_eq!(roundtrip(&session), session);
    }

    #[test]
    fn test_roundtrip_multiline_with_fenced_code() {
        let content = "Here is code:\n\n```rust\nfn main() {\n    println!(\"hi\");\n}\n```\n\nDone.";
        let session = Session {
            meta: meta(),
            turns: vec![turn(1, TurnRole::Assistant, content)],
        };
        assert_eq!(roundtrip(&session), session);
    }

    #[test]
    fn test_roundtrip_escapes_boundary_lines() {
        let content = "tricky:\n## Turn 9 — user\n### Tool: fake\n---\n</details>\n\\already escaped";
        let session = Session {
            meta: meta(),
            turns: vec![
                turn(1, TurnRole::User, content),
                turn(2, TurnRole::Assistant, "ok"),
            ],
        };
        let back = roundtrip(&session);
        assert_eq!(back.turns.len(), 2);
        assert_eq!(back.turns[0].content, content);
    }

    #[test]
    fn test_roundtrip_tool_calls() {
        let mut with_tools = turn(2, TurnRole::Assistant, "ran a tool");
        with_tools.tool_calls = vec![
            ToolCall {
                name: "read_file".into(),
                input: "{\"path\": \"src/lib.rs\"}".into(),
                result: "fn lib() {}\nmod tests;".into(),
                is_error: false,
            },
            ToolCall {
                name: "run_tests".into(),
                input: "{}".into(),
                result: "2 tests failed".into(),
                is_error: true,
            },
        ];
        let session = Session {
            meta: meta(),
            turns: vec![turn(1, TurnRole::User, "go"), with_tools],
        };
        let back = roundtrip(&session);
        assert_eq!(back, session);
        assert!(back.turns[1].tool_calls[1].is_error);
    }

    #[test]
    fn test_roundtrip_meta_variants() {
        let mut m = meta();
        m.title = "She said \"hello, world\"".into();
        m.parent = Some("session-2025-06-14-00000000".into());
        m.branch = Some("exp".into());
        m.tags = vec!["branch:exp".into(), "topic: auth, sessions".into()];
        m.total_cost = 0.5;
        m.total_tokens = 987;
        let session = Session {
            meta: m,
            turns: vec![turn(1, TurnRole::User, "hi")],
        };
        assert_eq!(roundtrip(&session), session);
    }

    #[test]
    fn test_roundtrip_empty_tags_and_no_turns() {
        let session = Session {
            meta: meta(),
            turns: vec![],
        };
        assert_eq!(roundtrip(&session), session);
    }

    #[test]
    fn test_turn_heading_annotations() {
        let mut t = turn(1, TurnRole::Assistant, "x");
        t.agent = Some("helper".into());
        t.model = Some("m2".into());
        let session = Session {
            meta: meta(),
            turns: vec![t],
        };
        let back = roundtrip(&session);
        assert_eq!(back.turns[0].agent.as_deref(), Some("helper"));
        assert_eq!(back.turns[0].model.as_deref(), Some("m2"));
    }

    #[test]
    fn test_parse_rejects_missing_front_matter() {
        assert!(parse_session("## Turn 1 — user\n\nhi\n").is_err());
        assert!(parse_session("---\nid: \"x\"\n").is_err());
    }

    #[test]
    fn test_parse_rejects_ordinal_gap() {
        let text = "---\nid: \"session-2025-06-15-ab12cd34\"\nproject: \"/p\"\ntitle: \"t\"\ncreated: \"2025-06-15T10:00:00+00:00\"\nupdated: \"2025-06-15T10:00:00+00:00\"\nagent: \"a\"\nmodel: \"m\"\ntags: []\ntotalCost: 0.000000\ntotalTokens: 0\n---\n\n## Turn 1 — user\n\nhi\n\n## Turn 3 — assistant\n\nyo\n";
        assert!(parse_session(text).is_err());
    }
}
