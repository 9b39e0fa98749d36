//! Smaran entries
//!
//! Explicitly remembered items (preferences, facts, decisions, instructions)
//! stored inside the scope memory files. Entry ids are content hashes so
//! `forget` stays stable across reloads; detection heuristics turn phrases
//! like "remember that ..." into entries without a model call.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{MemoryError, Result};

use super::{MemoryFileStore, MemoryScope};

// ============================================================================
// CATEGORIES
// ============================================================================

/// What kind of memory an entry is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmaranCategory {
    Preference,
    Fact,
    Decision,
    Instruction,
}

impl SmaranCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            SmaranCategory::Preference => "preference",
            SmaranCategory::Fact => "fact",
            SmaranCategory::Decision => "decision",
            SmaranCategory::Instruction => "instruction",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "preference" => Some(SmaranCategory::Preference),
            "fact" => Some(SmaranCategory::Fact),
            "decision" => Some(SmaranCategory::Decision),
            "instruction" => Some(SmaranCategory::Instruction),
            _ => None,
        }
    }
}

impl std::fmt::Display for SmaranCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// ENTRIES
// ============================================================================

/// One remembered item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmaranEntry {
    /// Stable content hash
    pub id: String,
    pub category: SmaranCategory,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub confidence: f64,
}

impl SmaranEntry {
    /// Deterministic id from category and content
    pub fn make_id(category: SmaranCategory, content: &str) -> String {
        let digest = Sha256::digest(format!("{}:{}", category.as_str(), content.trim()));
        digest[..8].iter().map(|b| format!("{b:02x}")).collect()
    }

    fn to_block(&self) -> String {
        format!(
            "## [{}] {}\n<!-- id: {} created: {} confidence: {:.2} -->",
            self.category,
            self.content.replace('\n', " "),
            self.id,
            self.created_at.to_rfc3339(),
            self.confidence,
        )
    }

    fn from_block(block: &str) -> Option<Self> {
        let mut lines = block.lines();
        let heading = lines.next()?.strip_prefix("## [")?;
        let (category_str, content) = heading.split_once("] ")?;
        let category = SmaranCategory::parse_name(category_str)?;

        let meta = lines.find(|l| l.trim_start().starts_with("<!-- id:"))?;
        let meta = meta.trim().strip_prefix("<!--")?.strip_suffix("-->")?;
        let mut id = None;
        let mut created_at = None;
        let mut confidence = 0.8;
        for chunk in meta.split_whitespace().collect::<Vec<_>>().chunks(2) {
            if let [key, value] = chunk {
                match *key {
                    "id:" => id = Some(value.to_string()),
                    "created:" => {
                        created_at = DateTime::parse_from_rfc3339(value)
                            .ok()
                            .map(|dt| dt.with_timezone(&Utc));
                    }
                    "confidence:" => confidence = value.parse().unwrap_or(0.8),
                    _ => {}
                }
            }
        }
        Some(SmaranEntry {
            id: id?,
            category,
            content: content.trim().to_string(),
            created_at: created_at?,
            confidence,
        })
    }
}

// ============================================================================
// DETECTION
// ============================================================================

/// Scan a user turn for remember-worthy statements
///
/// Heuristics only; returns the category and the captured content.
pub fn detect(text: &str) -> Vec<(SmaranCategory, String)> {
    let mut detected = Vec::new();
    for raw in text.split(['\n', '.']) {
        let line = raw.trim();
        if line.len() < 8 {
            continue;
        }
        let lower = line.to_lowercase();
        if let Some(rest) = lower
            .find("remember that ")
            .and_then(|pos| line.get(pos + "remember that ".len()..))
            .map(str::trim)
        {
            if !rest.is_empty() {
                detected.push((SmaranCategory::Instruction, rest.to_string()));
            }
        } else if lower.starts_with("always ") || lower.starts_with("never ") {
            detected.push((SmaranCategory::Instruction, line.to_string()));
        } else if lower.contains("i prefer ") || lower.starts_with("i'd rather ") {
            detected.push((SmaranCategory::Preference, line.to_string()));
        } else if lower.starts_with("my name is ") || lower.starts_with("i live in ") {
            detected.push((SmaranCategory::Fact, line.to_string()));
        } else if lower.starts_with("we decided ") || lower.starts_with("let's go with ") {
            detected.push((SmaranCategory::Decision, line.to_string()));
        }
    }
    detected
}

// ============================================================================
// SMARAN STORE
// ============================================================================

/// Store for smaran entries over the scope memory files
pub struct SmaranStore {
    files: Arc<MemoryFileStore>,
}

impl SmaranStore {
    pub fn new(files: Arc<MemoryFileStore>) -> Self {
        Self { files }
    }

    /// Remember an item; re-remembering identical content is a no-op
    pub async fn remember(
        &self,
        scope: &MemoryScope,
        category: SmaranCategory,
        content: &str,
    ) -> Result<SmaranEntry> {
        let content = content.trim();
        if content.is_empty() {
            return Err(MemoryError::Invariant("empty smaran content".to_string()));
        }
        let entry = SmaranEntry {
            id: SmaranEntry::make_id(category, content),
            category,
            content: content.to_string(),
            created_at: Utc::now(),
            confidence: 0.8,
        };

        if self.recall(scope, None)?.iter().any(|e| e.id == entry.id) {
            tracing::debug!(id = %entry.id, "smaran entry already present");
            return Ok(entry);
        }

        self.files.append(scope, entry.to_block()).await?;
        Ok(entry)
    }

    /// All entries in a scope, optionally filtered by category
    pub fn recall(
        &self,
        scope: &MemoryScope,
        category: Option<SmaranCategory>,
    ) -> Result<Vec<SmaranEntry>> {
        let entries_text = self.files.read_entries(scope)?;
        let mut entries = Vec::new();
        for block in split_blocks(&entries_text) {
            if let Some(entry) = SmaranEntry::from_block(block) {
                if category.is_none_or(|c| c == entry.category) {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    /// Forget an entry by id
    pub async fn forget(&self, scope: &MemoryScope, id: &str) -> Result<()> {
        let entries = self.recall(scope, None)?;
        if !entries.iter().any(|e| e.id == id) {
            return Err(MemoryError::NotFound(format!("smaran entry {id}")));
        }
        let remaining: Vec<String> = entries
            .iter()
            .filter(|e| e.id != id)
            .map(|e| e.to_block())
            .collect();
        let mut body = remaining.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        self.files.rewrite_entries(scope, body).await
    }

    /// Run detection over a user turn and persist what it finds
    pub async fn detect_and_remember(
        &self,
        scope: &MemoryScope,
        text: &str,
    ) -> Result<Vec<SmaranEntry>> {
        let mut remembered = Vec::new();
        for (category, content) in detect(text) {
            remembered.push(self.remember(scope, category, &content).await?);
        }
        Ok(remembered)
    }
}

fn split_blocks(entries: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut start = None;
    for (offset, _) in entries.match_indices("## [") {
        let at_line_start = offset == 0 || entries.as_bytes()[offset - 1] == b'\n';
        if at_line_start {
            if let Some(s) = start {
                blocks.push(entries[s..offset].trim_end_matches('\n'));
            }
            start = Some(offset);
        }
    }
    if let Some(s) = start {
        blocks.push(entries[s..].trim_end_matches('\n'));
    }
    blocks
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HomeLayout;
    use crate::policy::AllowAll;
    use tempfile::TempDir;

    fn store() -> (TempDir, SmaranStore) {
        let dir = TempDir::new().unwrap();
        let files = MemoryFileStore::new(HomeLayout::new(dir.path()), Arc::new(AllowAll));
        (dir, SmaranStore::new(Arc::new(files)))
    }

    #[tokio::test]
    async fn test_remember_and_recall() {
        let (_dir, store) = store();
        let scope = MemoryScope::Global;
        store
            .remember(&scope, SmaranCategory::Preference, "prefers tabs")
            .await
            .unwrap();
        store
            .remember(&scope, SmaranCategory::Fact, "lives in Lisbon")
            .await
            .unwrap();

        let all = store.recall(&scope, None).unwrap();
        assert_eq!(all.len(), 2);

        let preferences = store
            .recall(&scope, Some(SmaranCategory::Preference))
            .unwrap();
        assert_eq!(preferences.len(), 1);
        assert_eq!(preferences[0].content, "prefers tabs");
    }

    #[tokio::test]
    async fn test_remember_is_idempotent() {
        let (_dir, store) = store();
        let scope = MemoryScope::Global;
        store
            .remember(&scope, SmaranCategory::Fact, "sky is blue")
            .await
            .unwrap();
        store
            .remember(&scope, SmaranCategory::Fact, "sky is blue")
            .await
            .unwrap();
        assert_eq!(store.recall(&scope, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_forget() {
        let (_dir, store) = store();
        let scope = MemoryScope::Global;
        let kept = store
            .remember(&scope, SmaranCategory::Fact, "keep me")
            .await
            .unwrap();
        let dropped = store
            .remember(&scope, SmaranCategory::Fact, "drop me")
            .await
            .unwrap();

        store.forget(&scope, &dropped.id).await.unwrap();
        let remaining = store.recall(&scope, None).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, kept.id);

        // Forgetting again is NotFound, never silent
        assert!(matches!(
            store.forget(&scope, &dropped.id).await.unwrap_err(),
            MemoryError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_empty_content_rejected() {
        let (_dir, store) = store();
        let err = store
            .remember(&MemoryScope::Global, SmaranCategory::Fact, "   ")
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Invariant(_)));
    }

    #[test]
    fn test_detection_heuristics() {
        let detected = detect(
            "Remember that deploys happen on Fridays.\n\
             I prefer short variable names.\n\
             My name is Ada.\n\
             We decided to use sqlite.\n\
             Always run the linter first.\n\
             ok thanks",
        );
        let categories: Vec<SmaranCategory> = detected.iter().map(|(c, _)| *c).collect();
        assert!(categories.contains(&SmaranCategory::Instruction));
        assert!(categories.contains(&SmaranCategory::Preference));
        assert!(categories.contains(&SmaranCategory::Fact));
        assert!(categories.contains(&SmaranCategory::Decision));
        // Short acknowledgements never match
        assert!(detect("ok thanks").is_empty());
    }

    #[test]
    fn test_entry_block_roundtrip() {
        let entry = SmaranEntry {
            id: SmaranEntry::make_id(SmaranCategory::Decision, "use sqlite"),
            category: SmaranCategory::Decision,
            content: "use sqlite".into(),
            created_at: Utc::now(),
            confidence: 0.8,
        };
        let parsed = SmaranEntry::from_block(&entry.to_block()).unwrap();
        assert_eq!(parsed.id, entry.id);
        assert_eq!(parsed.category, entry.category);
        assert_eq!(parsed.content, entry.content);
    }
}
