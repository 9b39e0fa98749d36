//! Memory file writer
//!
//! Writes to a scope's file go through a bounded mailbox consumed by one
//! task per scope, so writes serialise in arrival order while readers hit
//! the file directly and never block. Files that outgrow `MAX_MEMORY_SIZE`
//! lose their oldest entries; the header always survives.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::config::{HomeLayout, MAX_MEMORY_SIZE};
use crate::error::{MemoryError, Result};
use crate::policy::PolicyEngine;

use super::MemoryScope;

/// Marker closing the header block; entries follow it
pub const MEMORY_FILE_HEADER_MARKER: &str = "<!-- entries -->";

/// Mailbox capacity per scope
const SCOPE_QUEUE_DEPTH: usize = 64;

// ============================================================================
// WRITE REQUESTS
// ============================================================================

enum WriteOp {
    /// Append a block after the header
    Append(String),
    /// Replace everything after the header
    RewriteEntries(String),
}

struct WriteRequest {
    op: WriteOp,
    ack: oneshot::Sender<Result<()>>,
}

// ============================================================================
// MEMORY FILE STORE
// ============================================================================

/// Per-scope serialised writer over markdown memory files
pub struct MemoryFileStore {
    layout: HomeLayout,
    policy: Arc<dyn PolicyEngine>,
    queues: Mutex<HashMap<PathBuf, mpsc::Sender<WriteRequest>>>,
}

impl MemoryFileStore {
    pub fn new(layout: HomeLayout, policy: Arc<dyn PolicyEngine>) -> Self {
        Self {
            layout,
            policy,
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &HomeLayout {
        &self.layout
    }

    fn header_for(scope: &MemoryScope) -> String {
        format!(
            "# Memory ({})\n\n{}\n",
            scope.label(),
            MEMORY_FILE_HEADER_MARKER
        )
    }

    /// Split a file into (header, entries); files written before the marker
    /// existed count entirely as entries under a fresh header
    fn split(content: &str, scope: &MemoryScope) -> (String, String) {
        match content.find(MEMORY_FILE_HEADER_MARKER) {
            Some(pos) => {
                let split_at = pos + MEMORY_FILE_HEADER_MARKER.len();
                (
                    content[..split_at].to_string() + "\n",
                    content[split_at..].trim_start_matches('\n').to_string(),
                )
            }
            None => (Self::header_for(scope), content.to_string()),
        }
    }

    /// Drop oldest entries until the file fits the size ceiling
    fn truncate_oldest(header: &str, entries: &str) -> String {
        let mut blocks: Vec<&str> = Vec::new();
        let mut start = 0;
        let bytes = entries.as_bytes();
        for (i, _) in entries.match_indices("\n## ") {
            if i > start {
                blocks.push(&entries[start..i]);
            }
            start = i + 1;
        }
        if start < bytes.len() {
            blocks.push(&entries[start..]);
        }

        // Remove from the front until the whole file fits
        let mut kept: Vec<&str> = blocks;
        while !kept.is_empty() {
            let size = header.len() + kept.iter().map(|b| b.len() + 1).sum::<usize>();
            if size <= MAX_MEMORY_SIZE {
                break;
            }
            kept.remove(0);
        }
        let mut out = header.to_string();
        for block in kept {
            out.push_str(block.trim_end_matches('\n'));
            out.push('\n');
        }
        out
    }

    fn apply(path: &Path, scope: &MemoryScope, op: &WriteOp) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let existing = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::header_for(scope),
            Err(e) => return Err(e.into()),
        };
        let (header, entries) = Self::split(&existing, scope);

        let new_entries = match op {
            WriteOp::Append(block) => {
                let mut combined = entries;
                if !combined.is_empty() && !combined.ends_with('\n') {
                    combined.push('\n');
                }
                combined.push_str(block.trim_end_matches('\n'));
                combined.push('\n');
                combined
            }
            WriteOp::RewriteEntries(full) => full.clone(),
        };

        let mut content = header.clone();
        content.push_str(&new_entries);
        if content.len() > MAX_MEMORY_SIZE {
            content = Self::truncate_oldest(&header, &new_entries);
        }

        let tmp = path.with_extension("md.tmp");
        std::fs::write(&tmp, &content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn sender_for(&self, scope: &MemoryScope) -> Result<mpsc::Sender<WriteRequest>> {
        let path = scope.path(&self.layout);
        let mut queues = self
            .queues
            .lock()
            .map_err(|_| MemoryError::lock("memory queues"))?;
        if let Some(sender) = queues.get(&path) {
            if !sender.is_closed() {
                return Ok(sender.clone());
            }
        }

        let (sender, mut receiver) = mpsc::channel::<WriteRequest>(SCOPE_QUEUE_DEPTH);
        let task_path = path.clone();
        let task_scope = scope.clone();
        tokio::spawn(async move {
            while let Some(request) = receiver.recv().await {
                let result = Self::apply(&task_path, &task_scope, &request.op);
                // A dropped ack means the sender gave up; the write stands
                let _ = request.ack.send(result);
            }
        });
        queues.insert(path, sender.clone());
        Ok(sender)
    }

    async fn submit(&self, scope: &MemoryScope, op: WriteOp) -> Result<()> {
        let decision = self.policy.check(
            "memory_write",
            &serde_json::json!({ "scope": scope.label() }),
        );
        if !decision.allowed {
            return Err(MemoryError::Policy(
                decision.reason.unwrap_or_else(|| "denied".to_string()),
            ));
        }

        let sender = self.sender_for(scope)?;
        let (ack, confirm) = oneshot::channel();
        sender
            .send(WriteRequest { op, ack })
            .await
            .map_err(|_| MemoryError::Cancelled)?;
        confirm.await.map_err(|_| MemoryError::Cancelled)?
    }

    /// Append an entry block to a scope's file
    pub async fn append(&self, scope: &MemoryScope, block: String) -> Result<()> {
        self.submit(scope, WriteOp::Append(block)).await
    }

    /// Replace all entries in a scope's file, keeping the header
    pub async fn rewrite_entries(&self, scope: &MemoryScope, entries: String) -> Result<()> {
        self.submit(scope, WriteOp::RewriteEntries(entries)).await
    }

    /// Read a scope's file; an absent file reads as just the header
    pub fn read(&self, scope: &MemoryScope) -> Result<String> {
        let path = scope.path(&self.layout);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::header_for(scope)),
            Err(e) => Err(e.into()),
        }
    }

    /// Entries portion of a scope's file
    pub fn read_entries(&self, scope: &MemoryScope) -> Result<String> {
        let content = self.read(scope)?;
        Ok(Self::split(&content, scope).1)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{AllowAll, PolicyDecision};
    use tempfile::TempDir;

    fn store() -> (TempDir, MemoryFileStore) {
        let dir = TempDir::new().unwrap();
        let layout = HomeLayout::new(dir.path());
        (dir, MemoryFileStore::new(layout, Arc::new(AllowAll)))
    }

    #[tokio::test]
    async fn test_append_creates_file_with_header() {
        let (_dir, store) = store();
        let scope = MemoryScope::Global;
        store
            .append(&scope, "## [fact] water is wet".to_string())
            .await
            .unwrap();

        let content = store.read(&scope).unwrap();
        assert!(content.starts_with("# Memory (global)"));
        assert!(content.contains(MEMORY_FILE_HEADER_MARKER));
        assert!(content.contains("## [fact] water is wet"));
    }

    #[tokio::test]
    async fn test_appends_keep_arrival_order() {
        let (_dir, store) = store();
        let scope = MemoryScope::Project("/p".into());
        for i in 0..5 {
            store
                .append(&scope, format!("## [fact] entry {i}"))
                .await
                .unwrap();
        }
        let entries = store.read_entries(&scope).unwrap();
        let positions: Vec<usize> = (0..5)
            .map(|i| entries.find(&format!("entry {i}")).unwrap())
            .collect();
        for pair in positions.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[tokio::test]
    async fn test_truncation_preserves_header_and_newest() {
        let (_dir, store) = store();
        let scope = MemoryScope::Global;
        // Each block ~50 KB; eleven of them exceed the 500 KB ceiling
        for i in 0..11 {
            let body = "x".repeat(50 * 1024);
            store
                .append(&scope, format!("## [fact] block {i}\n{body}"))
                .await
                .unwrap();
        }
        let content = store.read(&scope).unwrap();
        assert!(content.len() <= MAX_MEMORY_SIZE);
        assert!(content.starts_with("# Memory (global)"));
        // Oldest dropped, newest kept
        assert!(!content.contains("block 0"));
        assert!(content.contains("block 10"));
    }

    #[tokio::test]
    async fn test_policy_denial_surfaces() {
        struct DenyAll;
        impl PolicyEngine for DenyAll {
            fn check(&self, _tool: &str, _args: &serde_json::Value) -> PolicyDecision {
                PolicyDecision::deny("frozen")
            }
        }
        let dir = TempDir::new().unwrap();
        let store = MemoryFileStore::new(HomeLayout::new(dir.path()), Arc::new(DenyAll));
        let err = store
            .append(&MemoryScope::Global, "## [fact] nope".to_string())
            .await
            .unwrap_err();
        match err {
            MemoryError::Policy(reason) => assert_eq!(reason, "frozen"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_missing_file_yields_header() {
        let (_dir, store) = store();
        let content = store.read(&MemoryScope::Agent("helper".into())).unwrap();
        assert!(content.starts_with("# Memory (agent helper)"));
        assert_eq!(store.read_entries(&MemoryScope::Agent("helper".into())).unwrap(), "");
    }
}
