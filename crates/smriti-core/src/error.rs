//! Crate-wide error type
//!
//! One semantic error enum shared by every component. Leaf operations return
//! rich kinds; orchestrators catch and degrade where the contract allows it.

use std::time::Duration;

// ============================================================================
// ERROR TYPE
// ============================================================================

/// Error kinds surfaced by the memory core
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// A session, memory, node, or checkpoint that should exist does not
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed input: bad date, invalid front-matter, ordinal conflict,
    /// simplex violation
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// Retriable condition that stayed broken after bounded retries
    #[error("Transient failure after {attempts} attempts: {message}")]
    Transient { message: String, attempts: u32 },

    /// Unreadable checkpoint, embedding blob, or index row
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Write denied by the policy collaborator
    #[error("Denied by policy: {0}")]
    Policy(String),

    /// Cooperative cancellation observed at a suspension point
    #[error("Operation cancelled")]
    Cancelled,

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl MemoryError {
    /// Shorthand for poisoned-lock conditions, which we treat as transient
    pub(crate) fn lock(what: &str) -> Self {
        MemoryError::Transient {
            message: format!("{what} lock poisoned"),
            attempts: 1,
        }
    }

    /// Whether a retry loop should attempt this error again
    pub fn is_retriable(&self) -> bool {
        match self {
            MemoryError::Transient { .. } => true,
            MemoryError::Database(rusqlite::Error::SqliteFailure(e, _)) => {
                matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                )
            }
            MemoryError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, MemoryError>;

// ============================================================================
// RETRY HELPER
// ============================================================================

/// Bounded retry policy for transient failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first
    pub max_attempts: u32,
    /// Base delay; attempt n sleeps n * base_delay
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, returns a non-retriable error, or the
    /// attempt budget is spent. The final transient error is surfaced with
    /// its attempt count.
    pub fn run<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() && attempt < self.max_attempts => {
                    tracing::debug!(attempt, error = %e, "retrying transient failure");
                    std::thread::sleep(self.base_delay * attempt);
                }
                Err(MemoryError::Transient { message, .. }) => {
                    return Err(MemoryError::Transient {
                        message,
                        attempts: attempt,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
