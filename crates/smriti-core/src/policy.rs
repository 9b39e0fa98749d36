//! Policy engine contract
//!
//! The policy engine is an external collaborator consulted before any write
//! that crosses a boundary (memory files, consolidation outputs). Pure reads
//! never go through policy.

use serde::{Deserialize, Serialize};

/// Outcome of a policy check
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    pub allowed: bool,
    /// Reason supplied by the policy when denying
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// External policy collaborator
pub trait PolicyEngine: Send + Sync {
    /// Check whether a boundary-crossing write may proceed
    fn check(&self, tool_name: &str, args: &serde_json::Value) -> PolicyDecision;
}

/// Default engine used when no policy collaborator is wired
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PolicyEngine for AllowAll {
    fn check(&self, _tool_name: &str, _args: &serde_json::Value) -> PolicyDecision {
        PolicyDecision::allow()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all() {
        let engine = AllowAll;
        let decision = engine.check("memory_write", &serde_json::json!({"scope": "global"}));
        assert!(decision.allowed);
        assert!(decision.reason.is_none());
    }

    #[test]
    fn test_deny_carries_reason() {
        struct DenyWrites;
        impl PolicyEngine for DenyWrites {
            fn check(&self, tool_name: &str, _args: &serde_json::Value) -> PolicyDecision {
                if tool_name.ends_with("_write") {
                    PolicyDecision::deny("writes are frozen")
                } else {
                    PolicyDecision::allow()
                }
            }
        }
        let decision = DenyWrites.check("memory_write", &serde_json::Value::Null);
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("writes are frozen"));
    }
}
