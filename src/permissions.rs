//! Permission seam. `spec.md` explicitly scopes the policy that decides
//! allow/deny/ask out of this crate — only the decision point the loop calls
//! through lives here, grounded in `other_examples`' `PermissionChecker` /
//! `PermissionDecision::{Approved, Denied, NeedsConfirmation}` shape.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny(String),
    /// Needs interactive confirmation. No prompter is wired in this crate,
    /// so the loop treats this the same as `Deny` — see `spec.md` §9.
    Ask,
}

#[async_trait::async_trait]
pub trait Permissions: Send + Sync {
    async fn check(&self, tool_name: &str, input: &serde_json::Value) -> PermissionDecision;
}

/// Default policy: everything is allowed. Useful for tests and for hosts
/// that implement their own gating above this crate.
pub struct AllowAll;

#[async_trait::async_trait]
impl Permissions for AllowAll {
    async fn check(&self, _tool_name: &str, _input: &serde_json::Value) -> PermissionDecision {
        PermissionDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_all_always_allows() {
        let p = AllowAll;
        assert_eq!(
            p.check("bash", &serde_json::json!({})).await,
            PermissionDecision::Allow
        );
    }
}
