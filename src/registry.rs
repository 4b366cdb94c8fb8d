//! Tool registry — name-keyed store of callable tools, holding both
//! statically-registered (built-in) tools and dynamically-grafted MCP tools.
//! Grounded in `provider::registry::ProviderRegistry`'s HashMap-keyed
//! register/get/has shape, generalized with the disabled-set and
//! lexicographic-export behavior `spec.md` §4.2 requires.

use crate::tool::{Tool, ToolDefinition};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("tool already registered: {0}")]
    DuplicateName(String),
}

/// Single-lock registry. All mutation goes through `&self` (interior
/// `RwLock`) so the registry can be shared behind an `Arc` across the loop,
/// MCP reconciliation, and the background task manager.
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    tools: HashMap<String, Arc<dyn Tool>>,
    disabled: HashSet<String>,
    allowed: HashSet<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `WithAllowed(names...)` per `spec.md` §4.2: marks these tool names as
    /// not requiring a permission prompt (the registry only records the set;
    /// a `Permissions` policy is what actually consults it). Chainable with
    /// `with_disabled`; marking a name allowed clears it from `disabled` to
    /// keep the two sets disjoint.
    pub fn with_allowed(self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        {
            let mut inner = self.inner.write().unwrap();
            for name in names {
                let name = name.into();
                inner.disabled.remove(&name);
                inner.allowed.insert(name);
            }
        }
        self
    }

    /// `WithDisabled(names...)`: hides a tool from `names()`/`export_for_llm()`
    /// while leaving it retrievable via `get()`. Marking a name disabled
    /// clears it from `allowed` to keep the two sets disjoint.
    pub fn with_disabled(self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        {
            let mut inner = self.inner.write().unwrap();
            for name in names {
                let name = name.into();
                inner.allowed.remove(&name);
                inner.disabled.insert(name);
            }
        }
        self
    }

    /// Mutates the allowed set after construction; see `with_allowed`.
    pub fn set_allowed(&self, name: &str, allowed: bool) {
        let mut inner = self.inner.write().unwrap();
        if allowed {
            inner.disabled.remove(name);
            inner.allowed.insert(name.to_string());
        } else {
            inner.allowed.remove(name);
        }
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        self.inner.read().unwrap().allowed.contains(name)
    }

    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().unwrap();
        let name = tool.name().to_string();
        if inner.tools.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }
        inner.tools.insert(name, tool);
        Ok(())
    }

    /// Overwrite-or-insert; used when MCP reconciliation re-registers a tool
    /// whose schema changed but whose name didn't.
    pub fn upsert(&self, tool: Arc<dyn Tool>) {
        let mut inner = self.inner.write().unwrap();
        inner.tools.insert(tool.name().to_string(), tool);
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let mut inner = self.inner.write().unwrap();
        inner.tools.remove(name)
    }

    /// Remove every tool whose name starts with `prefix` (used when an MCP
    /// server disconnects or is removed by `SetServers`). Returns the names
    /// removed.
    pub fn unregister_by_prefix(&self, prefix: &str) -> Vec<String> {
        let mut inner = self.inner.write().unwrap();
        let names: Vec<String> = inner
            .tools
            .keys()
            .filter(|n| n.starts_with(prefix))
            .cloned()
            .collect();
        for name in &names {
            inner.tools.remove(name);
        }
        names
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.inner.read().unwrap().tools.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.read().unwrap().tools.contains_key(name)
    }

    pub fn set_disabled(&self, name: &str, disabled: bool) {
        let mut inner = self.inner.write().unwrap();
        if disabled {
            inner.allowed.remove(name);
            inner.disabled.insert(name.to_string());
        } else {
            inner.disabled.remove(name);
        }
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        self.inner.read().unwrap().disabled.contains(name)
    }

    /// Names of every enabled tool, lexicographically sorted.
    pub fn names(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        let mut names: Vec<String> = inner
            .tools
            .keys()
            .filter(|n| !inner.disabled.contains(*n))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Definitions for every enabled tool, in the same lexicographic order
    /// as `names()` — this is the copy handed to the LLM transport adapter
    /// each turn, so callers never iterate the registry while holding its lock.
    pub fn export_for_llm(&self) -> Vec<ToolDefinition> {
        let inner = self.inner.read().unwrap();
        let mut entries: Vec<(&String, &Arc<dyn Tool>)> = inner
            .tools
            .iter()
            .filter(|(name, _)| !inner.disabled.contains(*name))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, t)| t.definition()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{SideEffect, ToolContext, ToolError, ToolOutcome};

    struct Stub(&'static str);

    #[async_trait::async_trait]
    impl Tool for Stub {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "stub"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({})
        }
        fn side_effect(&self) -> SideEffect {
            SideEffect::None
        }
        async fn execute(&self, _ctx: &ToolContext, _input: serde_json::Value) -> Result<ToolOutcome, ToolError> {
            Ok(ToolOutcome::ok(""))
        }
    }

    #[test]
    fn duplicate_register_fails() {
        let reg = ToolRegistry::new();
        reg.register(Arc::new(Stub("a"))).unwrap();
        assert!(reg.register(Arc::new(Stub("a"))).is_err());
    }

    #[test]
    fn export_is_lexicographic_and_excludes_disabled() {
        let reg = ToolRegistry::new();
        reg.register(Arc::new(Stub("zebra"))).unwrap();
        reg.register(Arc::new(Stub("apple"))).unwrap();
        reg.register(Arc::new(Stub("mango"))).unwrap();
        reg.set_disabled("mango", true);

        let names = reg.names();
        assert_eq!(names, vec!["apple".to_string(), "zebra".to_string()]);

        let defs = reg.export_for_llm();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].name, "apple");
        assert_eq!(defs[1].name, "zebra");
    }

    #[test]
    fn with_allowed_marks_names_without_affecting_export() {
        let reg = ToolRegistry::new().with_allowed(["bash"]);
        reg.register(Arc::new(Stub("bash"))).unwrap();

        assert!(reg.is_allowed("bash"));
        assert_eq!(reg.names(), vec!["bash".to_string()]);
    }

    #[test]
    fn allowed_and_disabled_stay_disjoint_regardless_of_mutation_order() {
        let reg = ToolRegistry::new();
        reg.register(Arc::new(Stub("bash"))).unwrap();

        reg.set_allowed("bash", true);
        assert!(reg.is_allowed("bash"));
        assert!(!reg.is_disabled("bash"));

        reg.set_disabled("bash", true);
        assert!(reg.is_disabled("bash"));
        assert!(!reg.is_allowed("bash"), "disabling must clear the allowed flag");

        reg.set_allowed("bash", true);
        assert!(reg.is_allowed("bash"));
        assert!(!reg.is_disabled("bash"), "allowing must clear the disabled flag");
    }

    #[test]
    fn with_disabled_and_with_allowed_compose_and_stay_disjoint() {
        let reg = ToolRegistry::new().with_allowed(["a"]).with_disabled(["a"]);
        assert!(reg.is_disabled("a"));
        assert!(!reg.is_allowed("a"));
    }

    #[test]
    fn unregister_by_prefix_removes_matching() {
        let reg = ToolRegistry::new();
        reg.register(Arc::new(Stub("mcp__fs__read"))).unwrap();
        reg.register(Arc::new(Stub("mcp__fs__write"))).unwrap();
        reg.register(Arc::new(Stub("bash"))).unwrap();

        let removed = reg.unregister_by_prefix("mcp__fs__");
        assert_eq!(removed.len(), 2);
        assert!(reg.has("bash"));
        assert!(!reg.has("mcp__fs__read"));
    }
}
