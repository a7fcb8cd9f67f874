//! Capability host: binds pluggable [`CapabilityModule`]s into one
//! [`ToolRegistry`] before a session starts.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

use crate::error::{CapabilityError, ToolError};
use crate::tools::registry::{ToolRegistry, ToolSuite};

/// Small value-typed record passed to every module's `create`, so a
/// module never needs a back-reference into the host that builds it.
#[derive(Clone, Debug, Default)]
pub struct CapabilityContext {
    pub profile: String,
    pub working_dir: PathBuf,
    pub workspace_context: Option<String>,
    pub env: HashMap<String, String>,
}

/// One tool suite (plus descriptive metadata) contributed by a module.
pub struct Contribution {
    pub id: String,
    pub module_id: String,
    pub description: Option<String>,
    pub metadata: Option<Value>,
    pub suite: ToolSuite,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityDescriptor {
    pub contribution_id: String,
    pub module_id: String,
    pub description: Option<String>,
    pub metadata: Option<Value>,
}

pub trait CapabilityModule: Send + Sync {
    fn id(&self) -> &str;
    fn create(&self, ctx: &CapabilityContext) -> Result<Vec<Contribution>, CapabilityError>;

    /// Best-effort teardown hook, called once per module on host
    /// shutdown. The default does nothing.
    fn dispose(&self) {}
}

pub struct CapabilityHost {
    modules: Vec<Box<dyn CapabilityModule>>,
    frozen: AtomicBool,
}

impl Default for CapabilityHost {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityHost {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
            frozen: AtomicBool::new(false),
        }
    }

    /// Registers a module. Only permitted before the first [`build`](Self::build)
    /// call; afterward the host is frozen and this returns `SessionFrozen`.
    pub fn register_module(
        &mut self,
        module: Box<dyn CapabilityModule>,
    ) -> Result<(), CapabilityError> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(CapabilityError::SessionFrozen);
        }
        self.modules.push(module);
        Ok(())
    }

    /// Binds every registered module's contributions into one
    /// [`ToolRegistry`], in registration order, then freezes the host.
    pub fn build(&self, ctx: &CapabilityContext) -> Result<ToolRegistry, CapabilityError> {
        self.frozen.store(true, Ordering::SeqCst);

        let mut registry = ToolRegistry::new();
        let mut seen_contribution_ids = HashSet::new();

        for module in &self.modules {
            for contribution in module.create(ctx)? {
                if !seen_contribution_ids.insert(contribution.id.clone()) {
                    return Err(CapabilityError::DuplicateContribution(contribution.id));
                }
                match registry.register_suite(contribution.suite) {
                    Ok(()) => {}
                    Err(ToolError::DuplicateSuite(id)) => {
                        return Err(CapabilityError::DuplicateSuite(id));
                    }
                    Err(err) => return Err(CapabilityError::Tool(err)),
                }
            }
        }

        Ok(registry)
    }

    /// Publishes a manifest of what each module would contribute,
    /// without mutating any shared registry state.
    pub fn describe_capabilities(
        &self,
        ctx: &CapabilityContext,
    ) -> Result<Vec<CapabilityDescriptor>, CapabilityError> {
        let mut descriptors = Vec::new();
        for module in &self.modules {
            for contribution in module.create(ctx)? {
                descriptors.push(CapabilityDescriptor {
                    contribution_id: contribution.id,
                    module_id: contribution.module_id,
                    description: contribution.description,
                    metadata: contribution.metadata,
                });
            }
        }
        Ok(descriptors)
    }

    /// Disposes every module best-effort; a panicking or failing
    /// `dispose` is logged and does not stop the remaining modules.
    pub fn dispose(&self) {
        for module in &self.modules {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| module.dispose()));
            if result.is_err() {
                log::warn!("capability module '{}' panicked during dispose", module.id());
            }
        }
    }
}

/// Wraps the sandbox tool suite (`bash`/`read`/`write`/`edit`/`glob`/
/// `grep`/`todo_read`/`todo_write`/`done`) as a concrete, non-test
/// capability module.
pub struct SandboxCapability;

impl CapabilityModule for SandboxCapability {
    fn id(&self) -> &str {
        "sandbox"
    }

    fn create(&self, _ctx: &CapabilityContext) -> Result<Vec<Contribution>, CapabilityError> {
        let tools = crate::tools::claude_code::all_tools();
        Ok(vec![Contribution {
            id: "sandbox.tools".to_string(),
            module_id: self.id().to_string(),
            description: Some("Bash/file/search/todo tools sandboxed to a working directory".to_string()),
            metadata: None,
            suite: ToolSuite::new("sandbox", tools),
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticModule {
        id: String,
        contribution_id: String,
        suite_id: String,
    }

    impl StaticModule {
        fn new(id: &str, contribution_id: &str) -> Self {
            Self {
                id: id.to_string(),
                contribution_id: contribution_id.to_string(),
                suite_id: id.to_string(),
            }
        }

        fn with_suite_id(id: &str, contribution_id: &str, suite_id: &str) -> Self {
            Self {
                id: id.to_string(),
                contribution_id: contribution_id.to_string(),
                suite_id: suite_id.to_string(),
            }
        }
    }

    impl CapabilityModule for StaticModule {
        fn id(&self) -> &str {
            &self.id
        }

        fn create(&self, _ctx: &CapabilityContext) -> Result<Vec<Contribution>, CapabilityError> {
            Ok(vec![Contribution {
                id: self.contribution_id.clone(),
                module_id: self.id.clone(),
                description: None,
                metadata: None,
                suite: ToolSuite::new(self.suite_id.clone(), vec![]),
            }])
        }
    }

    #[test]
    fn build_freezes_host_against_further_registration() {
        let mut host = CapabilityHost::new();
        host.register_module(Box::new(StaticModule::new("a", "a.c")))
            .expect("registers before freeze");

        host.build(&CapabilityContext::default()).expect("builds");

        let err = host
            .register_module(Box::new(StaticModule::new("b", "b.c")))
            .expect_err("should be frozen");
        assert!(matches!(err, CapabilityError::SessionFrozen));
    }

    #[test]
    fn build_rejects_duplicate_contribution_ids() {
        let mut host = CapabilityHost::new();
        host.register_module(Box::new(StaticModule::new("a", "shared")))
            .unwrap();
        host.register_module(Box::new(StaticModule::new("b", "shared")))
            .unwrap();

        let err = host
            .build(&CapabilityContext::default())
            .expect_err("duplicate contribution should fail");
        assert!(matches!(err, CapabilityError::DuplicateContribution(_)));
    }

    #[test]
    fn build_rejects_duplicate_suite_ids_across_modules() {
        let mut host = CapabilityHost::new();
        host.register_module(Box::new(StaticModule::with_suite_id("a", "a.c", "shared")))
            .unwrap();
        host.register_module(Box::new(StaticModule::with_suite_id("b", "b.c", "shared")))
            .unwrap();

        let err = host
            .build(&CapabilityContext::default())
            .expect_err("duplicate suite id should fail");
        assert!(matches!(err, CapabilityError::DuplicateSuite(id) if id == "shared"));
    }

    #[test]
    fn sandbox_capability_contributes_one_suite() {
        let descriptors = {
            let mut host = CapabilityHost::new();
            host.register_module(Box::new(SandboxCapability)).unwrap();
            host.describe_capabilities(&CapabilityContext::default())
                .expect("describes")
        };

        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].module_id, "sandbox");
    }

    #[test]
    fn dispose_survives_a_panicking_module() {
        struct PanicsOnDispose;
        impl CapabilityModule for PanicsOnDispose {
            fn id(&self) -> &str {
                "panics"
            }
            fn create(&self, _ctx: &CapabilityContext) -> Result<Vec<Contribution>, CapabilityError> {
                Ok(vec![])
            }
            fn dispose(&self) {
                panic!("boom");
            }
        }

        let mut host = CapabilityHost::new();
        host.register_module(Box::new(PanicsOnDispose)).unwrap();
        host.dispose();
    }
}
