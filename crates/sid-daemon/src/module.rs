//! Module callback contract and registries.
//!
//! Modules observe every device through the scan phase sequence. Two
//! registries exist: *block* modules run for every device in registration
//! order, and *type* modules run only when matched against the device's
//! driver name (resolved in the `IDENT` phase) or nominated as the "next
//! layer" module by a previous phase.
//!
//! The module loader itself is an external collaborator; modules here are
//! trait objects registered programmatically. A module entry point
//! returning an error marks the phase failed, which routes the command
//! through the error phase once and on to exit.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::cmd::{UcmdCtx, UcmdError};
use crate::device::canonicalize_module_name;

/// Owner name used by the core itself.
pub const OWNER_CORE: &str = "#core";

/// Failure returned from a module entry point.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ModuleError {
    /// Module-specific failure.
    #[error("module failure: {0}")]
    Failed(String),

    /// Failure propagated from the module-facing KV API.
    #[error(transparent)]
    Ucmd(#[from] UcmdError),
}

/// Result of a module entry point.
pub type ModuleResult = Result<(), ModuleError>;

/// Per-phase entry points of a module.
///
/// Every method defaults to a no-op so a module only implements the
/// phases it cares about, mirroring optional symbols in a loaded module.
#[allow(unused_variables)]
pub trait ScanModule: Send + Sync {
    /// Canonical module name.
    fn name(&self) -> &str;

    /// Identification phase.
    fn ident(&self, ctx: &mut UcmdCtx) -> ModuleResult {
        Ok(())
    }

    /// Pre-scan phase; may set device ready state.
    fn scan_pre(&self, ctx: &mut UcmdCtx) -> ModuleResult {
        Ok(())
    }

    /// Current-layer scan phase; may set device ready state.
    fn scan_current(&self, ctx: &mut UcmdCtx) -> ModuleResult {
        Ok(())
    }

    /// Next-layer scan phase; may set device reserved state.
    fn scan_next(&self, ctx: &mut UcmdCtx) -> ModuleResult {
        Ok(())
    }

    /// Post-scan phase for the current layer.
    fn scan_post_current(&self, ctx: &mut UcmdCtx) -> ModuleResult {
        Ok(())
    }

    /// Post-scan phase for the next layer.
    fn scan_post_next(&self, ctx: &mut UcmdCtx) -> ModuleResult {
        Ok(())
    }

    /// Trigger-action phase for the current layer.
    fn trigger_action_current(&self, ctx: &mut UcmdCtx) -> ModuleResult {
        Ok(())
    }

    /// Trigger-action phase for the next layer.
    fn trigger_action_next(&self, ctx: &mut UcmdCtx) -> ModuleResult {
        Ok(())
    }

    /// Error handler, invoked once when any phase of the command failed.
    fn error(&self, ctx: &mut UcmdCtx) -> ModuleResult {
        Ok(())
    }
}

/// A registered module.
pub type ModuleRef = Arc<dyn ScanModule>;

/// Block and type module registries.
#[derive(Default)]
pub struct ModuleRegistry {
    block: Vec<ModuleRef>,
    types: HashMap<String, ModuleRef>,
    type_order: Vec<String>,
}

impl ModuleRegistry {
    /// New empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a block module; fan-out follows registration order.
    pub fn register_block(&mut self, module: ModuleRef) {
        self.block.push(module);
    }

    /// Register a type module under its canonical name.
    pub fn register_type(&mut self, module: ModuleRef) {
        let name = canonicalize_module_name(module.name());
        if self.types.insert(name.clone(), module).is_none() {
            self.type_order.push(name);
        }
    }

    /// All block modules in registration order.
    #[must_use]
    pub fn block_modules(&self) -> &[ModuleRef] {
        &self.block
    }

    /// Look up a type module by canonical name.
    #[must_use]
    pub fn type_module(&self, name: &str) -> Option<ModuleRef> {
        self.types.get(&canonicalize_module_name(name)).cloned()
    }

    /// Names of registered type modules, in registration order.
    #[must_use]
    pub fn type_names(&self) -> &[String] {
        &self.type_order
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("block", &self.block.len())
            .field("types", &self.type_order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(&'static str);

    impl ScanModule for Noop {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn type_lookup_is_canonicalized() {
        let mut reg = ModuleRegistry::new();
        reg.register_type(Arc::new(Noop("device-mapper")));
        assert!(reg.type_module("device_mapper").is_some());
        assert!(reg.type_module("device-mapper").is_some());
        assert!(reg.type_module("md").is_none());
    }

    #[test]
    fn block_order_is_registration_order() {
        let mut reg = ModuleRegistry::new();
        reg.register_block(Arc::new(Noop("b1")));
        reg.register_block(Arc::new(Noop("b2")));
        let names: Vec<_> = reg.block_modules().iter().map(|m| m.name().to_string()).collect();
        assert_eq!(names, vec!["b1", "b2"]);
    }
}
