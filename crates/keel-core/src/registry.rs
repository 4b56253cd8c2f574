//! Declaration registry.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::declaration::WorkflowDeclaration;
use crate::error::CoreError;

/// Append-only name-to-declaration map.
///
/// Populated at startup, immutable afterwards; workers resolve handlers
/// through it on every delivery.
#[derive(Default)]
pub struct Registry {
    declarations: HashMap<String, Arc<WorkflowDeclaration>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a declaration. A duplicate name is a startup error.
    pub fn register(&mut self, declaration: WorkflowDeclaration) -> Result<(), CoreError> {
        let name = declaration.name().to_string();
        if self.declarations.contains_key(&name) {
            return Err(CoreError::DuplicateDeclaration(name));
        }
        debug!("registered declaration '{}'", name);
        self.declarations.insert(name, Arc::new(declaration));
        Ok(())
    }

    /// Look up a declaration by name.
    pub fn get(&self, name: &str) -> Option<Arc<WorkflowDeclaration>> {
        self.declarations.get(name).cloned()
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.declarations.keys().cloned().collect();
        names.sort();
        names
    }

    /// All registered declarations.
    pub fn declarations(&self) -> impl Iterator<Item = &Arc<WorkflowDeclaration>> {
        self.declarations.values()
    }

    /// Number of registered declarations.
    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }
}
