//! Mapping of step target names onto registered executables.

use std::sync::Arc;

use crate::io::model::{FunctionRole, ModelFunction};
use crate::io::registry::Registry;
use crate::io::tool::Tool;

/// What a step's target name resolved to.
#[derive(Clone)]
pub enum ExecutableItem {
    Tool(Arc<dyn Tool>),
    ModelFunction(Arc<dyn ModelFunction>),
}

impl ExecutableItem {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Tool(_) => "tool",
            Self::ModelFunction(_) => "function",
        }
    }

    pub fn as_tool(&self) -> Option<&dyn Tool> {
        match self {
            Self::Tool(tool) => Some(tool.as_ref()),
            Self::ModelFunction(_) => None,
        }
    }
}

impl std::fmt::Debug for ExecutableItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tool(tool) => f.debug_tuple("Tool").field(&tool.name()).finish(),
            Self::ModelFunction(function) => f.debug_tuple("ModelFunction").field(&function.role()).finish(),
        }
    }
}

/// Tools win over model functions when a name could mean either.
pub struct ExecutableResolver {
    registry: Arc<dyn Registry>,
}

impl ExecutableResolver {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }

    /// `None` means neither a tool nor a role matched `target_name`.
    pub fn resolve(&self, target_name: &str) -> Option<ExecutableItem> {
        let name = target_name.trim();
        if name.is_empty() {
            return None;
        }
        if let Some(tool) = self.registry.tool(name) {
            return Some(ExecutableItem::Tool(tool));
        }
        let role = name.parse::<FunctionRole>().ok()?;
        self.registry
            .model_function(role)
            .map(ExecutableItem::ModelFunction)
    }
}
