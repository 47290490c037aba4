//! Lookup of tools by name and model functions by role.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::io::model::{FunctionRole, ModelFunction};
use crate::io::tool::Tool;

/// Read-only view the engine resolves targets through.
pub trait Registry: Send + Sync {
    fn tool(&self, name: &str) -> Option<Arc<dyn Tool>>;

    fn model_function(&self, role: FunctionRole) -> Option<Arc<dyn ModelFunction>>;

    /// Everything a planner may name as a target. Listing does not count as
    /// usage.
    fn catalog(&self) -> Catalog;
}

/// A registered tool as planners see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSummary {
    pub name: String,
    pub category: String,
    pub description: String,
}

/// Registered targets, tools sorted by name and roles in role order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    pub tools: Vec<ToolSummary>,
    pub roles: Vec<FunctionRole>,
}

impl Catalog {
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty() && self.roles.is_empty()
    }

    /// Markdown list for prompts. Empty when nothing is registered.
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        if !self.tools.is_empty() {
            lines.push("Tools (`\"type\": \"tool\"`):".to_string());
            for tool in &self.tools {
                let mut line = format!("- `{}` ({})", tool.name, tool.category);
                if !tool.description.trim().is_empty() {
                    line.push_str(": ");
                    line.push_str(tool.description.trim());
                }
                lines.push(line);
            }
        }
        if !self.roles.is_empty() {
            lines.push("Model functions (`\"type\": \"function\"`):".to_string());
            lines.extend(self.roles.iter().map(|role| format!("- `{role}`")));
        }
        lines.join("\n")
    }
}

struct Entry<T: ?Sized> {
    item: Arc<T>,
    uses: AtomicU64,
}

impl<T: ?Sized> Entry<T> {
    fn new(item: Arc<T>) -> Arc<Self> {
        Arc::new(Self {
            item,
            uses: AtomicU64::new(0),
        })
    }

    fn hit(&self) -> Arc<T> {
        self.uses.fetch_add(1, Ordering::Relaxed);
        Arc::clone(&self.item)
    }
}

/// Thread-safe registry backed by hash maps, with per-entry lookup counts.
///
/// Tool lookup is exact first, then ASCII case-insensitive.
#[derive(Default)]
pub struct InMemoryRegistry {
    tools: RwLock<HashMap<String, Arc<Entry<dyn Tool>>>>,
    functions: RwLock<HashMap<FunctionRole, Arc<Entry<dyn ModelFunction>>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a tool under its own name.
    pub fn register_tool(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        debug!(tool = %name, category = tool.category(), "registering tool");
        self.tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Entry::new(tool));
    }

    /// Register (or replace) the function serving its role.
    pub fn register_function(&self, function: Arc<dyn ModelFunction>) {
        let role = function.role();
        debug!(%role, "registering model function");
        self.functions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(role, Entry::new(function));
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn roles(&self) -> Vec<FunctionRole> {
        let mut roles: Vec<FunctionRole> = self
            .functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        roles.sort();
        roles
    }

    /// Successful lookups of a tool so far.
    pub fn tool_usage(&self, name: &str) -> u64 {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map_or(0, |entry| entry.uses.load(Ordering::Relaxed))
    }

    /// Successful lookups of a role so far.
    pub fn function_usage(&self, role: FunctionRole) -> u64 {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&role)
            .map_or(0, |entry| entry.uses.load(Ordering::Relaxed))
    }
}

impl Registry for InMemoryRegistry {
    fn tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let tools = self.tools.read().unwrap_or_else(PoisonError::into_inner);
        let entry = tools.get(name).or_else(|| {
            tools
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, entry)| entry)
        })?;
        Some(entry.hit())
    }

    fn model_function(&self, role: FunctionRole) -> Option<Arc<dyn ModelFunction>> {
        self.functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&role)
            .map(|entry| entry.hit())
    }

    fn catalog(&self) -> Catalog {
        let mut tools: Vec<ToolSummary> = self
            .tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|entry| ToolSummary {
                name: entry.item.name().to_string(),
                category: entry.item.category().to_string(),
                description: entry.item.contract().description,
            })
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        Catalog {
            tools,
            roles: self.roles(),
        }
    }
}
