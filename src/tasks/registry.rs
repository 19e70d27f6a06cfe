//! Task registry, keyed by action name.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::RegistryError;
use crate::tasks::Task;

/// Registry of tasks this worker can run.
///
/// Filled before the worker starts and shared read-only afterwards.
pub struct TaskRegistry {
    tasks: HashMap<String, Arc<dyn Task>>,
}

impl TaskRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    /// Register a task. Names must be unique.
    pub fn register(&mut self, task: Arc<dyn Task>) -> Result<(), RegistryError> {
        let name = task.name().to_string();
        if self.tasks.contains_key(&name) {
            tracing::warn!(task = %name, "Rejected duplicate task registration");
            return Err(RegistryError::Duplicate { name });
        }
        tracing::debug!(
            task = %name,
            durable = task.is_durable(),
            blocking = task.is_blocking(),
            "Registered task"
        );
        self.tasks.insert(name, task);
        Ok(())
    }

    /// Get a task by action name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Task>, RegistryError> {
        self.tasks
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_string(),
            })
    }

    pub fn has(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Registered action names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    /// Retry budget per action name.
    pub fn retries(&self) -> HashMap<String, u32> {
        self.tasks
            .iter()
            .map(|(name, task)| (name.clone(), task.retries()))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.tasks.len()
    }

    /// Whether any registered task is durable.
    pub fn has_durable(&self) -> bool {
        self.tasks.values().any(|task| task.is_durable())
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
