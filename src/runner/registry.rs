//! Task lookup by namespaced name.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::erased::ErasedTask;
use super::runner::RunnerError;

/// Registered tasks, keyed by `"{tasks_module}::{name}"`.
pub struct TaskRegistry {
    prefix: String,
    tasks: BTreeMap<String, Arc<dyn ErasedTask>>,
}

impl TaskRegistry {
    pub fn new(tasks_module: &str) -> Self {
        Self {
            prefix: format!("{tasks_module}::"),
            tasks: BTreeMap::new(),
        }
    }

    /// Register a task. Names must be unique within the module.
    pub fn register(&mut self, task: Arc<dyn ErasedTask>) -> Result<(), RunnerError> {
        let name = self.qualify(task.name());
        if self.tasks.contains_key(&name) {
            return Err(RunnerError::DuplicateTask(name));
        }
        self.tasks.insert(name, task);
        Ok(())
    }

    /// Accepts a short or an already qualified name.
    pub fn qualify(&self, name: &str) -> String {
        if name.starts_with(&self.prefix) {
            name.to_string()
        } else {
            format!("{}{name}", self.prefix)
        }
    }

    /// Look up a task, returning it with its qualified name.
    pub fn resolve(&self, name: &str) -> Result<(String, Arc<dyn ErasedTask>), RunnerError> {
        let qualified = self.qualify(name);
        match self.tasks.get(&qualified) {
            Some(task) => Ok((qualified, task.clone())),
            None => Err(RunnerError::UnknownTask(name.to_string())),
        }
    }

    /// Qualified names of every registered task, sorted.
    pub fn names(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualify() {
        let registry = TaskRegistry::new("Maintenance");
        assert_eq!(registry.qualify("Backfill"), "Maintenance::Backfill");
        assert_eq!(registry.qualify("Maintenance::Backfill"), "Maintenance::Backfill");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unknown_name_is_reported_as_given() {
        let registry = TaskRegistry::new("Ops");
        let err = registry.resolve("Backfill").err().unwrap();
        assert!(matches!(err, RunnerError::UnknownTask(name) if name == "Backfill"));
    }
}
