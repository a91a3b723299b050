use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crawl_storage::FieldResolver;

use crate::task::Task;

/// Name-indexed task registry.
///
/// Native tasks are registered during startup; scripted tasks may be
/// appended afterwards. The engine and the storage sink both resolve
/// through it, which keeps rule definitions canonical: the master ships
/// only task names.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<Task>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, task: Task) {
        let mut tasks = self.tasks.write().expect("task registry poisoned");
        tasks.insert(task.name.clone(), Arc::new(task));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Task>> {
        let tasks = self.tasks.read().expect("task registry poisoned");
        tasks.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        let tasks = self.tasks.read().expect("task registry poisoned");
        tasks.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let tasks = self.tasks.read().expect("task registry poisoned");
        tasks.keys().cloned().collect()
    }
}

impl FieldResolver for TaskRegistry {
    fn fields(&self, task: &str, rule: &str) -> Option<Vec<String>> {
        let task = self.get(task)?;
        let rule = task.rule.rule(rule)?;
        Some(rule.item_fields.clone())
    }
}
