//! Purpose-built DAG of named tasks.
//!
//! Tasks may be added in any order; dependency names are only resolved when
//! an execution order is computed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;
use crate::{DagtickError, Task, find_cycle};

#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    tasks: BTreeMap<String, Task>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&mut self, task: Task) -> Result<(), DagtickError> {
        if self.tasks.contains_key(task.name()) {
            return Err(DagtickError::DuplicateTask(task.name().to_string()));
        }
        self.tasks.insert(task.name().to_string(), task);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Registered task names in ascending order.
    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    /// Names of the tasks that declare `name` as a dependency, ascending.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.tasks
            .values()
            .filter(|task| task.dependencies().iter().any(|dep| dep == name))
            .map(Task::name)
            .collect()
    }

    pub fn validate(&self) -> Result<(), DagtickError> {
        self.order().map(|_| ())
    }

    /// Topological order of task names.
    ///
    /// Among tasks whose dependencies are all satisfied, the lexicographically
    /// smallest name runs first, so the result is the same on every call.
    pub fn order(&self) -> Result<Vec<String>, DagtickError> {
        for (name, task) in &self.tasks {
            if let Some(missing) = task.dependencies().iter().find(|dep| !self.tasks.contains_key(*dep)) {
                return Err(DagtickError::UnknownDependency {
                    task: name.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let mut in_degrees: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for (name, task) in &self.tasks {
            in_degrees.insert(name.as_str(), task.dependencies().len());
            for dep in task.dependencies() {
                dependents.entry(dep.as_str()).or_default().push(name.as_str());
            }
        }

        let mut ready: BTreeSet<&str> = in_degrees
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());

        while let Some(name) = ready.pop_first() {
            order.push(name.to_string());

            if let Some(children) = dependents.get(name) {
                for child in children {
                    if let Some(degree) = in_degrees.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.insert(*child);
                        }
                    }
                }
            }
        }

        if order.len() < self.tasks.len() {
            let cycle = find_cycle(&self.tasks).unwrap_or_else(|| {
                self.tasks
                    .keys()
                    .filter(|name| !order.contains(name))
                    .cloned()
                    .collect()
            });
            return Err(DagtickError::CyclicDependency { cycle });
        }

        debug!(order = ?order, "resolved execution order");
        Ok(order)
    }

    /// Tasks in execution order.
    pub fn ordered_tasks(&self) -> Result<Vec<&Task>, DagtickError> {
        let order = self.order()?;
        Ok(order.iter().filter_map(|name| self.tasks.get(name)).collect())
    }

    /// Indented view of the graph starting from every task without dependencies.
    pub fn render_tree(&self) -> Result<String, DagtickError> {
        self.validate()?;

        let mut out = String::new();
        for root in self.tasks.values().filter(|t| t.dependencies().is_empty()) {
            out.push_str(root.name());
            out.push('\n');
            self.render_chain(root.name(), "  ", &mut out);
        }
        Ok(out)
    }

    fn render_chain(&self, name: &str, prefix: &str, out: &mut String) {
        for child in self.dependents(name) {
            out.push_str(&format!("{prefix}└─> {child}\n"));
            self.render_chain(child, &format!("{prefix}    "), out);
        }
    }
}

/// Numbered listing of an execution order, one task per line.
pub fn format_order(order: &[String]) -> String {
    let mut result = String::new();
    for (i, step) in order.iter().enumerate() {
        result.push_str(&format!("{}. {}\n", i + 1, step));
    }
    result
}
