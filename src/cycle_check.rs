use std::collections::{BTreeMap, HashSet};
use crate::Task;

/// Returns one dependency cycle as a closed path (`a -> b -> a`), or `None`.
///
/// Dependencies that name unregistered tasks are ignored here.
pub fn find_cycle(tasks: &BTreeMap<String, Task>) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut rec_stack = Vec::new();

    fn dfs<'a>(
        task_name: &'a str,
        tasks: &'a BTreeMap<String, Task>,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = rec_stack.iter().position(|n| *n == task_name) {
            let mut cycle: Vec<String> = rec_stack[pos..].iter().map(|n| n.to_string()).collect();
            cycle.push(task_name.to_string());
            return Some(cycle);
        }
        if !visited.insert(task_name) {
            return None;
        }

        rec_stack.push(task_name);

        if let Some(task) = tasks.get(task_name) {
            for dep in task.dependencies() {
                if let Some(cycle) = dfs(dep, tasks, visited, rec_stack) {
                    return Some(cycle);
                }
            }
        }

        rec_stack.pop();
        None
    }

    for task_name in tasks.keys() {
        if !visited.contains(task_name.as_str()) {
            if let Some(cycle) = dfs(task_name, tasks, &mut visited, &mut rec_stack) {
                return Some(cycle);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn tasks(edges: &[(&str, &[&str])]) -> BTreeMap<String, Task> {
        edges
            .iter()
            .map(|(name, deps)| {
                (name.to_string(), Task::new(*name, || async { Ok(()) }, deps))
            })
            .collect()
    }

    #[test]
    fn acyclic_graph_has_no_cycle() {
        let tasks = tasks(&[("a", &[]), ("b", &["a"]), ("c", &["a", "b"])]);
        assert_eq!(find_cycle(&tasks), None);
    }

    #[test]
    fn reports_closed_path() {
        let tasks = tasks(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"]), ("d", &[])]);
        assert_eq!(
            find_cycle(&tasks),
            Some(vec!["a".to_string(), "c".to_string(), "b".to_string(), "a".to_string()])
        );
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let tasks = tasks(&[("a", &["a"])]);
        assert_eq!(find_cycle(&tasks), Some(vec!["a".to_string(), "a".to_string()]));
    }

    #[test]
    fn unknown_dependencies_are_skipped() {
        let tasks = tasks(&[("a", &["ghost"])]);
        assert_eq!(find_cycle(&tasks), None);
    }
}
