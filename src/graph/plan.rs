use std::collections::{HashMap, HashSet, VecDeque};

use super::{GraphError, Task};

/// A validated task graph.
#[derive(Debug, Clone)]
pub(crate) struct TaskGraph {
    /// Tasks in insertion order.
    tasks: Vec<Task>,

    /// task_id -> position in `tasks`
    index: HashMap<String, usize>,

    /// Reverse edges: task_id -> tasks that depend on it, in insertion order
    dependents: HashMap<String, Vec<String>>,
}

impl TaskGraph {
    /// Validates `tasks` and builds the graph.
    ///
    /// Rejects duplicate ids, dependencies on ids outside the list, and
    /// dependency cycles (including a task depending on itself).
    pub fn build(tasks: Vec<Task>) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateTask(task.id.clone()));
            }
        }

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for task in &tasks {
            for dep in &task.depends_on {
                if !index.contains_key(dep) {
                    return Err(GraphError::unknown_dependency(&task.id, dep));
                }
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(task.id.clone());
            }
        }

        let graph = Self {
            tasks,
            index,
            dependents,
        };

        if let Some(cycle) = graph.detect_cycle() {
            return Err(GraphError::CyclicDependency(cycle));
        }

        Ok(graph)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    /// Tasks that directly depend on `id`.
    pub fn dependents(&self, id: &str) -> &[String] {
        self.dependents
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every task that transitively depends on `id`, nearest first.
    pub fn downstream(&self, id: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<&str> = self.dependents(id).iter().map(String::as_str).collect();

        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                order.push(next.to_string());
                queue.extend(self.dependents(next).iter().map(String::as_str));
            }
        }

        order
    }

    /// Detect circular dependencies using DFS
    ///
    /// Returns the loop as a path of ids, first id repeated at the end.
    fn detect_cycle(&self) -> Option<Vec<String>> {
        let mut done = HashSet::new();
        let mut stack = Vec::new();

        for task in &self.tasks {
            if !done.contains(task.id.as_str()) {
                if let Some(cycle) = self.dfs_cycle(&task.id, &mut done, &mut stack) {
                    return Some(cycle);
                }
            }
        }

        None
    }

    fn dfs_cycle<'a>(
        &'a self,
        node: &'a str,
        done: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        stack.push(node);

        if let Some(task) = self.get(node) {
            for dep in &task.depends_on {
                // Dependency already on the current path closes a loop
                if let Some(pos) = stack.iter().position(|id| *id == dep.as_str()) {
                    let mut cycle: Vec<String> =
                        stack[pos..].iter().map(ToString::to_string).collect();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }

                if !done.contains(dep.as_str()) {
                    if let Some(cycle) = self.dfs_cycle(dep, done, stack) {
                        return Some(cycle);
                    }
                }
            }
        }

        stack.pop();
        done.insert(node);
        None
    }
}
