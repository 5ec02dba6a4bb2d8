//! Task graph validation errors.

/// A task list that cannot be scheduled. Raised before any task runs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// Two tasks share an id.
    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    /// A task depends on an id that is not in the graph.
    #[error("Task '{task_id}' depends on unknown task '{dependency}'")]
    UnknownDependency { task_id: String, dependency: String },

    /// The dependency relation loops back on itself. Holds the loop as ids.
    #[error("Cyclic dependency: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),
}

impl GraphError {
    /// Creates an `UnknownDependency` error.
    pub fn unknown_dependency(task_id: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self::UnknownDependency {
            task_id: task_id.into(),
            dependency: dependency.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_dependency_error() {
        let err = GraphError::unknown_dependency("dev", "install");
        assert_eq!(
            err.to_string(),
            "Task 'dev' depends on unknown task 'install'"
        );
    }

    #[test]
    fn test_cyclic_dependency_error() {
        let err = GraphError::CyclicDependency(vec![
            "x".to_string(),
            "y".to_string(),
            "x".to_string(),
        ]);
        assert!(matches!(err, GraphError::CyclicDependency(ref path) if path.len() == 3));
        assert_eq!(err.to_string(), "Cyclic dependency: x -> y -> x");
    }

    #[test]
    fn test_duplicate_task_error() {
        let err = GraphError::DuplicateTask("build".to_string());
        assert_eq!(err.to_string(), "Duplicate task id: build");
    }
}
