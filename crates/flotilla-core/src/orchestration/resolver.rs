use std::collections::{HashMap, VecDeque};
use std::time::SystemTime;

use crate::models::{CoreError, Task, TaskId, TaskStatus};
use crate::orchestration::OrchestrationResult;

/// Dependency graph over a plan's tasks, stored as adjacency lists of task
/// indices. Index `i` always refers to `plan.tasks[i]`.
#[derive(Clone, Debug)]
pub struct DependencyGraph {
    ids: Vec<TaskId>,
    index: HashMap<TaskId, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Grey,
    Black,
}

impl DependencyGraph {
    /// Indexes the tasks and resolves every `depends_on` reference.
    pub fn build(tasks: &[Task]) -> OrchestrationResult<Self> {
        let mut ids = Vec::with_capacity(tasks.len());
        let mut index = HashMap::with_capacity(tasks.len());
        for (position, task) in tasks.iter().enumerate() {
            if task.id.as_str().trim().is_empty() {
                return Err(CoreError::validation(format!(
                    "task at position {position} has an empty id"
                )));
            }
            if index.insert(task.id.clone(), position).is_some() {
                return Err(CoreError::validation(format!(
                    "duplicate task id '{}'",
                    task.id
                ))
                .for_task(&task.id));
            }
            ids.push(task.id.clone());
        }

        let mut dependencies = vec![Vec::new(); tasks.len()];
        let mut dependents = vec![Vec::new(); tasks.len()];
        for (position, task) in tasks.iter().enumerate() {
            for dependency in &task.depends_on {
                let Some(&target) = index.get(dependency) else {
                    return Err(CoreError::validation(format!(
                        "task '{}' depends on unknown task '{dependency}'",
                        task.id
                    ))
                    .for_task(&task.id));
                };
                if !dependencies[position].contains(&target) {
                    dependencies[position].push(target);
                    dependents[target].push(position);
                }
            }
        }

        Ok(Self {
            ids,
            index,
            dependencies,
            dependents,
        })
    }

    /// Depth-first search with white/grey/black marking. A grey node reached
    /// again closes a cycle, which is reported as a path.
    pub fn validate_acyclic(&self) -> OrchestrationResult<()> {
        let mut marks = vec![Mark::White; self.ids.len()];

        for root in 0..self.ids.len() {
            if marks[root] != Mark::White {
                continue;
            }

            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            marks[root] = Mark::Grey;

            while let Some(&(node, next_edge)) = stack.last() {
                if let Some(&dependency) = self.dependencies[node].get(next_edge) {
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    match marks[dependency] {
                        Mark::White => {
                            marks[dependency] = Mark::Grey;
                            stack.push((dependency, 0));
                        }
                        Mark::Grey => {
                            let start = stack
                                .iter()
                                .position(|(entry, _)| *entry == dependency)
                                .unwrap_or(0);
                            let mut path: Vec<&str> = stack[start..]
                                .iter()
                                .map(|(entry, _)| self.ids[*entry].as_str())
                                .collect();
                            path.push(self.ids[dependency].as_str());
                            return Err(CoreError::validation(format!(
                                "dependency cycle detected: {}",
                                path.join(" -> ")
                            ))
                            .for_task(&self.ids[dependency]));
                        }
                        Mark::Black => {}
                    }
                } else {
                    marks[node] = Mark::Black;
                    stack.pop();
                }
            }
        }

        Ok(())
    }

    pub fn index_of(&self, task_id: &TaskId) -> Option<usize> {
        self.index.get(task_id).copied()
    }

    /// Pending tasks whose dependencies have all succeeded and whose retry
    /// backoff (if any) has elapsed, in insertion order.
    pub fn ready_set(&self, tasks: &[Task], now: SystemTime) -> Vec<usize> {
        (0..self.ids.len())
            .filter(|&index| {
                let task = &tasks[index];
                task.status == TaskStatus::Pending
                    && !task.is_backing_off(now)
                    && self.dependencies[index]
                        .iter()
                        .all(|&dependency| tasks[dependency].status == TaskStatus::Succeeded)
            })
            .collect()
    }

    /// Every task that directly or indirectly depends on `index`, sorted by
    /// insertion order.
    pub fn transitive_dependents(&self, index: usize) -> Vec<usize> {
        self.walk(index, &self.dependents)
    }

    /// Every task `index` directly or indirectly depends on, sorted by
    /// insertion order.
    pub fn transitive_dependencies(&self, index: usize) -> Vec<usize> {
        self.walk(index, &self.dependencies)
    }

    /// True when some transitive dependency ended failed or cancelled, i.e.
    /// the task cannot become ready without operator action.
    pub fn has_unresolved_ancestor(&self, tasks: &[Task], index: usize) -> bool {
        self.transitive_dependencies(index).into_iter().any(|ancestor| {
            matches!(
                tasks[ancestor].status,
                TaskStatus::Failed | TaskStatus::Cancelled
            )
        })
    }

    fn walk(&self, start: usize, edges: &[Vec<usize>]) -> Vec<usize> {
        let mut seen = vec![false; self.ids.len()];
        let mut queue = VecDeque::from([start]);
        let mut reached = Vec::new();
        while let Some(node) = queue.pop_front() {
            for &next in &edges[node] {
                if !seen[next] {
                    seen[next] = true;
                    reached.push(next);
                    queue.push_back(next);
                }
            }
        }
        reached.sort_unstable();
        reached
    }
}
