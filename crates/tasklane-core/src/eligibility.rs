//! Which tasks may start now.
//!
//! Groups are independent. Within a group, `pending` tasks are always
//! runnable, while a `blocked` task waits until every task before it in the
//! same group is `done`.

use crate::tasks::{Document, Task, TaskLocator, TaskStatus};

/// A task that may be started, with the group it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EligibleTask<'a> {
    pub group: &'a str,
    pub task: &'a Task,
}

impl EligibleTask<'_> {
    pub fn locator(&self) -> TaskLocator {
        TaskLocator::of(self.group, self.task)
    }
}

/// Runnable tasks in group order, then ordinal order. Does not mutate the
/// document.
pub fn eligible(document: &Document) -> Vec<EligibleTask<'_>> {
    let mut out = Vec::new();
    for group in &document.groups {
        let mut predecessors_done = true;
        for task in &group.tasks {
            let runnable = match task.status {
                TaskStatus::Pending => true,
                TaskStatus::Blocked => predecessors_done,
                TaskStatus::InProgress | TaskStatus::Done | TaskStatus::Failed => false,
            };
            if runnable {
                out.push(EligibleTask {
                    group: &group.name,
                    task,
                });
            }
            predecessors_done &= task.status == TaskStatus::Done;
        }
    }
    out
}
