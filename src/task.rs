//! Task actions and the registry that maps ids to them.
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{ArcStr, TaskResult};
use crate::{Context, FlowError};

/// A unit of work that can be registered in a [`Flow`](crate::Flow).
///
/// Given the context of the current run, a task produces a [`TaskOutput`](crate::TaskOutput)
/// carrying its value and the ids of the tasks to run next. Any closure of the
/// shape `Fn(&Context) -> anyhow::Result<TaskOutput>` is a task, so most
/// callers never implement this trait by hand.
///
/// Tasks of the same wavefront run concurrently on the worker pool, so a task
/// must be `Send + Sync`.
pub trait Task: Send + Sync {
    fn execute(&self, context: &Context) -> TaskResult;
}

impl<F> Task for F
where
    F: Fn(&Context) -> TaskResult + Send + Sync,
{
    fn execute(&self, context: &Context) -> TaskResult {
        self(context)
    }
}

pub(crate) type TaskPtr = Arc<dyn Task>;

/// Read-only during a run; shared between concurrent runs.
#[derive(Clone, Default)]
pub(crate) struct Registry {
    tasks: HashMap<ArcStr, TaskPtr>,
}

impl Registry {
    /// Returns `true` if an earlier registration was replaced.
    pub(crate) fn register(&mut self, id: &str, task: TaskPtr) -> bool {
        self.tasks.insert(ArcStr::from(id), task).is_some()
    }

    /// Resolves an id to the registry's own copy of it and its action.
    pub(crate) fn resolve(&self, id: &str) -> Result<(&ArcStr, &TaskPtr), FlowError> {
        self.tasks
            .get_key_value(id)
            .ok_or_else(|| FlowError::UnknownTask(id.to_string()))
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    pub(crate) fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<_> = self.tasks.keys().map(AsRef::as_ref).collect();
        ids.sort_unstable();
        ids
    }
}
