mod diagnostics;

use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use rayon::ThreadPool;
use tracing::Level;

use crate::context::Event;
use crate::core::{ArcStr, Leaves, Value};
use crate::task::{Registry, TaskPtr};
use crate::{Context, FlowError};

pub use diagnostics::{Diagnostics, TaskExecution};

/// What a finished task contributes to the scheduler.
enum Outcome {
    Leaf(Value),
    Next(Vec<(ArcStr, TaskPtr)>),
}

/// Sent from a worker back to the scheduler when a task finishes.
struct Completion {
    /// Position of the task in its wavefront.
    slot: usize,
    id: ArcStr,
    start: Instant,
    duration: Duration,
    result: Result<Outcome, FlowError>,
}

/// Runs the task graph reachable from `start` until no task names a
/// successor, returning the values of the leaf tasks.
///
/// The graph is walked in rounds. Every round takes the current wavefront,
/// the set of task ids scheduled by the previous round, and runs it as
/// follows:
/// 1. Every task of the wavefront is spawned into a single Rayon scope on the
///    worker pool, so they all run concurrently. The scope is opened in place:
///    the calling thread only waits for the round and never picks up jobs of
///    other runs sharing the pool.
/// 2. When a task finishes, its worker records the value in the context under
///    the task id, emits a completion item on the stream queue, resolves every
///    id the task named against the registry, and sends the completion back
///    through a channel.
/// 3. The scope returns only once every task of the round has finished. This
///    is the barrier which makes writes of round `k` visible to round `k+1`.
/// 4. The completions are drained in the order they arrived. The first
///    failure aborts the run and the other results are discarded.
/// 5. Otherwise the completions are folded in dispatch order: leaf values go
///    to the result, next ids are appended to the following wavefront unless
///    already present in it.
///
/// There is no memory of visited tasks, so a task may run again in a later
/// round. Cyclic graphs terminate only when their tasks stop scheduling each
/// other.
pub(crate) fn run_wavefronts(
    registry: &Registry,
    pool: &ThreadPool,
    context: &Context,
    start: &str,
) -> Result<(Leaves, Diagnostics), FlowError> {
    let (start, task) = registry.resolve(start)?;

    let mut diagnostics = Diagnostics::new(Instant::now());
    let mut leaves = Leaves::default();
    let mut wavefront = vec![(start.clone(), task.clone())];

    while !wavefront.is_empty() {
        let round = diagnostics.begin_wavefront();
        // Only a parent for the task spans, never entered on this thread.
        let span = tracing::span!(Level::DEBUG, "wavefront", round, size = wavefront.len());

        let (sender, receiver) = unbounded::<Completion>();

        pool.in_place_scope(|s| {
            for (slot, (id, task)) in wavefront.iter().enumerate() {
                let sender = sender.clone();
                let parent = span.clone();

                s.spawn(move |_| {
                    let start = Instant::now();
                    let result = execute(registry, context, id, task, &parent);
                    let completion = Completion {
                        slot,
                        id: id.clone(),
                        start,
                        duration: start.elapsed(),
                        result,
                    };

                    // The receiver lives until after the scope has joined.
                    let _ = sender.send(completion);
                });
            }
        });

        drop(sender);

        let mut first_error = None;
        let mut done = Vec::with_capacity(wavefront.len());

        for completion in receiver.try_iter() {
            let succeeded = completion.result.is_ok();
            diagnostics.record(
                &completion.id,
                round,
                completion.slot,
                completion.start,
                completion.duration,
                succeeded,
            );

            match completion.result {
                Ok(outcome) => done.push((completion.slot, completion.id, outcome)),
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    } else {
                        tracing::debug!(parent: &span, "discarding further failure: {err}");
                    }
                }
            }
        }

        if let Some(err) = first_error {
            tracing::error!(parent: &span, "aborting run in wavefront {round}: {err}");
            return Err(err);
        }

        done.sort_unstable_by_key(|(slot, _, _)| *slot);

        let mut next = Vec::new();
        let mut scheduled = HashSet::new();

        for (_, id, outcome) in done {
            match outcome {
                Outcome::Leaf(value) => {
                    diagnostics.leaf(&id);
                    leaves.insert(&*id, value);
                }
                Outcome::Next(successors) => {
                    for (successor, task) in successors {
                        diagnostics.edge(&id, &successor);
                        if scheduled.insert(successor.clone()) {
                            next.push((successor, task));
                        }
                    }
                }
            }
        }

        tracing::debug!(
            parent: &span,
            "wavefront {round} finished, {} task(s) scheduled next",
            next.len()
        );

        wavefront = next;
    }

    Ok((leaves, diagnostics))
}

/// Executes one task on the current worker thread.
fn execute(
    registry: &Registry,
    context: &Context,
    id: &ArcStr,
    task: &TaskPtr,
    parent: &tracing::Span,
) -> Result<Outcome, FlowError> {
    let span = tracing::span!(parent: parent, Level::INFO, "task", id = &**id);
    let _enter = span.enter();

    // A panicking task only poisons its own result, the context is never
    // left locked by task code.
    let output = match catch_unwind(AssertUnwindSafe(|| task.execute(context))) {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("Task panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("Task panicked: {s}")
            } else {
                String::from("Task panicked with unknown payload")
            };

            Err(anyhow::anyhow!(msg))
        }
    }
    .map_err(|err| FlowError::TaskFailed(id.to_string(), err))?;

    context.set_value(&**id, output.value.clone());
    context.emit(Event::Item(id.to_string(), output.value.clone()));

    if output.next.is_empty() {
        tracing::debug!("task {id} is a leaf");
        return Ok(Outcome::Leaf(output.value));
    }

    let next = output
        .next
        .iter()
        .map(|successor| {
            registry
                .resolve(successor)
                .map(|(id, task)| (id.clone(), task.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Outcome::Next(next))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::TaskOutput;

    fn pool(threads: usize) -> ThreadPool {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .unwrap()
    }

    fn register<F>(registry: &mut Registry, id: &str, f: F)
    where
        F: Fn(&Context) -> crate::TaskResult + Send + Sync + 'static,
    {
        registry.register(id, Arc::new(f));
    }

    #[test]
    fn test_unknown_start() {
        let registry = Registry::default();
        let err = run_wavefronts(&registry, &pool(1), &Context::new(), "missing")
            .err()
            .unwrap();
        assert!(matches!(err, FlowError::UnknownTask(id) if id == "missing"));
    }

    #[test]
    fn test_fan_in_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::default();

        register(&mut registry, "root", |_| {
            Ok(TaskOutput::then((), ["left", "right", "left"]))
        });
        register(&mut registry, "left", |_| Ok(TaskOutput::then((), ["join"])));
        register(&mut registry, "right", |_| Ok(TaskOutput::then((), ["join"])));

        let counter = runs.clone();
        register(&mut registry, "join", move |ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            assert!(ctx.contains("left") && ctx.contains("right"));
            Ok(TaskOutput::new("joined"))
        });

        let ctx = Context::new();
        let (leaves, diagnostics) = run_wavefronts(&registry, &pool(2), &ctx, "root").unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(leaves.ids(), ["join"]);
        assert_eq!(diagnostics.wavefronts(), 3);
        assert_eq!(diagnostics.executions_of("left"), 1);
        assert_eq!(diagnostics.executions_of("join"), 1);
    }

    #[test]
    fn test_first_error_aborts_after_round() {
        let later = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::default();

        register(&mut registry, "root", |_| {
            Ok(TaskOutput::then((), ["bad", "slow"]))
        });
        register(&mut registry, "bad", |_| anyhow::bail!("boom"));
        register(&mut registry, "slow", |ctx| {
            std::thread::sleep(Duration::from_millis(50));
            ctx.set("slow-finished", true);
            Ok(TaskOutput::then((), ["after"]))
        });

        let counter = later.clone();
        register(&mut registry, "after", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(TaskOutput::new(()))
        });

        let ctx = Context::new();
        let err = run_wavefronts(&registry, &pool(2), &ctx, "root")
            .err()
            .unwrap();

        assert_eq!(err.task_id(), Some("bad"));
        assert!(err.to_string().contains("boom"));
        // The sibling finished, but nothing downstream was dispatched.
        assert!(*ctx.get::<bool>("slow-finished").unwrap());
        assert_eq!(later.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_next_wavefront_follows_dispatch_order() {
        let mut registry = Registry::default();

        register(&mut registry, "root", |_| {
            Ok(TaskOutput::then((), ["slow", "fast"]))
        });
        register(&mut registry, "slow", |_| {
            std::thread::sleep(Duration::from_millis(100));
            Ok(TaskOutput::then((), ["x", "shared"]))
        });
        register(&mut registry, "fast", |_| Ok(TaskOutput::then((), ["y", "shared"])));
        for id in ["x", "y", "shared"] {
            register(&mut registry, id, |_| Ok(TaskOutput::new(())));
        }

        let (_, diagnostics) =
            run_wavefronts(&registry, &pool(2), &Context::new(), "root").unwrap();

        // `fast` completes first, yet the successors of `slow` come first.
        let completed: Vec<_> = diagnostics
            .executions()
            .iter()
            .filter(|e| e.wavefront == 1)
            .map(|e| e.task.as_str())
            .collect();
        assert_eq!(completed, ["fast", "slow"]);

        let mut dispatched: Vec<_> = diagnostics
            .executions()
            .iter()
            .filter(|e| e.wavefront == 2)
            .map(|e| (e.slot, e.task.as_str()))
            .collect();
        dispatched.sort_unstable();
        assert_eq!(dispatched, [(0, "x"), (1, "shared"), (2, "y")]);
    }

    #[test]
    fn test_panic_is_reported() {
        let mut registry = Registry::default();
        register(&mut registry, "root", |_| panic!("kaboom"));

        let err = run_wavefronts(&registry, &pool(1), &Context::new(), "root")
            .err()
            .unwrap();

        assert!(matches!(err, FlowError::TaskFailed(..)));
        assert!(err.to_string().contains("Task panicked: kaboom"));
    }

    #[test]
    fn test_value_recorded_before_unknown_successor_fails() {
        let mut registry = Registry::default();
        register(&mut registry, "root", |_| {
            Ok(TaskOutput::then(5_i32, ["ghost"]))
        });

        let ctx = Context::new();
        let err = run_wavefronts(&registry, &pool(1), &ctx, "root")
            .err()
            .unwrap();

        assert_eq!(err.to_string(), "Task ghost not found");
        assert_eq!(*ctx.get::<i32>("root").unwrap(), 5);
    }

    #[test]
    fn test_repeated_leaf_keeps_last_value() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::default();

        register(&mut registry, "root", |ctx| {
            let round = ctx.get::<u32>("round").map(|r| *r).unwrap_or(0);
            ctx.set("round", round + 1);
            if round < 2 {
                Ok(TaskOutput::then((), ["leaf", "root"]))
            } else {
                Ok(TaskOutput::then((), ["leaf"]))
            }
        });

        let counter = calls.clone();
        register(&mut registry, "leaf", move |_| {
            Ok(TaskOutput::new(counter.fetch_add(1, Ordering::SeqCst) + 1))
        });

        let (leaves, diagnostics) =
            run_wavefronts(&registry, &pool(2), &Context::new(), "root").unwrap();

        assert_eq!(leaves.get::<usize>("leaf"), Some(&3));
        assert_eq!(diagnostics.executions_of("leaf"), 3);
        assert_eq!(diagnostics.wavefronts(), 4);
        assert!(diagnostics.is_cyclic());
    }
}
