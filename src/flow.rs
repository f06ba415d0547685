use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, unbounded};
use rayon::ThreadPool;

use crate::context::Event;
use crate::core::{Inputs, Leaves, TaskResult, Value};
use crate::executor::{Diagnostics, run_wavefronts};
use crate::task::{Registry, Task};
use crate::{Context, FlowError};

/// The task scheduler.
///
/// A `Flow` owns a registry of named tasks and a handle to the worker pool
/// they run on. A run starts from a single task and follows the ids each task
/// names in its [`TaskOutput`](crate::TaskOutput), wavefront by wavefront,
/// until no task names a successor.
///
/// Runs never mutate the flow, so one `Flow` can serve several runs at once,
/// from different threads. Each run gets its own [`Context`].
///
/// # Example
///
/// ```rust
/// use nagare::{Flow, Inputs, TaskOutput};
///
/// let mut flow = Flow::with_threads(2).unwrap();
///
/// flow.add_task("greet", |ctx| {
///     let name = ctx.get::<&str>("name")?;
///     Ok(TaskOutput::then(format!("hello {name}"), ["shout"]))
/// });
///
/// flow.add_task("shout", |ctx| {
///     let greeting = ctx.get::<String>("greet")?;
///     Ok(TaskOutput::new(greeting.to_uppercase()))
/// });
///
/// let leaves = flow.run("greet", Inputs::new().with("name", "nagare")).unwrap();
/// assert_eq!(leaves.get::<String>("shout").unwrap(), "HELLO NAGARE");
/// ```
#[derive(Clone)]
pub struct Flow {
    registry: Arc<Registry>,
    pool: Arc<ThreadPool>,
}

/// Everything a finished run leaves behind.
#[derive(Debug)]
pub struct Report {
    /// Values of the leaf tasks, keyed by task id.
    pub leaves: Leaves,
    /// The final state of the run's context.
    pub context: Context,
    pub diagnostics: Diagnostics,
}

impl Flow {
    /// Creates a flow running its tasks on `pool`.
    pub fn new(pool: Arc<ThreadPool>) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            pool,
        }
    }

    /// Creates a flow with a dedicated pool of `threads` workers.
    pub fn with_threads(threads: usize) -> Result<Self, FlowError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("nagare-worker-{i}"))
            .build()?;

        Ok(Self::new(Arc::new(pool)))
    }

    /// Registers a closure as the task `id`.
    ///
    /// Registering an id twice replaces the earlier task.
    pub fn add_task<F>(&mut self, id: impl AsRef<str>, callback: F) -> &mut Self
    where
        F: Fn(&Context) -> TaskResult + Send + Sync + 'static,
    {
        self.register(id, callback)
    }

    /// Registers any [`Task`] implementation as the task `id`.
    ///
    /// Runs already in flight keep the registry they started with.
    pub fn register<T>(&mut self, id: impl AsRef<str>, task: T) -> &mut Self
    where
        T: Task + 'static,
    {
        let id = id.as_ref();

        if Arc::make_mut(&mut self.registry).register(id, Arc::new(task)) {
            tracing::debug!("task {id} registered again, replacing the previous one");
        }

        self
    }

    pub fn contains(&self, id: &str) -> bool {
        self.registry.contains(id)
    }

    /// Registered task ids, in sorted order.
    pub fn task_ids(&self) -> Vec<&str> {
        self.registry.ids()
    }

    /// Runs the graph from `start` and blocks until it completes, returning
    /// the values of all leaf tasks.
    pub fn run(&self, start: &str, inputs: Inputs) -> Result<Leaves, FlowError> {
        self.execute(start, inputs).map(|report| report.leaves)
    }

    /// Like [`Flow::run`], but also hands back the final context and the
    /// diagnostics of the run.
    pub fn execute(&self, start: &str, inputs: Inputs) -> Result<Report, FlowError> {
        let context = seed(Context::new(), inputs);

        let s = Instant::now();
        tracing::info!("running flow from {start}");

        let (leaves, diagnostics) = run_wavefronts(&self.registry, &self.pool, &context, start)?;

        tracing::info!(
            "flow from {start} finished in {:?}, {} leaf result(s) over {} wavefront(s)",
            s.elapsed(),
            leaves.len(),
            diagnostics.wavefronts()
        );

        Ok(Report {
            leaves,
            context,
            diagnostics,
        })
    }

    /// Runs the graph from `start` in the background and returns the items
    /// of its stream queue as they are produced.
    ///
    /// The stream yields the completion item `(task_id, value)` of every task
    /// together with whatever tasks pushed through
    /// [`Context::push_stream`], in production order. Items show up as soon
    /// as they are produced, without waiting for the wavefront to finish.
    ///
    /// If the run fails, the error is yielded after every item produced
    /// before the failure, and the stream ends.
    ///
    /// # Example
    ///
    /// ```rust
    /// use nagare::{Flow, Inputs, TaskOutput};
    ///
    /// let mut flow = Flow::with_threads(2).unwrap();
    /// flow.add_task("count", |ctx| {
    ///     for i in 0..3 {
    ///         ctx.push_stream("count", i);
    ///     }
    ///     Ok(TaskOutput::new("done"))
    /// });
    ///
    /// let items: Vec<_> = flow
    ///     .stream("count", Inputs::new())
    ///     .collect::<Result<_, _>>()
    ///     .unwrap();
    ///
    /// assert_eq!(items.len(), 4);
    /// ```
    pub fn stream(&self, start: &str, inputs: Inputs) -> FlowStream {
        let (sender, receiver) = unbounded();
        let context = seed(Context::streaming(sender.clone()), inputs);

        let registry = Arc::clone(&self.registry);
        let pool = Arc::clone(&self.pool);
        let start = start.to_string();
        let fallback = sender.clone();

        // The driver only blocks on wavefronts, so it gets a thread of its
        // own instead of a worker slot.
        let spawned = std::thread::Builder::new()
            .name(format!("nagare-stream-{start}"))
            .spawn(move || {
                tracing::info!("streaming flow from {start}");

                let event = match run_wavefronts(&registry, &pool, &context, &start) {
                    Ok((leaves, diagnostics)) => {
                        tracing::info!(
                            "streamed flow from {start} finished, {} leaf result(s) over {} wavefront(s)",
                            leaves.len(),
                            diagnostics.wavefronts()
                        );
                        Event::Finished
                    }
                    Err(err) => Event::Failed(err),
                };

                drop(context);

                if sender.send(event).is_err() {
                    tracing::debug!("stream of {start} was dropped before the run ended");
                }
            });

        if let Err(err) = spawned {
            tracing::error!("could not start stream driver: {err}");
            let _ = fallback.send(Event::Failed(FlowError::Spawn(err)));
        }

        FlowStream {
            receiver,
            done: false,
        }
    }
}

fn seed(context: Context, inputs: Inputs) -> Context {
    for (key, value) in inputs {
        context.set_value(key, value);
    }

    context
}

/// The items of a streamed run, in the order they were produced.
///
/// Returned by [`Flow::stream`]. The iterator blocks while the run is still
/// going and nothing new has been produced. It cannot be restarted.
pub struct FlowStream {
    receiver: Receiver<Event>,
    done: bool,
}

impl Iterator for FlowStream {
    type Item = Result<(String, Value), FlowError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.receiver.recv() {
            Ok(Event::Item(id, value)) => Some(Ok((id, value))),
            Ok(Event::Finished) => {
                self.done = true;
                None
            }
            Ok(Event::Failed(err)) => {
                self.done = true;
                Some(Err(err))
            }
            Err(_) => {
                self.done = true;
                Some(Err(FlowError::Disconnected))
            }
        }
    }
}

impl std::iter::FusedIterator for FlowStream {}

impl std::fmt::Debug for FlowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowStream")
            .field("pending", &self.receiver.len())
            .field("done", &self.done)
            .finish()
    }
}
