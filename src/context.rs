use std::any::type_name;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crossbeam_channel::Sender;

use crate::core::Value;
use crate::error::ContextError;

/// An event on the stream queue of a run.
pub(crate) enum Event {
    /// A task pushed an item, or the engine reported a task completion.
    Item(String, Value),
    /// The run finished successfully.
    Finished,
    /// The run was aborted.
    Failed(crate::FlowError),
}

/// The run-scoped state shared by every task of a single run.
///
/// A `Context` holds a key/value store and a stream queue:
///
/// * The store receives the seeded inputs, explicit writes made by tasks
///   through [`Context::set`], and the value of every completed task under its
///   own id. Writes made in one wavefront are visible to every task of the
///   next one.
/// * The stream queue receives ad hoc items pushed with
///   [`Context::push_stream`] and one completion item per finished task. It is
///   drained by [`Flow::stream`](crate::Flow::stream); during blocking runs
///   nothing listens and pushed items are dropped.
///
/// All methods take `&self` and are safe to call from many worker threads at
/// once.
pub struct Context {
    store: RwLock<HashMap<String, Value>>,
    stream: Option<Sender<Event>>,
}

impl Context {
    /// Creates an empty context without a stream consumer.
    pub fn new() -> Self {
        Self {
            store: RwLock::new(HashMap::new()),
            stream: None,
        }
    }

    pub(crate) fn streaming(sender: Sender<Event>) -> Self {
        Self {
            store: RwLock::new(HashMap::new()),
            stream: Some(sender),
        }
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn set<T>(&self, key: impl Into<String>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.set_value(key, Arc::new(value));
    }

    /// Stores an already type-erased value under `key`.
    pub fn set_value(&self, key: impl Into<String>, value: Value) {
        self.store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value);
    }

    /// Returns the value stored under `key` as a `T`.
    ///
    /// The key may be a seeded input, an explicit write, or the id of a task
    /// that has already completed.
    ///
    /// # Example
    ///
    /// ```rust
    /// use nagare::Context;
    ///
    /// let ctx = Context::new();
    /// ctx.set("count", 3_i32);
    /// assert_eq!(*ctx.get::<i32>("count").unwrap(), 3);
    /// assert!(ctx.get::<String>("count").is_err());
    /// assert!(ctx.get::<i32>("missing").is_err());
    /// ```
    pub fn get<T>(&self, key: &str) -> Result<Arc<T>, ContextError>
    where
        T: Send + Sync + 'static,
    {
        self.get_value(key)?
            .downcast::<T>()
            .map_err(|_| ContextError::WrongType {
                key: key.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Returns the type-erased value stored under `key`.
    pub fn get_value(&self, key: &str) -> Result<Value, ContextError> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| ContextError::NotFound(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// All keys currently stored, in sorted order.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self
            .store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Pushes an item onto the stream queue of this run.
    ///
    /// Streaming consumers see the item as soon as it is pushed, without
    /// waiting for the current wavefront to complete.
    pub fn push_stream<T>(&self, task_id: impl Into<String>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.push_stream_value(task_id, Arc::new(value));
    }

    /// Pushes an already type-erased item onto the stream queue.
    pub fn push_stream_value(&self, task_id: impl Into<String>, value: Value) {
        self.emit(Event::Item(task_id.into(), value));
    }

    pub(crate) fn emit(&self, event: Event) {
        if let Some(sender) = &self.stream {
            // The consumer may have dropped the stream early.
            if sender.send(event).is_err() {
                tracing::trace!("stream consumer is gone, dropping item");
            }
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("keys", &self.keys())
            .field("streaming", &self.stream.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_read_after_write() {
        let ctx = Context::new();
        ctx.set("shared", String::from("first"));
        assert_eq!(*ctx.get::<String>("shared").unwrap(), "first");

        ctx.set("shared", String::from("second"));
        assert_eq!(*ctx.get::<String>("shared").unwrap(), "second");
    }

    #[test]
    fn test_missing_key() {
        let ctx = Context::new();
        assert_eq!(
            ctx.get_value("nope").unwrap_err(),
            ContextError::NotFound("nope".into())
        );
        assert!(!ctx.contains("nope"));
    }

    #[test]
    fn test_wrong_type() {
        let ctx = Context::new();
        ctx.set("count", 1_i32);

        match ctx.get::<u64>("count") {
            Err(ContextError::WrongType { key, expected }) => {
                assert_eq!(key, "count");
                assert_eq!(expected, "u64");
            }
            _ => panic!("expected a type mismatch"),
        }
    }

    #[test]
    fn test_concurrent_writers() {
        let ctx = Context::new();

        std::thread::scope(|s| {
            for i in 0..8 {
                let ctx = &ctx;
                s.spawn(move || {
                    for j in 0..100 {
                        ctx.set(format!("{i}-{j}"), j);
                        ctx.push_stream("writer", j);
                    }
                });
            }
        });

        assert_eq!(ctx.keys().len(), 800);
        assert_eq!(*ctx.get::<i32>("7-99").unwrap(), 99);
    }

    #[test]
    fn test_stream_is_fifo() {
        let (tx, rx) = unbounded();
        let ctx = Context::streaming(tx);

        for i in 0..3 {
            ctx.push_stream("task1", i);
        }
        drop(ctx);

        let items: Vec<i32> = rx
            .iter()
            .map(|event| match event {
                Event::Item(id, value) => {
                    assert_eq!(id, "task1");
                    *value.downcast_ref::<i32>().unwrap()
                }
                _ => panic!("unexpected event"),
            })
            .collect();

        assert_eq!(items, [0, 1, 2]);
    }

    #[test]
    fn test_push_without_consumer_is_dropped() {
        let (tx, rx) = unbounded();
        drop(rx);

        let ctx = Context::streaming(tx);
        ctx.push_stream("task1", "ignored");
        ctx.set("task1", 1);
        assert_eq!(ctx.keys(), ["task1"]);

        let ctx = Context::new();
        ctx.push_stream("task1", "ignored");
        assert!(ctx.keys().is_empty());
    }
}
