use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// A type-erased, thread-safe value produced by a task or supplied as input.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Atomic reference-counted string type used for task identifiers.
pub(crate) type ArcStr = Arc<str>;

/// Result returned from a task action.
pub type TaskResult<T = TaskOutput> = anyhow::Result<T>;

/// The value produced by a single task execution, together with the ids of
/// the tasks that should run next.
///
/// An output with no next ids marks the task as a *leaf* for this execution,
/// and its value is exported in the final result of the run.
#[derive(Clone)]
pub struct TaskOutput {
    pub(crate) value: Value,
    pub(crate) next: Vec<String>,
}

impl TaskOutput {
    /// Creates a leaf output carrying `value`.
    pub fn new<T>(value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        Self::from_value(Arc::new(value))
    }

    /// Creates an output carrying `value` which schedules `next` afterwards.
    pub fn then<T, I, S>(value: T, next: I) -> Self
    where
        T: Send + Sync + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(value).with_next(next)
    }

    /// Creates a leaf output from an already type-erased value.
    pub fn from_value(value: Value) -> Self {
        Self {
            value,
            next: Vec::new(),
        }
    }

    /// Appends task ids to run after this one, keeping their order.
    pub fn with_next<I, S>(mut self, next: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.next.extend(next.into_iter().map(Into::into));
        self
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn next(&self) -> &[String] {
        &self.next
    }

    pub fn is_leaf(&self) -> bool {
        self.next.is_empty()
    }
}

impl std::fmt::Debug for TaskOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOutput")
            .field("value", &"<dyn Any>")
            .field("next", &self.next)
            .finish()
    }
}

/// Values used to seed the context of a run.
///
/// # Example
///
/// ```rust
/// use nagare::Inputs;
///
/// let inputs = Inputs::new().with("count", 0_i32).with("name", "nagare");
/// assert_eq!(inputs.len(), 2);
/// ```
#[derive(Clone, Default)]
pub struct Inputs {
    values: Vec<(String, Value)>,
}

impl Inputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an input; a later input with the same key wins.
    pub fn with<T>(mut self, key: impl Into<String>, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.values.push((key.into(), Arc::new(value)));
        self
    }

    /// Adds an already type-erased input.
    pub fn with_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.push((key.into(), value));
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl IntoIterator for Inputs {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Inputs {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// The values of every leaf task reached during a run, keyed by task id.
#[derive(Clone, Default)]
pub struct Leaves {
    map: HashMap<String, Value>,
}

impl Leaves {
    pub(crate) fn insert(&mut self, id: impl Into<String>, value: Value) {
        self.map.insert(id.into(), value);
    }

    /// Returns the value of leaf `id` if it exists and holds a `T`.
    pub fn get<T: 'static>(&self, id: &str) -> Option<&T> {
        self.map.get(id).and_then(|value| value.downcast_ref::<T>())
    }

    pub fn value(&self, id: &str) -> Option<&Value> {
        self.map.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.map.contains_key(id)
    }

    /// Leaf ids in sorted order.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<_> = self.map.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn into_inner(self) -> HashMap<String, Value> {
        self.map
    }
}

impl IntoIterator for Leaves {
    type Item = (String, Value);
    type IntoIter = std::collections::hash_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.map.into_iter()
    }
}

impl std::fmt::Debug for Leaves {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_without_next_is_leaf() {
        let output = TaskOutput::new("result");
        assert!(output.is_leaf());
        assert_eq!(output.value().downcast_ref::<&str>(), Some(&"result"));
    }

    #[test]
    fn test_output_keeps_next_order() {
        let output = TaskOutput::then(1_u8, ["b", "a"]).with_next(["c"]);
        assert!(!output.is_leaf());
        assert_eq!(output.next(), ["b", "a", "c"]);
    }

    #[test]
    fn test_leaves_typed_access() {
        let mut leaves = Leaves::default();
        leaves.insert("b", Arc::new(String::from("two")));
        leaves.insert("a", Arc::new(1_i32));
        leaves.insert("a", Arc::new(3_i32));

        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves.ids(), ["a", "b"]);
        assert_eq!(leaves.get::<i32>("a"), Some(&3));
        assert_eq!(leaves.get::<String>("a"), None);
        assert_eq!(leaves.get::<String>("b").map(String::as_str), Some("two"));
    }

    #[test]
    fn test_inputs_collect() {
        let inputs: Inputs = [("x", Arc::new(1_u32) as Value)].into_iter().collect();
        assert_eq!(inputs.len(), 1);
        assert!(Inputs::new().is_empty());
    }
}
