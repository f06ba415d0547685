use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use petgraph::Graph;
use petgraph::graph::NodeIndex;
use serde::Serialize;

/// A single task execution observed during a run.
#[derive(Debug, Clone, Serialize)]
pub struct TaskExecution {
    pub task: String,
    /// Index of the wavefront the task was dispatched in, starting at zero.
    pub wavefront: usize,
    /// Position in the dispatch order of its wavefront.
    pub slot: usize,
    /// Start of the execution, relative to the start of the run.
    pub offset_micros: u64,
    pub duration_micros: u64,
    pub succeeded: bool,
}

/// What happened during a run: every task execution, and the task graph as
/// it was discovered by following `next` ids.
#[derive(Debug, Serialize)]
pub struct Diagnostics {
    wavefronts: usize,
    executions: Vec<TaskExecution>,
    edges: Vec<(String, String)>,
    leaves: Vec<String>,
    #[serde(skip)]
    started: Instant,
    #[serde(skip)]
    graph: Graph<String, ()>,
    #[serde(skip)]
    nodes: HashMap<String, NodeIndex>,
    #[serde(skip)]
    seen: HashSet<(NodeIndex, NodeIndex)>,
}

impl Diagnostics {
    pub(crate) fn new(started: Instant) -> Self {
        Self {
            wavefronts: 0,
            executions: Vec::new(),
            edges: Vec::new(),
            leaves: Vec::new(),
            started,
            graph: Graph::new(),
            nodes: HashMap::new(),
            seen: HashSet::new(),
        }
    }

    pub(crate) fn begin_wavefront(&mut self) -> usize {
        self.wavefronts += 1;
        self.wavefronts - 1
    }

    pub(crate) fn record(
        &mut self,
        task: &str,
        wavefront: usize,
        slot: usize,
        start: Instant,
        duration: Duration,
        succeeded: bool,
    ) {
        self.node(task);
        self.executions.push(TaskExecution {
            task: task.to_string(),
            wavefront,
            slot,
            offset_micros: micros(start.saturating_duration_since(self.started)),
            duration_micros: micros(duration),
            succeeded,
        });
    }

    pub(crate) fn edge(&mut self, from: &str, to: &str) {
        let a = self.node(from);
        let b = self.node(to);

        if self.seen.insert((a, b)) {
            self.graph.add_edge(a, b, ());
            self.edges.push((from.to_string(), to.to_string()));
        }
    }

    pub(crate) fn leaf(&mut self, task: &str) {
        if !self.leaves.iter().any(|leaf| leaf == task) {
            self.leaves.push(task.to_string());
        }
    }

    fn node(&mut self, task: &str) -> NodeIndex {
        if let Some(&index) = self.nodes.get(task) {
            return index;
        }

        let index = self.graph.add_node(task.to_string());
        self.nodes.insert(task.to_string(), index);
        index
    }

    /// Number of wavefronts dispatched.
    pub fn wavefronts(&self) -> usize {
        self.wavefronts
    }

    /// Every execution in the order the scheduler observed it.
    pub fn executions(&self) -> &[TaskExecution] {
        &self.executions
    }

    /// How many times `task` was executed.
    pub fn executions_of(&self, task: &str) -> usize {
        self.executions.iter().filter(|e| e.task == task).count()
    }

    /// Discovered `(from, to)` scheduling edges, each listed once.
    pub fn edges(&self) -> &[(String, String)] {
        &self.edges
    }

    /// Whether the run went around a cycle of the task graph.
    pub fn is_cyclic(&self) -> bool {
        petgraph::algo::is_cyclic_directed(&self.graph)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

/// Renders the discovered graph as a Mermaid flowchart.
impl std::fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let name = self.graph[index].replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), name)?;

            if self.leaves.contains(&self.graph[index]) {
                writeln!(f, "    {} --> Output", index.index())?;
            }
        }

        writeln!(f, "    Output[Output]")?;

        for edge in self.graph.raw_edges() {
            writeln!(
                f,
                "    {} --> {}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}
