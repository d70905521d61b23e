use anyhow::{anyhow, Error, Result};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::ai_agent::graph::context::AgentContext;
use crate::ai_agent::graph::state::{AgentState, StateDelta};

pub const END_NODE: &str = "END";

#[async_trait]
pub trait NodeFunction: Send + Sync {
  async fn call(&self, state: AgentState, ctx: AgentContext) -> Result<StateDelta>;
}

// Allow plain fn pointers returning boxed futures to serve as nodes.
#[async_trait]
impl<F> NodeFunction for F
where
  F: Fn(AgentState, AgentContext) -> Pin<Box<dyn Future<Output = Result<StateDelta, Error>> + Send>>
    + Send
    + Sync,
{
  async fn call(&self, state: AgentState, ctx: AgentContext) -> Result<StateDelta> {
    self(state, ctx).await
  }
}

pub type AgentFuture = Pin<Box<dyn Future<Output = Result<StateDelta, Error>> + Send>>;
pub type AgentFunction = fn(AgentState, AgentContext) -> AgentFuture;

struct Node {
  func: Arc<dyn NodeFunction>,
  // Set for analyst nodes: the key their signals live under, used to
  // synthesize a neutral default when the node fails.
  signal_key: Option<String>,
}

/// Builder for the analyst DAG: entry -> N analysts -> risk -> portfolio -> END.
pub struct StateGraph {
  nodes: HashMap<String, Node>,
  edges: HashMap<String, Vec<String>>,
  entry_point: Option<String>,
}

impl StateGraph {
  pub fn new() -> Self {
    StateGraph { nodes: HashMap::new(), edges: HashMap::new(), entry_point: None }
  }

  pub fn add_node<F>(&mut self, name: &str, func: F)
  where
    F: NodeFunction + 'static,
  {
    self.nodes.insert(name.to_string(), Node { func: Arc::new(func), signal_key: None });
    self.edges.entry(name.to_string()).or_default();
  }

  /// An analyst node: failures are downgraded to a neutral signal under
  /// `signal_key` instead of aborting the run.
  pub fn add_analyst_node<F>(&mut self, name: &str, func: F, signal_key: &str)
  where
    F: NodeFunction + 'static,
  {
    self.nodes.insert(
      name.to_string(),
      Node { func: Arc::new(func), signal_key: Some(signal_key.to_string()) },
    );
    self.edges.entry(name.to_string()).or_default();
  }

  pub fn add_edge(&mut self, from: &str, to: &str) {
    self.edges.entry(from.to_string()).or_default().push(to.to_string());
  }

  pub fn set_entry_point(&mut self, node: &str) {
    self.entry_point = Some(node.to_string());
  }

  pub fn compile(self) -> CompiledGraph {
    CompiledGraph { graph: Arc::new(self) }
  }
}

impl Default for StateGraph {
  fn default() -> Self {
    StateGraph::new()
  }
}

#[derive(Clone)]
pub struct CompiledGraph {
  graph: Arc<StateGraph>,
}

impl CompiledGraph {
  /// Drive the graph to completion.
  ///
  /// Scheduling is by ready-set: a node launches once every predecessor has
  /// reached a terminal state, and everything ready at the same moment runs
  /// concurrently. Deltas are merged in completion order; simultaneous
  /// launches are ordered by node id, which is also the tie-break for the
  /// message sequence. An analyst that fails contributes a neutral default
  /// signal; a failing manager node aborts the run.
  pub async fn invoke(&self, initial_state: AgentState, ctx: AgentContext) -> Result<AgentState> {
    let entry = self
      .graph
      .entry_point
      .clone()
      .ok_or_else(|| anyhow!("Graph must have an entry point"))?;

    let mut indegree: HashMap<String, usize> =
      self.graph.nodes.keys().map(|name| (name.clone(), 0)).collect();
    for (from, successors) in &self.graph.edges {
      if !self.graph.nodes.contains_key(from) {
        continue;
      }
      for to in successors {
        if let Some(count) = indegree.get_mut(to) {
          *count += 1;
        }
      }
    }

    if indegree.get(&entry).copied() != Some(0) {
      return Err(anyhow!("Entry node {} has incoming edges", entry));
    }

    let mut state = initial_state;
    let mut ready: Vec<String> =
      indegree.iter().filter(|(_, d)| **d == 0).map(|(n, _)| n.clone()).collect();
    let mut in_flight: FuturesUnordered<
      Pin<Box<dyn Future<Output = (String, Result<StateDelta>)> + Send>>,
    > = FuturesUnordered::new();
    let mut completed: HashSet<String> = HashSet::new();

    loop {
      ready.sort();
      for name in ready.drain(..) {
        let node = self.graph.nodes.get(&name).ok_or_else(|| anyhow!("Node not found: {}", name))?;
        let func = node.func.clone();
        let snapshot = state.clone();
        let node_ctx = ctx.clone();
        in_flight.push(Box::pin(async move {
          let result = func.call(snapshot, node_ctx).await;
          (name, result)
        }));
      }

      let (name, result) = match in_flight.next().await {
        Some(done) => done,
        None => break,
      };

      let delta = match result {
        Ok(delta) => delta,
        Err(e) => {
          let node = self.graph.nodes.get(&name).expect("completed node must exist");
          match &node.signal_key {
            Some(signal_key) => {
              log::error!("Analyst node {} failed: {}; substituting neutral signal", name, e);
              ctx.bus.update_status(signal_key, None, &format!("Error: {}; using neutral default", e));
              neutral_default_delta(signal_key, &state.tickers(), &e)
            }
            None => {
              log::error!("Node {} failed, terminating run: {}", name, e);
              return Err(anyhow!("Node {} failed: {}", name, e));
            }
          }
        }
      };

      state.update_from_delta(delta);
      completed.insert(name.clone());

      if let Some(successors) = self.graph.edges.get(&name) {
        for succ in successors {
          if succ == END_NODE {
            continue;
          }
          if let Some(count) = indegree.get_mut(succ) {
            *count -= 1;
            if *count == 0 {
              ready.push(succ.clone());
            }
          }
        }
      }
    }

    if completed.len() != self.graph.nodes.len() {
      return Err(anyhow!("Cycle detected in graph execution"));
    }

    Ok(state)
  }
}

/// The delta an analyst contributes when its body could not run: a neutral
/// signal for every requested ticker, plus a message noting the failure.
fn neutral_default_delta(signal_key: &str, tickers: &[String], error: &Error) -> StateDelta {
  let mut signals = serde_json::Map::new();
  for ticker in tickers {
    signals.insert(
      ticker.clone(),
      serde_json::json!({
        "signal": "neutral",
        "confidence": 0.0,
        "reasoning": format!("Agent failed ({}), defaulting to neutral", error),
      }),
    );
  }
  StateDelta::for_agent_signals(signal_key, serde_json::Value::Object(signals))
}
