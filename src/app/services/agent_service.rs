use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::ai_agent::agents::portfolio_manager::{self, PortfolioDecision, PortfolioManagerAgent};
use crate::ai_agent::agents::risk_manager::RiskManagerAgent;
use crate::ai_agent::data::provider::{DataProvider, FinancialDatasetsProvider};
use crate::ai_agent::graph::context::{AgentContext, RunOptions};
use crate::ai_agent::graph::graph::{AgentFunction, CompiledGraph, StateGraph, END_NODE};
use crate::ai_agent::graph::state::{AgentState, NamedMessage, StateDelta};
use crate::ai_agent::llm::model_provider::ModelProvider;
use crate::ai_agent::llm::models::{ChatterFactory, RealChatterFactory};
use crate::ai_agent::progress::ProgressBus;
use crate::ai_agent::utils::analysts::{filter_selected, get_analyst_config};
use crate::app::config::Config;
use crate::app::models::events::RunEvent;
use crate::app::models::schemas::{create_portfolio, FlowRunStatus, FlowRunUpdateRequest, HedgeFundRequest};
use crate::app::repositories::flow_run_repository::FlowRunRepository;
use crate::backtester::{BacktestAgent, BacktestOutput, Portfolio};

/// Ties a streaming run to a FlowRun row so the lifecycle FSM tracks it.
#[derive(Clone)]
pub struct RunTracker {
  pub repo: FlowRunRepository,
  pub run_id: i64,
}

impl RunTracker {
  fn set_status(&self, status: FlowRunStatus, results: Option<Value>, error_message: Option<String>) {
    let update = FlowRunUpdateRequest { status: Some(status), results, error_message };
    if let Err(e) = self.repo.update_flow_run(self.run_id, &update) {
      log::error!("Failed to update flow run {}: {}", self.run_id, e);
    }
  }
}

/// Builds and drives the analyst DAG, both as a one-shot call and as a
/// streaming run with cancellation.
#[derive(Clone)]
pub struct AgentService {
  provider: Arc<dyn DataProvider>,
  chatters: Arc<dyn ChatterFactory>,
}

impl AgentService {
  pub fn new(config: Config) -> Self {
    AgentService {
      provider: Arc::new(FinancialDatasetsProvider::new(config.financial_datasets_api_key.clone())),
      chatters: Arc::new(RealChatterFactory::new(config)),
    }
  }

  pub fn with_components(provider: Arc<dyn DataProvider>, chatters: Arc<dyn ChatterFactory>) -> Self {
    AgentService { provider, chatters }
  }

  /// Reject requests that cannot produce a run at all. Unknown analysts are
  /// not an error; the registry filter drops them later.
  pub fn validate(request: &HedgeFundRequest) -> Result<(), String> {
    if request.tickers.is_empty() {
      return Err("At least one ticker is required".to_string());
    }
    if request.initial_cash < 0.0 {
      return Err("initial_cash must be non-negative".to_string());
    }
    if !(0.0..=1.0).contains(&request.margin_requirement) {
      return Err("margin_requirement must be within [0, 1]".to_string());
    }
    if ModelProvider::from_str(&request.model_provider).is_err() {
      return Err(format!("Unknown model provider: {}", request.model_provider));
    }
    let start = request.resolved_start_date();
    let end = request.resolved_end_date();
    for date in [&start, &end] {
      if chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").is_err() {
        return Err(format!("Invalid date: {}", date));
      }
    }
    if start > end {
      return Err("start_date must not be after end_date".to_string());
    }
    Ok(())
  }

  fn start(_state: AgentState, _ctx: AgentContext) -> crate::ai_agent::graph::graph::AgentFuture {
    Box::pin(async move { Ok(StateDelta::new()) })
  }

  /// entry -> selected analysts (parallel) -> risk -> portfolio -> END.
  fn create_workflow(&self, selected: &[String]) -> StateGraph {
    let mut workflow = StateGraph::new();
    workflow.add_node("start_node", Self::start as AgentFunction);

    let registry = get_analyst_config();
    let mut analyst_nodes: Vec<String> = Vec::new();
    for key in selected {
      if let Some(analyst) = registry.get(key.as_str()) {
        let node_name = format!("{}_agent", key);
        workflow.add_analyst_node(&node_name, analyst.agent_function, analyst.signal_key);
        workflow.add_edge("start_node", &node_name);
        analyst_nodes.push(node_name);
      }
    }

    workflow.add_node(
      "risk_management_agent",
      RiskManagerAgent::static_risk_management_agent as AgentFunction,
    );
    workflow.add_node(
      "portfolio_manager",
      PortfolioManagerAgent::static_portfolio_management_agent as AgentFunction,
    );

    for node_name in &analyst_nodes {
      workflow.add_edge(node_name, "risk_management_agent");
    }
    if analyst_nodes.is_empty() {
      workflow.add_edge("start_node", "risk_management_agent");
    }
    workflow.add_edge("risk_management_agent", "portfolio_manager");
    workflow.add_edge("portfolio_manager", END_NODE);
    workflow.set_entry_point("start_node");
    workflow
  }

  fn build_context(&self, request: &HedgeFundRequest, bus: ProgressBus) -> AgentContext {
    let provider =
      ModelProvider::from_str(&request.model_provider).unwrap_or(ModelProvider::OpenAI);
    let mut options = RunOptions::new(&request.model_name, provider);
    options.show_reasoning = request.show_reasoning;
    options.agent_models = request.agent_models.clone().unwrap_or_default();

    AgentContext {
      provider: self.provider.clone(),
      bus,
      chatters: self.chatters.clone(),
      options: Arc::new(options),
    }
  }

  fn build_initial_state(request: &HedgeFundRequest, portfolio: Value) -> AgentState {
    let mut state = AgentState::new();
    state.messages.push(NamedMessage::new(
      "user",
      "Make trading decisions based on the provided data.",
    ));

    let mut data: HashMap<String, Value> = HashMap::new();
    data.insert("tickers".to_string(), json!(request.tickers));
    data.insert("portfolio".to_string(), portfolio);
    data.insert("start_date".to_string(), json!(request.resolved_start_date()));
    data.insert("end_date".to_string(), json!(request.resolved_end_date()));
    data.insert("analyst_signals".to_string(), json!({}));
    state.update_from_delta(StateDelta::new().with_data(data));

    state.metadata.insert("show_reasoning".to_string(), json!(request.show_reasoning));
    state.metadata.insert("model_name".to_string(), json!(request.model_name));
    state.metadata.insert("model_provider".to_string(), json!(request.model_provider));
    state
  }

  /// One blocking DAG run returning `{decisions, analyst_signals}`.
  pub async fn run_hedge_fund(&self, request: &HedgeFundRequest) -> Result<Value> {
    let selected = filter_selected(&request.selected_agents);
    let graph = self.create_workflow(&selected).compile();
    let portfolio =
      create_portfolio(request.initial_cash, request.margin_requirement, &request.tickers);
    let state = Self::build_initial_state(request, portfolio);
    let ctx = self.build_context(request, ProgressBus::new());

    let final_state = graph.invoke(state, ctx).await?;
    extract_run_results(&final_state)
  }

  /// Streaming run: returns a receiver of SSE frames. The first frame is
  /// always `start`; the stream ends with exactly one `complete` or
  /// `error`, or with a silent close when the client went away. Dropping
  /// the receiver cancels the graph within one 1-second tick.
  pub fn run_streaming(
    &self,
    request: HedgeFundRequest,
    tracker: Option<RunTracker>,
  ) -> UnboundedReceiver<String> {
    let (tx, rx) = unbounded::<String>();
    let service = self.clone();
    tokio::spawn(async move {
      service.drive_streaming_run(request, tracker, tx).await;
    });
    rx
  }

  async fn drive_streaming_run(
    self,
    request: HedgeFundRequest,
    tracker: Option<RunTracker>,
    tx: UnboundedSender<String>,
  ) {
    let bus = ProgressBus::new();
    let ctx = self.build_context(&request, bus.clone());
    let selected = filter_selected(&request.selected_agents);
    let graph: CompiledGraph = self.create_workflow(&selected).compile();
    let portfolio =
      create_portfolio(request.initial_cash, request.margin_requirement, &request.tickers);
    let state = Self::build_initial_state(&request, portfolio);

    // Forward bus updates into a queue the select loop drains.
    let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel::<RunEvent>();
    let handler_id = bus.register_handler(Arc::new(move |update| {
      let event = RunEvent::ProgressUpdate {
        agent: update.agent.clone(),
        ticker: update.ticker.clone(),
        status: update.status.clone(),
        analysis: update.analysis.clone(),
        timestamp: update.timestamp.to_rfc3339(),
      };
      let _ = progress_tx.send(event);
    }));

    if let Some(tracker) = &tracker {
      tracker.set_status(FlowRunStatus::InProgress, None, None);
    }

    if tx.unbounded_send(RunEvent::Start.to_sse()).is_err() {
      // Client was gone before we even started.
      bus.unregister_handler(handler_id);
      if let Some(tracker) = &tracker {
        tracker.set_status(FlowRunStatus::Error, None, Some("cancelled".to_string()));
      }
      return;
    }

    let run_task = tokio::spawn(async move { graph.invoke(state, ctx).await });

    loop {
      if run_task.is_finished() {
        break;
      }

      match tokio::time::timeout(Duration::from_secs(1), progress_rx.recv()).await {
        Ok(Some(event)) => {
          if tx.unbounded_send(event.to_sse()).is_err() {
            self.cancel_run(run_task, &bus, handler_id, &tracker);
            return;
          }
        }
        Ok(None) => {}
        Err(_) => {}
      }

      // Disconnect check once per tick: the SSE body was dropped.
      if tx.is_closed() {
        self.cancel_run(run_task, &bus, handler_id, &tracker);
        return;
      }
    }

    let outcome = run_task.await;
    // Everything the graph said before finishing goes out ahead of the
    // terminal event.
    while let Ok(event) = progress_rx.try_recv() {
      let _ = tx.unbounded_send(event.to_sse());
    }
    bus.unregister_handler(handler_id);

    match outcome {
      Ok(Ok(final_state)) => match extract_run_results(&final_state) {
        Ok(results) => {
          let _ = tx.unbounded_send(RunEvent::Complete { data: results.clone() }.to_sse());
          if let Some(tracker) = &tracker {
            tracker.set_status(FlowRunStatus::Complete, Some(results), None);
          }
        }
        Err(e) => {
          let message = format!("Failed to generate hedge fund decisions: {}", e);
          let _ = tx.unbounded_send(RunEvent::Error { message: message.clone() }.to_sse());
          if let Some(tracker) = &tracker {
            tracker.set_status(FlowRunStatus::Error, None, Some(message));
          }
        }
      },
      Ok(Err(e)) => {
        let message = e.to_string();
        let _ = tx.unbounded_send(RunEvent::Error { message: message.clone() }.to_sse());
        if let Some(tracker) = &tracker {
          tracker.set_status(FlowRunStatus::Error, None, Some(message));
        }
      }
      Err(e) => {
        let message = format!("Run task failed: {}", e);
        let _ = tx.unbounded_send(RunEvent::Error { message: message.clone() }.to_sse());
        if let Some(tracker) = &tracker {
          tracker.set_status(FlowRunStatus::Error, None, Some(message));
        }
      }
    }
  }

  /// Client disconnect: abort the graph, record the documented terminal
  /// state (ERROR with message "cancelled"), emit nothing further.
  fn cancel_run(
    &self,
    run_task: tokio::task::JoinHandle<Result<AgentState>>,
    bus: &ProgressBus,
    handler_id: u64,
    tracker: &Option<RunTracker>,
  ) {
    log::info!("Client disconnected, cancelling hedge fund execution");
    run_task.abort();
    bus.unregister_handler(handler_id);
    if let Some(tracker) = tracker {
      tracker.set_status(FlowRunStatus::Error, None, Some("cancelled".to_string()));
    }
  }
}

/// Pull `{decisions, analyst_signals}` out of the final state: the last
/// portfolio-manager message is the decision payload.
fn extract_run_results(final_state: &AgentState) -> Result<Value> {
  let decisions_message = final_state
    .messages
    .iter()
    .rev()
    .find(|m| m.name == portfolio_manager::NODE_NAME)
    .ok_or_else(|| anyhow!("No portfolio manager message in final state"))?;
  let decisions: Value = serde_json::from_str(&decisions_message.content)
    .map_err(|e| anyhow!("Unparseable portfolio decisions: {}", e))?;

  Ok(json!({
    "decisions": decisions,
    "analyst_signals": final_state.analyst_signals(),
  }))
}

/// Adapter that lets the backtester replay the full DAG day by day.
pub struct HedgeFundBacktestAgent {
  service: Arc<AgentService>,
  base_request: HedgeFundRequest,
}

impl HedgeFundBacktestAgent {
  pub fn new(service: Arc<AgentService>, base_request: HedgeFundRequest) -> Self {
    HedgeFundBacktestAgent { service, base_request }
  }
}

#[async_trait]
impl BacktestAgent for HedgeFundBacktestAgent {
  async fn run(
    &self,
    tickers: &[String],
    start_date: &str,
    end_date: &str,
    portfolio: &Portfolio,
  ) -> Result<BacktestOutput> {
    let mut request = self.base_request.clone();
    request.tickers = tickers.to_vec();
    request.start_date = Some(start_date.to_string());
    request.end_date = Some(end_date.to_string());

    let selected = filter_selected(&request.selected_agents);
    let graph = self.service.create_workflow(&selected).compile();
    let state = AgentService::build_initial_state(&request, portfolio.to_json());
    let ctx = self.service.build_context(&request, ProgressBus::new());

    let final_state = graph.invoke(state, ctx).await?;
    let results = extract_run_results(&final_state)?;

    let decisions: HashMap<String, PortfolioDecision> =
      serde_json::from_value(results["decisions"].clone())
        .map_err(|e| anyhow!("Unparseable decisions: {}", e))?;
    Ok(BacktestOutput { decisions, analyst_signals: results["analyst_signals"].clone() })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ai_agent::testing::{MockDataProvider, ScriptedChatterFactory};
  use crate::app::repositories::Database;
  use futures::StreamExt;

  fn decisions_reply(tickers: &[&str]) -> String {
    let decisions: serde_json::Map<String, Value> = tickers
      .iter()
      .map(|t| {
        (
          t.to_string(),
          json!({"action": "buy", "quantity": 5, "confidence": 75.0, "reasoning": "signals align"}),
        )
      })
      .collect();
    json!({"decisions": Value::Object(decisions)}).to_string()
  }

  fn service_with_reply(reply: &str) -> Arc<AgentService> {
    Arc::new(AgentService::with_components(
      Arc::new(MockDataProvider::new()),
      Arc::new(ScriptedChatterFactory::replying(reply)),
    ))
  }

  fn request(tickers: &[&str], agents: &[&str]) -> HedgeFundRequest {
    serde_json::from_value(json!({
      "tickers": tickers,
      "selected_agents": agents,
      "start_date": "2024-01-01",
      "end_date": "2024-03-01",
      "initial_cash": 100000.0,
      "margin_requirement": 0.0,
    }))
    .unwrap()
  }

  async fn collect_frames(mut rx: UnboundedReceiver<String>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Some(frame) = rx.next().await {
      let body: Value =
        serde_json::from_str(frame.trim_start_matches("data: ").trim()).unwrap();
      frames.push(body);
    }
    frames
  }

  #[tokio::test]
  async fn happy_path_streams_start_progress_then_complete() {
    let service = service_with_reply(&decisions_reply(&["AAPL", "MSFT"]));
    let rx = service.run_streaming(
      request(&["AAPL", "MSFT"], &["technical_analyst", "fundamentals_analyst"]),
      None,
    );

    let frames = collect_frames(rx).await;
    assert_eq!(frames.first().unwrap()["type"], "start");
    assert_eq!(frames.last().unwrap()["type"], "complete");

    // Exactly one terminal event.
    let terminal = frames
      .iter()
      .filter(|f| f["type"] == "complete" || f["type"] == "error")
      .count();
    assert_eq!(terminal, 1);

    // Each analyst emitted at least two updates per ticker.
    for agent in ["technical_analyst_agent", "fundamentals_agent"] {
      for ticker in ["AAPL", "MSFT"] {
        let count = frames
          .iter()
          .filter(|f| {
            f["type"] == "progress_update" && f["agent"] == agent && f["ticker"] == ticker
          })
          .count();
        assert!(count >= 2, "expected >=2 updates for {}/{}, got {}", agent, ticker, count);
      }
    }

    let data = &frames.last().unwrap()["data"];
    let decisions = data["decisions"].as_object().unwrap();
    assert_eq!(decisions.len(), 2);
    assert!(decisions.contains_key("AAPL") && decisions.contains_key("MSFT"));

    let signals = data["analyst_signals"].as_object().unwrap();
    let mut keys: Vec<&String> = signals.keys().collect();
    keys.sort();
    assert_eq!(keys, vec!["fundamentals_agent", "risk_management_agent", "technical_analyst_agent"]);
  }

  #[tokio::test]
  async fn unknown_analysts_are_dropped_and_run_proceeds() {
    let service = service_with_reply(&decisions_reply(&["AAPL"]));
    let rx = service.run_streaming(request(&["AAPL"], &["not_an_agent"]), None);

    let frames = collect_frames(rx).await;
    assert_eq!(frames.last().unwrap()["type"], "complete");
    let signals = frames.last().unwrap()["data"]["analyst_signals"].as_object().unwrap().clone();
    let keys: Vec<&String> = signals.keys().collect();
    assert_eq!(keys, vec!["risk_management_agent"]);
  }

  #[tokio::test]
  async fn tracked_run_completes_with_results() {
    let db = Database::open(":memory:").unwrap();
    let repo = FlowRunRepository::new(db);
    let run = repo.create_flow_run(1, None).unwrap();

    let service = service_with_reply(&decisions_reply(&["AAPL"]));
    let rx = service.run_streaming(
      request(&["AAPL"], &["technical_analyst"]),
      Some(RunTracker { repo: repo.clone(), run_id: run.id }),
    );
    let frames = collect_frames(rx).await;
    assert_eq!(frames.last().unwrap()["type"], "complete");

    let stored = repo.get_flow_run_by_id(run.id).unwrap().unwrap();
    assert_eq!(stored.status, FlowRunStatus::Complete);
    assert!(stored.started_at.is_some());
    assert!(stored.completed_at.is_some());
    assert!(stored.results.unwrap()["decisions"]["AAPL"].is_object());
  }

  #[tokio::test(start_paused = true)]
  async fn client_disconnect_cancels_and_marks_run_cancelled() {
    let db = Database::open(":memory:").unwrap();
    let repo = FlowRunRepository::new(db);
    let run = repo.create_flow_run(1, None).unwrap();

    // A stalling provider keeps the graph in flight while the client
    // disconnects.
    let service = Arc::new(AgentService::with_components(
      Arc::new(MockDataProvider::with_delay(Duration::from_secs(120))),
      Arc::new(ScriptedChatterFactory::replying(&decisions_reply(&["AAPL"]))),
    ));
    let mut rx = service.run_streaming(
      request(&["AAPL"], &["technical_analyst"]),
      Some(RunTracker { repo: repo.clone(), run_id: run.id }),
    );

    // Read the start event, then hang up.
    let first = rx.next().await.unwrap();
    assert!(first.contains("start"));
    drop(rx);

    // The runner notices within its 1-second tick.
    let mut status = FlowRunStatus::Idle;
    for _ in 0..50 {
      tokio::time::sleep(Duration::from_millis(100)).await;
      status = repo.get_flow_run_by_id(run.id).unwrap().unwrap().status;
      if status == FlowRunStatus::Error {
        break;
      }
    }
    let stored = repo.get_flow_run_by_id(run.id).unwrap().unwrap();
    assert_eq!(status, FlowRunStatus::Error);
    assert_eq!(stored.error_message.as_deref(), Some("cancelled"));
  }

  #[tokio::test]
  async fn one_shot_run_returns_decisions_and_signals() {
    let service = service_with_reply(&decisions_reply(&["AAPL"]));
    let results = service
      .run_hedge_fund(&request(&["AAPL"], &["technical_analyst", "sentiment_analyst"]))
      .await
      .unwrap();

    assert_eq!(results["decisions"]["AAPL"]["action"], "buy");
    assert!(results["analyst_signals"]["technical_analyst_agent"]["AAPL"].is_object());
    assert!(results["analyst_signals"]["sentiment_agent"]["AAPL"].is_object());
  }

  #[test]
  fn validation_rejects_bad_parameters() {
    let mut bad_cash = request(&["AAPL"], &[]);
    bad_cash.initial_cash = -5.0;
    assert!(AgentService::validate(&bad_cash).is_err());

    let empty_tickers = request(&[], &[]);
    assert!(AgentService::validate(&empty_tickers).is_err());

    let mut bad_date = request(&["AAPL"], &[]);
    bad_date.start_date = Some("not-a-date".to_string());
    assert!(AgentService::validate(&bad_date).is_err());

    let mut inverted = request(&["AAPL"], &[]);
    inverted.start_date = Some("2024-06-01".to_string());
    inverted.end_date = Some("2024-01-01".to_string());
    assert!(AgentService::validate(&inverted).is_err());

    let mut bad_provider = request(&["AAPL"], &[]);
    bad_provider.model_provider = "NotAProvider".to_string();
    assert!(AgentService::validate(&bad_provider).is_err());

    assert!(AgentService::validate(&request(&["AAPL"], &["technical_analyst"])).is_ok());
  }

  #[tokio::test]
  async fn backtest_adapter_replays_the_dag() {
    let service = service_with_reply(&decisions_reply(&["AAPL"]));
    let agent = HedgeFundBacktestAgent::new(
      service,
      request(&["AAPL"], &["technical_analyst"]),
    );

    let portfolio = Portfolio::new(100_000.0, 0.0, &["AAPL".to_string()]);
    let output = agent
      .run(&["AAPL".to_string()], "2024-01-01", "2024-02-01", &portfolio)
      .await
      .unwrap();
    assert_eq!(output.decisions["AAPL"].quantity, 5);
    assert!(output.analyst_signals["technical_analyst_agent"].is_object());
  }
}
