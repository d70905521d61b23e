use chrono::{DateTime, Utc};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

/// One status update from an agent, as delivered to subscribers.
#[derive(Clone, Debug)]
pub struct ProgressUpdate {
  pub agent: String,
  pub ticker: Option<String>,
  pub status: String,
  pub analysis: Option<String>,
  pub timestamp: DateTime<Utc>,
}

pub type ProgressHandler = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

struct BusInner {
  next_id: u64,
  handlers: Vec<(u64, ProgressHandler)>,
}

/// Per-run broadcast of agent status updates.
///
/// The bus is a cheaply cloneable value that is threaded through the node
/// context, so concurrent runs never see each other's events. Handlers are
/// invoked synchronously from the producer; a handler must not block.
#[derive(Clone)]
pub struct ProgressBus {
  inner: Arc<Mutex<BusInner>>,
}

impl ProgressBus {
  pub fn new() -> Self {
    ProgressBus {
      inner: Arc::new(Mutex::new(BusInner { next_id: 0, handlers: Vec::new() })),
    }
  }

  /// Subscribe a handler. The returned id is the unregistration token.
  pub fn register_handler(&self, handler: ProgressHandler) -> u64 {
    let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
    let id = inner.next_id;
    inner.next_id += 1;
    inner.handlers.push((id, handler));
    id
  }

  /// Remove a handler. Dispatches that already snapshotted the handler set
  /// may still deliver at most one in-flight call to it.
  pub fn unregister_handler(&self, id: u64) {
    let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
    inner.handlers.retain(|(handler_id, _)| *handler_id != id);
  }

  pub fn update_status(&self, agent: &str, ticker: Option<&str>, status: &str) {
    self.dispatch(agent, ticker, status, None);
  }

  pub fn update_with_analysis(&self, agent: &str, ticker: Option<&str>, status: &str, analysis: &str) {
    self.dispatch(agent, ticker, status, Some(analysis));
  }

  fn dispatch(&self, agent: &str, ticker: Option<&str>, status: &str, analysis: Option<&str>) {
    let update = ProgressUpdate {
      agent: agent.to_string(),
      ticker: ticker.map(String::from),
      status: status.to_string(),
      analysis: analysis.map(String::from),
      timestamp: Utc::now(),
    };

    // Snapshot under the lock, invoke outside it. Events from one producer
    // thread keep their order; a panicking handler must not take the
    // remaining handlers down with it.
    let handlers: Vec<ProgressHandler> = {
      let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
      inner.handlers.iter().map(|(_, h)| h.clone()).collect()
    };

    for handler in handlers {
      let result = catch_unwind(AssertUnwindSafe(|| handler(&update)));
      if result.is_err() {
        log::error!("Progress handler panicked while processing update from {}", update.agent);
      }
    }
  }

  pub fn handler_count(&self) -> usize {
    let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
    inner.handlers.len()
  }
}

impl Default for ProgressBus {
  fn default() -> Self {
    ProgressBus::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn delivers_updates_in_dispatch_order() {
    let bus = ProgressBus::new();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let seen_clone = seen.clone();
    bus.register_handler(Arc::new(move |update| {
      seen_clone.lock().unwrap().push(update.status.clone());
    }));

    bus.update_status("technical_analyst_agent", Some("AAPL"), "Fetching price data");
    bus.update_status("technical_analyst_agent", Some("AAPL"), "Calculating trend signals");
    bus.update_status("technical_analyst_agent", Some("AAPL"), "Done");

    let statuses = seen.lock().unwrap().clone();
    assert_eq!(statuses, vec!["Fetching price data", "Calculating trend signals", "Done"]);
  }

  #[test]
  fn unregistered_handler_receives_nothing_further() {
    let bus = ProgressBus::new();
    let count = Arc::new(AtomicUsize::new(0));

    let count_clone = count.clone();
    let id = bus.register_handler(Arc::new(move |_| {
      count_clone.fetch_add(1, Ordering::SeqCst);
    }));

    bus.update_status("fundamentals_agent", None, "Analyzing profitability");
    bus.unregister_handler(id);
    bus.update_status("fundamentals_agent", None, "Done");

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(bus.handler_count(), 0);
  }

  #[test]
  fn panicking_handler_does_not_affect_others() {
    let bus = ProgressBus::new();
    let count = Arc::new(AtomicUsize::new(0));

    bus.register_handler(Arc::new(|_| {
      panic!("handler failure");
    }));
    let count_clone = count.clone();
    bus.register_handler(Arc::new(move |_| {
      count_clone.fetch_add(1, Ordering::SeqCst);
    }));

    bus.update_status("risk_management_agent", Some("MSFT"), "Calculating position limits");
    assert_eq!(count.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn carries_ticker_and_analysis() {
    let bus = ProgressBus::new();
    let captured: Arc<Mutex<Option<ProgressUpdate>>> = Arc::new(Mutex::new(None));

    let captured_clone = captured.clone();
    bus.register_handler(Arc::new(move |update| {
      *captured_clone.lock().unwrap() = Some(update.clone());
    }));

    bus.update_with_analysis("sentiment_agent", Some("NVDA"), "Done", "insider selling pressure");

    let update = captured.lock().unwrap().clone().unwrap();
    assert_eq!(update.agent, "sentiment_agent");
    assert_eq!(update.ticker.as_deref(), Some("NVDA"));
    assert_eq!(update.analysis.as_deref(), Some("insider selling pressure"));
  }
}
