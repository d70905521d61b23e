use anyhow::{anyhow, Result};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::ai_agent::llm::models::{get_ollama_models, ollama_base_url};

const STATUS_CACHE_DURATION: Duration = Duration::from_secs(10);
const SERVER_START_TIMEOUT_SECS: u64 = 20;
const SERVER_STOP_POLITE_SECS: u64 = 5;
const SERVER_STOP_FORCE_SECS: u64 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct OllamaStatus {
  pub installed: bool,
  pub running: bool,
  pub available_models: Vec<String>,
  pub server_url: String,
  pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
  Starting,
  Downloading,
  Completed,
  Error,
  Cancelled,
}

impl DownloadStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(self, DownloadStatus::Completed | DownloadStatus::Error | DownloadStatus::Cancelled)
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadProgress {
  pub status: DownloadStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub percentage: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub bytes_downloaded: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub total_bytes: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub phase: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
}

impl DownloadProgress {
  fn starting(model: &str) -> Self {
    DownloadProgress {
      status: DownloadStatus::Starting,
      percentage: Some(0.0),
      bytes_downloaded: None,
      total_bytes: None,
      phase: None,
      message: Some(format!("Starting download of {}...", model)),
    }
  }

  pub fn to_sse(&self) -> String {
    let body = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
    format!("data: {}\n\n", body)
  }
}

/// One NDJSON frame from the model server's pull endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct PullFrame {
  pub status: String,
  #[serde(default)]
  pub digest: Option<String>,
  #[serde(default)]
  pub total: Option<u64>,
  #[serde(default)]
  pub completed: Option<u64>,
}

/// 10-second cache over the status probe, invalidated by every
/// state-changing operation.
struct StatusCache {
  entry: Mutex<Option<(Instant, OllamaStatus)>>,
}

impl StatusCache {
  fn new() -> Self {
    StatusCache { entry: Mutex::new(None) }
  }

  fn get(&self) -> Option<OllamaStatus> {
    let entry = self.entry.lock().unwrap_or_else(|p| p.into_inner());
    match &*entry {
      Some((stamp, status)) if stamp.elapsed() < STATUS_CACHE_DURATION => Some(status.clone()),
      _ => None,
    }
  }

  fn set(&self, status: OllamaStatus) {
    let mut entry = self.entry.lock().unwrap_or_else(|p| p.into_inner());
    *entry = Some((Instant::now(), status));
  }

  fn clear(&self) {
    let mut entry = self.entry.lock().unwrap_or_else(|p| p.into_inner());
    *entry = None;
  }
}

/// Manages the local model server: detection, start/stop, model pulls with
/// streamed progress, and the recommended-model manifest.
#[derive(Clone)]
pub struct OllamaManager {
  base_url: String,
  client: reqwest::Client,
  status_cache: Arc<StatusCache>,
  downloads: Arc<Mutex<HashMap<String, DownloadProgress>>>,
}

impl OllamaManager {
  pub fn new() -> Self {
    OllamaManager {
      base_url: ollama_base_url(),
      client: reqwest::Client::new(),
      status_cache: Arc::new(StatusCache::new()),
      downloads: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  // ---------------------------------------------------------------------
  // Status
  // ---------------------------------------------------------------------

  pub async fn check_status(&self) -> OllamaStatus {
    if let Some(cached) = self.status_cache.get() {
      return cached;
    }

    let installed = Self::is_installed();
    let (running, models) = match self.probe_server().await {
      Ok(models) => (true, models),
      Err(_) => (false, Vec::new()),
    };
    let status = OllamaStatus {
      installed,
      running,
      available_models: models,
      server_url: if running { self.base_url.clone() } else { String::new() },
      error: None,
    };
    self.status_cache.set(status.clone());
    status
  }

  pub fn invalidate_status_cache(&self) {
    self.status_cache.clear();
  }

  fn is_installed() -> bool {
    Command::new("which")
      .arg("ollama")
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .status()
      .map(|s| s.success())
      .unwrap_or(false)
  }

  /// GET /api/tags; succeeding means the server is up.
  async fn probe_server(&self) -> Result<Vec<String>> {
    let url = format!("{}/api/tags", self.base_url);
    let response = self.client.get(&url).timeout(Duration::from_secs(2)).send().await?;
    if !response.status().is_success() {
      return Err(anyhow!("Status probe returned {}", response.status()));
    }
    let body: Value = response.json().await?;
    let models = body
      .get("models")
      .and_then(Value::as_array)
      .map(|models| {
        models
          .iter()
          .filter_map(|m| m.get("name").or_else(|| m.get("model")).and_then(Value::as_str))
          .map(String::from)
          .collect()
      })
      .unwrap_or_default();
    Ok(models)
  }

  // ---------------------------------------------------------------------
  // Server lifecycle
  // ---------------------------------------------------------------------

  pub async fn start_server(&self) -> (bool, String) {
    self.invalidate_status_cache();
    if self.probe_server().await.is_ok() {
      return (true, "Ollama server is already running".to_string());
    }

    let spawned = Command::new("ollama")
      .arg("serve")
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .spawn();
    if let Err(e) = spawned {
      return (false, format!("Error starting server: {}", e));
    }

    // Poll at 1 Hz until ready or timed out.
    for i in 0..SERVER_START_TIMEOUT_SECS {
      tokio::time::sleep(Duration::from_secs(1)).await;
      if self.probe_server().await.is_ok() {
        log::info!("Ollama server started successfully after {} seconds", i + 1);
        self.invalidate_status_cache();
        return (true, "Ollama server started successfully".to_string());
      }
    }
    (false, format!("Ollama server failed to start within {} seconds", SERVER_START_TIMEOUT_SECS))
  }

  pub async fn stop_server(&self) -> (bool, String) {
    self.invalidate_status_cache();
    if self.probe_server().await.is_err() {
      return (true, "Ollama server is already stopped".to_string());
    }

    let pids = Self::server_pids();
    Self::signal_pids(&pids, "-TERM");

    for _ in 0..SERVER_STOP_POLITE_SECS {
      tokio::time::sleep(Duration::from_secs(1)).await;
      if self.probe_server().await.is_err() {
        self.invalidate_status_cache();
        return (true, "Ollama server stopped successfully".to_string());
      }
    }

    Self::signal_pids(&Self::server_pids(), "-KILL");
    for _ in 0..SERVER_STOP_FORCE_SECS {
      tokio::time::sleep(Duration::from_secs(1)).await;
      if self.probe_server().await.is_err() {
        self.invalidate_status_cache();
        return (true, "Ollama server stopped successfully".to_string());
      }
    }
    (false, "Failed to stop Ollama server".to_string())
  }

  fn server_pids() -> Vec<String> {
    let output = Command::new("pgrep").args(["-f", "ollama serve"]).output();
    match output {
      Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect(),
      _ => Vec::new(),
    }
  }

  fn signal_pids(pids: &[String], signal: &str) {
    for pid in pids {
      let _ = Command::new("kill").arg(signal).arg(pid).status();
    }
  }

  // ---------------------------------------------------------------------
  // Model downloads
  // ---------------------------------------------------------------------

  /// Pull a model, streaming one SSE frame per upstream progress frame.
  /// The progress entry is dropped one second after reaching a terminal
  /// state.
  pub fn download_model_with_progress(&self, model_name: &str) -> UnboundedReceiver<String> {
    let (tx, rx) = unbounded::<String>();
    let manager = self.clone();
    let model = model_name.to_string();
    tokio::spawn(async move {
      manager.drive_model_pull(model, tx).await;
    });
    rx
  }

  async fn drive_model_pull(self, model: String, tx: UnboundedSender<String>) {
    self.invalidate_status_cache();

    if self.probe_server().await.is_err() {
      let progress = DownloadProgress {
        status: DownloadStatus::Error,
        percentage: None,
        bytes_downloaded: None,
        total_bytes: None,
        phase: None,
        message: Some("Ollama server is not running".to_string()),
      };
      self.store_progress(&model, progress.clone());
      let _ = tx.unbounded_send(progress.to_sse());
      self.cleanup_progress_later(model);
      return;
    }

    let starting = DownloadProgress::starting(&model);
    self.store_progress(&model, starting.clone());
    let _ = tx.unbounded_send(starting.to_sse());

    let url = format!("{}/api/pull", self.base_url);
    let response = self
      .client
      .post(&url)
      .json(&json!({"name": model, "stream": true}))
      .send()
      .await;

    let response = match response {
      Ok(response) if response.status().is_success() => response,
      Ok(response) => {
        self.fail_download(&model, &tx, &format!("Pull request failed: {}", response.status()));
        return;
      }
      Err(e) => {
        self.fail_download(&model, &tx, &format!("Pull request failed: {}", e));
        return;
      }
    };

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    'outer: while let Some(chunk) = stream.next().await {
      let chunk = match chunk {
        Ok(chunk) => chunk,
        Err(e) => {
          self.fail_download(&model, &tx, &format!("Stream error: {}", e));
          return;
        }
      };
      buffer.push_str(&String::from_utf8_lossy(&chunk));

      while let Some(newline) = buffer.find('\n') {
        let line = buffer[..newline].trim().to_string();
        buffer.drain(..=newline);
        if line.is_empty() {
          continue;
        }

        // Cancellation wins over whatever the upstream still says.
        if self.progress_of(&model).map(|p| p.status == DownloadStatus::Cancelled).unwrap_or(false) {
          if let Some(progress) = self.progress_of(&model) {
            let _ = tx.unbounded_send(progress.to_sse());
          }
          break 'outer;
        }

        let frame: PullFrame = match serde_json::from_str(&line) {
          Ok(frame) => frame,
          Err(_) => continue,
        };
        let progress = process_pull_frame(&frame, &model);
        self.store_progress(&model, progress.clone());
        let _ = tx.unbounded_send(progress.to_sse());

        if progress.status == DownloadStatus::Completed {
          log::info!("Successfully downloaded model {}", model);
          break 'outer;
        }
      }
    }

    self.invalidate_status_cache();
    self.cleanup_progress_later(model);
  }

  fn fail_download(&self, model: &str, tx: &UnboundedSender<String>, message: &str) {
    log::error!("Error downloading model {}: {}", model, message);
    let progress = DownloadProgress {
      status: DownloadStatus::Error,
      percentage: None,
      bytes_downloaded: None,
      total_bytes: None,
      phase: None,
      message: Some(message.to_string()),
    };
    self.store_progress(model, progress.clone());
    let _ = tx.unbounded_send(progress.to_sse());
    self.cleanup_progress_later(model.to_string());
  }

  fn cleanup_progress_later(&self, model: String) {
    let downloads = self.downloads.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_secs(1)).await;
      downloads.lock().unwrap_or_else(|p| p.into_inner()).remove(&model);
    });
  }

  /// Blocking pull without progress frames; returns success/failure.
  pub async fn download_model(&self, model_name: &str) -> (bool, String) {
    let mut rx = self.download_model_with_progress(model_name);
    let mut last_status = DownloadStatus::Starting;
    let mut last_message = None;
    while let Some(frame) = rx.next().await {
      if let Some(body) = frame.strip_prefix("data: ") {
        if let Ok(value) = serde_json::from_str::<Value>(body.trim()) {
          if let Some(status) = value.get("status").and_then(Value::as_str) {
            last_message =
              value.get("message").and_then(Value::as_str).map(String::from);
            last_status = match status {
              "completed" => DownloadStatus::Completed,
              "error" => DownloadStatus::Error,
              "cancelled" => DownloadStatus::Cancelled,
              "downloading" => DownloadStatus::Downloading,
              _ => DownloadStatus::Starting,
            };
          }
        }
      }
    }
    match last_status {
      DownloadStatus::Completed => {
        (true, format!("Model {} downloaded successfully", model_name))
      }
      _ => (
        false,
        last_message.unwrap_or_else(|| format!("Failed to download model {}", model_name)),
      ),
    }
  }

  /// Mark a download cancelled. The upstream pull may not support a hard
  /// abort; observers see `cancelled` regardless and the stream exits on
  /// its next frame.
  pub fn cancel_download(&self, model_name: &str) -> bool {
    let mut downloads = self.downloads.lock().unwrap_or_else(|p| p.into_inner());
    match downloads.get_mut(model_name) {
      Some(progress) => {
        progress.status = DownloadStatus::Cancelled;
        progress.message = Some(format!("Download of {} was cancelled", model_name));
        true
      }
      None => false,
    }
  }

  pub fn get_download_progress(&self, model_name: &str) -> Option<DownloadProgress> {
    self.progress_of(model_name)
  }

  pub fn get_all_download_progress(&self) -> HashMap<String, DownloadProgress> {
    self.downloads.lock().unwrap_or_else(|p| p.into_inner()).clone()
  }

  fn progress_of(&self, model: &str) -> Option<DownloadProgress> {
    self.downloads.lock().unwrap_or_else(|p| p.into_inner()).get(model).cloned()
  }

  fn store_progress(&self, model: &str, progress: DownloadProgress) {
    self
      .downloads
      .lock()
      .unwrap_or_else(|p| p.into_inner())
      .insert(model.to_string(), progress);
  }

  // ---------------------------------------------------------------------
  // Model management
  // ---------------------------------------------------------------------

  pub async fn delete_model(&self, model_name: &str) -> (bool, String) {
    self.invalidate_status_cache();
    let url = format!("{}/api/delete", self.base_url);
    let response = self.client.delete(&url).json(&json!({"name": model_name})).send().await;
    match response {
      Ok(response) if response.status().is_success() => {
        (true, format!("Model {} deleted successfully", model_name))
      }
      Ok(response) => (false, format!("Failed to delete model: {}", response.status())),
      Err(e) => (false, format!("Failed to delete model: {}", e)),
    }
  }

  /// The recommended list ships as a manifest next to the install; fall
  /// back to a small hardcoded set when it is missing.
  pub fn get_recommended_models(&self) -> Vec<Value> {
    let manifest = Self::models_manifest_path();
    if manifest.exists() {
      if let Ok(content) = std::fs::read_to_string(&manifest) {
        if let Ok(models) = serde_json::from_str::<Vec<Value>>(&content) {
          return models;
        }
      }
      log::warn!("Unreadable recommended-models manifest at {:?}", manifest);
    }
    fallback_recommended_models()
  }

  fn models_manifest_path() -> PathBuf {
    PathBuf::from("src/llm/ollama_models.json")
  }

  /// Locally downloaded models that are also in the catalog, formatted for
  /// the language-models endpoint.
  pub async fn get_available_models(&self) -> Vec<Value> {
    let status = self.check_status().await;
    if !status.running {
      return Vec::new();
    }
    get_ollama_models()
      .iter()
      .filter(|model| status.available_models.contains(&model.model_name))
      .map(|model| {
        json!({
          "display_name": model.display_name,
          "model_name": model.model_name,
          "provider": "Ollama",
        })
      })
      .collect()
  }
}

impl Default for OllamaManager {
  fn default() -> Self {
    OllamaManager::new()
  }
}

/// Translate one upstream pull frame into our progress record. Completion
/// is declared on `status == "success"` or `completed == total`.
pub fn process_pull_frame(frame: &PullFrame, model: &str) -> DownloadProgress {
  let done_by_bytes = match (frame.completed, frame.total) {
    (Some(completed), Some(total)) if total > 0 => completed == total,
    _ => false,
  };

  if frame.status == "success" || done_by_bytes {
    return DownloadProgress {
      status: DownloadStatus::Completed,
      percentage: Some(100.0),
      bytes_downloaded: frame.completed,
      total_bytes: frame.total,
      phase: None,
      message: Some(format!("Model {} downloaded successfully!", model)),
    };
  }

  let percentage = match (frame.completed, frame.total) {
    (Some(completed), Some(total)) if total > 0 => {
      Some((completed as f64 / total as f64) * 100.0)
    }
    _ => None,
  };

  DownloadProgress {
    status: DownloadStatus::Downloading,
    percentage,
    bytes_downloaded: frame.completed,
    total_bytes: frame.total,
    phase: frame.digest.clone().or_else(|| Some(frame.status.clone())),
    message: Some(frame.status.clone()),
  }
}

fn fallback_recommended_models() -> Vec<Value> {
  vec![
    json!({"display_name": "[meta] llama3.1 (8B)", "model_name": "llama3.1:latest", "provider": "Ollama"}),
    json!({"display_name": "[google] gemma3 (4B)", "model_name": "gemma3:4b", "provider": "Ollama"}),
    json!({"display_name": "[alibaba] qwen3 (4B)", "model_name": "qwen3:4b", "provider": "Ollama"}),
  ]
}
