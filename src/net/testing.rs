//! In-process [`Transport`] for tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::transport::{OutboundRequest, Transport};

enum Route {
  Respond(Value),
  Fail,
}

/// Records every request and answers from a per-URL script.
///
/// Unscripted URLs answer `{"ok": true}`. While unreachable, every send fails
/// and every probe reports down.
pub struct ScriptedTransport {
  routes: Mutex<HashMap<String, Route>>,
  reachable: AtomicBool,
  requests: Mutex<Vec<OutboundRequest>>,
  probes: Mutex<Vec<String>>,
}

impl ScriptedTransport {
  pub fn new() -> Self {
    Self {
      routes: Mutex::new(HashMap::new()),
      reachable: AtomicBool::new(true),
      requests: Mutex::new(Vec::new()),
      probes: Mutex::new(Vec::new()),
    }
  }

  pub fn respond(&self, url: &str, body: Value) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), Route::Respond(body));
  }

  pub fn fail(&self, url: &str) {
    self.routes.lock().unwrap().insert(url.to_string(), Route::Fail);
  }

  pub fn set_reachable(&self, reachable: bool) {
    self.reachable.store(reachable, Ordering::SeqCst);
  }

  pub fn requests(&self) -> Vec<OutboundRequest> {
    self.requests.lock().unwrap().clone()
  }

  pub fn request_urls(&self) -> Vec<String> {
    self.requests().into_iter().map(|r| r.url).collect()
  }

  pub fn probes(&self) -> Vec<String> {
    self.probes.lock().unwrap().clone()
  }
}

#[async_trait]
impl Transport for ScriptedTransport {
  async fn send(&self, request: &OutboundRequest) -> Result<Value> {
    self.requests.lock().unwrap().push(request.clone());

    if !self.reachable.load(Ordering::SeqCst) {
      return Err(eyre!("connection refused"));
    }

    match self.routes.lock().unwrap().get(&request.url) {
      Some(Route::Respond(body)) => Ok(body.clone()),
      Some(Route::Fail) => Err(eyre!("HTTP 500 for {} {}", request.method, request.url)),
      None => Ok(json!({"ok": true})),
    }
  }

  async fn probe(&self, url: &str) -> bool {
    self.probes.lock().unwrap().push(url.to_string());
    self.reachable.load(Ordering::SeqCst)
  }
}
