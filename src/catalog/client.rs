//! Catalog client routed through the offline layer.

use color_eyre::{eyre::eyre, Result};
use url::form_urlencoded;

use super::types::{ApiResponse, Category, ReviewDraft, Tool, ToolClick};
use crate::net::RequestOptions;
use crate::offline::{OfflineManager, RequestKind};

const SUGGESTION_LIMIT: u32 = 5;
const MIN_SUGGESTION_QUERY: usize = 2;

/// Catalog API client.
///
/// Reads go through `smart_fetch` so they keep working from cache while
/// offline; writes are queued until they can be delivered.
#[derive(Clone)]
pub struct CatalogClient {
  offline: OfflineManager,
}

impl CatalogClient {
  pub fn new(offline: OfflineManager) -> Self {
    Self { offline }
  }

  pub fn offline(&self) -> &OfflineManager {
    &self.offline
  }

  /// All categories.
  pub async fn categories(&self) -> Result<Vec<Category>> {
    self.read("/api/categories").await
  }

  /// First `limit` tools.
  pub async fn tools(&self, limit: u32) -> Result<Vec<Tool>> {
    self.read(&format!("/api/tools?limit={}", limit)).await
  }

  /// Search suggestions for `query`. Short queries and failures yield an
  /// empty list.
  pub async fn search_suggestions(&self, query: &str) -> Vec<String> {
    if query.chars().count() < MIN_SUGGESTION_QUERY {
      return Vec::new();
    }

    let params = form_urlencoded::Serializer::new(String::new())
      .append_pair("q", query)
      .append_pair("limit", &SUGGESTION_LIMIT.to_string())
      .finish();
    let url = format!("/api/search/suggestions?{}", params);

    self
      .offline
      .smart_fetch::<ApiResponse<Vec<String>>>(&url, RequestOptions::get())
      .await
      .map(|response| response.data)
      .unwrap_or_default()
  }

  /// Post a review. Returns false when it was queued for later delivery.
  pub async fn submit_review(&self, review: &ReviewDraft) -> Result<bool> {
    if !(1..=5).contains(&review.rating) {
      return Err(eyre!("Rating must be between 1 and 5, got {}", review.rating));
    }

    let body = serde_json::to_value(review).map_err(|e| eyre!("Failed to encode review: {}", e))?;
    let url = format!("/api/tools/{}/reviews", review.tool_id);

    Ok(
      self
        .offline
        .send_or_queue(&url, RequestOptions::post(body), RequestKind::UserAction)
        .await,
    )
  }

  /// Queue a click event; the sync loop delivers it.
  pub async fn record_tool_click(&self, click: &ToolClick) -> Result<()> {
    let body = serde_json::to_value(click).map_err(|e| eyre!("Failed to encode click: {}", e))?;
    self
      .offline
      .queue_request("/api/analytics/click", RequestOptions::post(body), RequestKind::Analytics)
      .await;
    Ok(())
  }

  async fn read<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
    self
      .offline
      .smart_fetch::<ApiResponse<T>>(url, RequestOptions::get())
      .await
      .map(|response| response.data)
      .ok_or_else(|| eyre!("{} is unavailable and not cached", url))
  }
}
