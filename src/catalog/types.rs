use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Envelope every catalog endpoint answers with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
  pub data: T,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pagination: Option<Pagination>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
  pub page: u32,
  pub limit: u32,
  pub total: u64,
  pub has_more: bool,
}

/// Tool category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
  pub id: String,
  pub name: String,
  pub slug: String,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub icon: String,
  #[serde(default)]
  pub color: String,
  #[serde(default)]
  pub tool_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
  pub id: String,
  pub name: String,
}

/// Catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
  pub id: String,
  pub name: String,
  pub slug: String,
  #[serde(default)]
  pub description: String,
  pub url: String,
  #[serde(default)]
  pub category_id: Option<String>,
  #[serde(default)]
  pub tags: Vec<Tag>,
  #[serde(default)]
  pub rating: f64,
  #[serde(default)]
  pub usage_count: u64,
  #[serde(default)]
  pub is_featured: bool,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
}

/// Review submitted for a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewDraft {
  pub tool_id: String,
  pub rating: u8, // 1..=5
  pub comment: Option<String>,
}

/// Click-through analytics event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolClick {
  pub tool_id: String,
  pub source: String,
  pub clicked_at: DateTime<Utc>,
}
