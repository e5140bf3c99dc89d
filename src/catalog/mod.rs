mod client;
mod types;

pub use client::CatalogClient;
pub use types::{ApiResponse, Category, Pagination, ReviewDraft, Tag, Tool, ToolClick};
