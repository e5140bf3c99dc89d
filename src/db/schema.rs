/// Schema for the persistent tier: a flat string key-value table shared by
/// every namespace that lives in the same file.
pub const PERSISTENT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Schema for the bulk tier: one object store keyed by cache key. `record`
/// holds `{"key": ..., "value": <CacheEntry>}` as JSON.
pub const BULK_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache (
    key TEXT PRIMARY KEY,
    record TEXT NOT NULL
);
"#;
