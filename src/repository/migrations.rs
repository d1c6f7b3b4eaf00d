//! Idempotent schema statements for the relational backend.

/// Telemetry table: one row per direction of each proxied exchange.
pub const CREATE_HTTP_LOG_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS http_log (
    id UUID PRIMARY KEY,
    trace_id UUID NOT NULL,
    process_type VARCHAR(10) NOT NULL,
    timestamp TIMESTAMP WITH TIME ZONE NOT NULL,
    method VARCHAR(10),
    url TEXT,
    path TEXT,
    path_params JSONB,
    query_params JSONB,
    headers JSONB,
    body BYTEA,
    client_ip VARCHAR(45),
    user_agent TEXT,
    status_code INTEGER,
    response_time_ms BIGINT,
    content_length BIGINT,
    error TEXT,
    metadata JSONB
)
"#;

pub const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_http_log_trace_id ON http_log(trace_id)",
    "CREATE INDEX IF NOT EXISTS idx_http_log_process_type ON http_log(process_type)",
    "CREATE INDEX IF NOT EXISTS idx_http_log_trace_process ON http_log(trace_id, process_type)",
    "CREATE INDEX IF NOT EXISTS idx_http_log_timestamp ON http_log(timestamp)",
];
