//! The validated configuration record the core consumes. Parsing raw
//! sources (CLI flags, environment variables, credential files) is out of
//! scope for this crate; the binary crate builds one of these and hands
//! it in by reference.

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub upstream_base_url: String,
    pub auto_rotate_allowed: bool,
    pub rotation_cooldown_seconds: i64,
    pub retry_max: u32,
    pub retry_base_ms: u64,
    pub max_rps: i64,
    pub max_rpm: i64,
    pub max_rps_per_key: i64,
    pub max_rpm_per_key: i64,
    pub dry_run: bool,
    pub proxy_token: String,
    pub require_usage_before_request: bool,
    pub fail_open_on_empty_cache: bool,
    pub usage_cache_seconds: i64,
    pub payment_block_seconds: i64,
    pub blocklist_recheck_seconds: i64,
    pub blocklist_recheck_max: usize,
    pub trace_max_bytes: u64,
    pub trace_max_backups: u32,
    pub time_zone: String,
    pub extra_payment_tokens: Vec<String>,
    pub prefer_next_on_tie: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            upstream_base_url: String::new(),
            auto_rotate_allowed: true,
            rotation_cooldown_seconds: 300,
            retry_max: 2,
            retry_base_ms: 500,
            max_rps: 0,
            max_rpm: 0,
            max_rps_per_key: 0,
            max_rpm_per_key: 0,
            dry_run: false,
            proxy_token: String::new(),
            require_usage_before_request: false,
            fail_open_on_empty_cache: true,
            usage_cache_seconds: 300,
            payment_block_seconds: 3600,
            blocklist_recheck_seconds: 600,
            blocklist_recheck_max: 3,
            trace_max_bytes: 10 * 1024 * 1024,
            trace_max_backups: 5,
            time_zone: "UTC".to_string(),
            extra_payment_tokens: Vec::new(),
            prefer_next_on_tie: false,
        }
    }
}
