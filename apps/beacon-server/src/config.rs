/// Hub configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP/WebSocket server binds to.
    pub port: u16,
    /// PostgreSQL connection string. When unset the hub runs on in-memory stores.
    pub database_url: Option<String>,
    /// HMAC secret used to sign session tokens.
    pub token_secret: String,
    /// Session token lifetime in seconds, capped at ten years.
    pub token_ttl_secs: i64,
    /// Number of messages sent to a connection right after it authenticates.
    pub history_limit: usize,
    pub min_username_length: usize,
    pub min_password_length: usize,
    /// Per-connection outbound queue capacity. A peer whose queue is full
    /// misses fan-out events instead of stalling the broadcast.
    pub outbound_buffer: usize,
    /// Room every broadcast is filed under.
    pub default_room: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        Self {
            port: parsed_var("PORT", 8765),
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            token_secret: required_var("TOKEN_SECRET"),
            token_ttl_secs: parsed_var("TOKEN_TTL_SECS", 24 * 3600),
            history_limit: parsed_var("HISTORY_LIMIT", 50),
            min_username_length: parsed_var("MIN_USERNAME_LENGTH", 3),
            min_password_length: parsed_var("MIN_PASSWORD_LENGTH", 6),
            outbound_buffer: parsed_var("OUTBOUND_BUFFER", 256).max(1),
            default_room: std::env::var("DEFAULT_ROOM")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "general".to_string()),
        }
    }

    /// A configuration suitable for tests and local runs without a database.
    pub fn in_memory(token_secret: impl Into<String>) -> Self {
        Self {
            port: 0,
            database_url: None,
            token_secret: token_secret.into(),
            token_ttl_secs: 3600,
            history_limit: 50,
            min_username_length: 3,
            min_password_length: 6,
            outbound_buffer: 256,
            default_room: "general".to_string(),
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
