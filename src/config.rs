use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    pub redis_url: String,
    /// Shared secret for producer bearer tokens and room session cookies.
    pub control_token_secret: String,
    pub default_cols: u16,
    pub default_rows: u16,
    pub session_max_age: Duration,
    pub producer_reconnect: Duration,
    pub viewer_setup_timeout: Duration,
    pub spawn_timeout: Duration,
    pub max_frame_bytes: usize,
    pub send_queue_depth: usize,
    pub closed_ring_capacity: usize,
    pub sweep_interval: Duration,
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            listen_host: env::var("BOARDWALK_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            listen_port: env::var("BOARDWALK_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            control_token_secret: env::var("BOARDWALK_CONTROL_SECRET").unwrap_or_default(),
            default_cols: env_u64("BOARDWALK_DEFAULT_COLS", 80) as u16,
            default_rows: env_u64("BOARDWALK_DEFAULT_ROWS", 24) as u16,
            session_max_age: Duration::from_secs(env_u64("BOARDWALK_SESSION_MAX_AGE", 3600)),
            producer_reconnect: Duration::from_secs(env_u64("BOARDWALK_PRODUCER_RECONNECT", 30)),
            viewer_setup_timeout: Duration::from_secs(env_u64("BOARDWALK_SETUP_TIMEOUT", 10)),
            spawn_timeout: Duration::from_secs(env_u64("BOARDWALK_SPAWN_TIMEOUT", 10)),
            max_frame_bytes: env_u64("BOARDWALK_MAX_FRAME", 1024 * 1024) as usize,
            send_queue_depth: env_u64("BOARDWALK_SEND_QUEUE_DEPTH", 256) as usize,
            closed_ring_capacity: env_u64("BOARDWALK_CLOSED_RING", 50) as usize,
            sweep_interval: Duration::from_secs(env_u64("BOARDWALK_SWEEP_INTERVAL", 60)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 8080,
            redis_url: "redis://localhost:6379".to_string(),
            control_token_secret: String::new(),
            default_cols: 80,
            default_rows: 24,
            session_max_age: Duration::from_secs(3600),
            producer_reconnect: Duration::from_secs(30),
            viewer_setup_timeout: Duration::from_secs(10),
            spawn_timeout: Duration::from_secs(10),
            max_frame_bytes: 1024 * 1024,
            send_queue_depth: 256,
            closed_ring_capacity: 50,
            sweep_interval: Duration::from_secs(60),
        }
    }
}
