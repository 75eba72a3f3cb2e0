use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub users_file: String,
    pub session_ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PARLEY_RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            users_file: env::var("PARLEY_USERS_FILE").unwrap_or_else(|_| "users.json".to_string()),
            session_ttl_seconds: env::var("PARLEY_SESSION_TTL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(86_400), // 24 hours
            sweep_interval_seconds: env::var("PARLEY_SWEEP_INTERVAL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(3_600), // hourly
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            users_file: "users.json".to_string(),
            session_ttl_seconds: 86_400,
            sweep_interval_seconds: 3_600,
        }
    }
}
