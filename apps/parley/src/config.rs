//! Client configuration from the environment.

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP base of the relay, e.g. `http://127.0.0.1:3000`.
    pub relay_url: String,
    pub stun_server: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            relay_url: std::env::var("PARLEY_RELAY_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:3000".to_string()),
            stun_server: std::env::var("PARLEY_STUN_SERVER")
                .unwrap_or_else(|_| "stun:stun.l.google.com:19302".to_string()),
        }
    }

    /// The relay's signaling endpoint, derived from the HTTP base.
    pub fn signaling_url(&self) -> String {
        let ws_base = if let Some(rest) = self.relay_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.relay_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.relay_url.clone()
        };
        format!("{}/ws", ws_base.trim_end_matches('/'))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
