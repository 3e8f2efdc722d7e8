use std::env;
use std::time::Duration;
#[cfg(test)]
use std::sync::Mutex;

use crate::orchestrator::MeshConfig;
use crate::signaling::ParticipantId;

pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:8000";

/// Settings read from the environment (and `.env`, loaded by the binary).
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP base of the relay server.
    pub api_base: String,
    /// Base the signaling websocket url is derived from; defaults to `api_base`.
    pub signaling_base: String,
    pub token: Option<String>,
    pub participant_id: Option<ParticipantId>,
    /// Comma-separated ice server urls. When absent the server is asked.
    pub ice_servers: Option<String>,
    pub mesh: MeshConfig,
}

impl Config {
    pub fn from_env() -> Self {
        let api_base = non_empty("MESHCALL_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        // Prefer IPv4 over a `::1` resolution of localhost.
        let api_base = api_base.replacen("://localhost", "://127.0.0.1", 1);
        let signaling_base = non_empty("MESHCALL_SIGNALING_BASE").unwrap_or_else(|| api_base.clone());

        let mut mesh = MeshConfig::default();
        if let Some(secs) = parsed::<u64>("MESHCALL_NEGOTIATION_TIMEOUT_SECS").filter(|secs| *secs > 0) {
            mesh.negotiation_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = parsed::<u32>("MESHCALL_MAX_RETRIES") {
            mesh.max_connection_retries = retries;
        }

        Self {
            api_base,
            signaling_base,
            token: non_empty("MESHCALL_TOKEN"),
            participant_id: parsed::<ParticipantId>("MESHCALL_PARTICIPANT_ID"),
            ice_servers: non_empty("MESHCALL_ICE_SERVERS"),
            mesh,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            signaling_base: DEFAULT_API_BASE.to_string(),
            token: None,
            participant_id: None,
            ice_servers: None,
            mesh: MeshConfig::default(),
        }
    }
}

fn non_empty(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parsed<T: std::str::FromStr>(var: &str) -> Option<T> {
    let raw = non_empty(var)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(%var, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}
