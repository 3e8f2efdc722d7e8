use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{MeshError, MeshResult};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
const ICE_SCHEMES: &[&str] = &["stun:", "stuns:", "turn:", "turns:"];

/// One STUN/TURN server as the relay describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// The relay sends a single string or a list.
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Urls {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Urls::deserialize(deserializer)? {
        Urls::One(url) => vec![url],
        Urls::Many(urls) => urls,
    })
}

/// Body of `GET /rtc/config`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcConfigResponse {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

/// Supplies relay/reflection servers for new peer connections.
#[async_trait]
pub trait NetworkConfigProvider: Send + Sync {
    async fn ice_servers(&self) -> MeshResult<Vec<IceServer>>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticIceServers {
    servers: Vec<IceServer>,
}

impl StaticIceServers {
    pub fn new(servers: Vec<IceServer>) -> Self {
        Self { servers }
    }

    /// Comma-separated STUN urls, e.g. `stun:a:3478,stun:b:3478`.
    pub fn from_urls(list: &str) -> MeshResult<Self> {
        let mut servers = Vec::new();
        for url in list.split(',').map(str::trim).filter(|url| !url.is_empty()) {
            if !ICE_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
                return Err(MeshError::Setup(format!("not an ice server url: {url}")));
            }
            servers.push(IceServer::stun(url));
        }
        Ok(Self { servers })
    }
}

#[async_trait]
impl NetworkConfigProvider for StaticIceServers {
    async fn ice_servers(&self) -> MeshResult<Vec<IceServer>> {
        Ok(self.servers.clone())
    }
}
