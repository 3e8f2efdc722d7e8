use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use url::Url;

use crate::error::{MeshError, MeshResult};
use crate::rtc_config::{IceServer, NetworkConfigProvider, RtcConfigResponse};
use crate::signaling::{Credentials, ParticipantId};

const LOG_TARGET: &str = "meshcall::api";

#[derive(Debug, Clone, Deserialize)]
pub struct Me {
    pub id: ParticipantId,
    #[serde(default)]
    pub email: Option<String>,
}

/// HTTP side of the relay server: identity and network configuration.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base: Url,
    http: Client,
}

impl ApiClient {
    pub fn new(base: &str) -> MeshResult<Self> {
        let mut base = Url::parse(base)
            .map_err(|err| MeshError::Setup(format!("invalid api base {base}: {err}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            base,
            http: Client::new(),
        })
    }

    fn endpoint(&self, suffix: &str) -> MeshResult<Url> {
        self.base
            .join(suffix)
            .map_err(|err| MeshError::Setup(format!("invalid endpoint {suffix}: {err}")))
    }

    /// `GET /rtc/config`.
    pub async fn rtc_config(&self) -> MeshResult<RtcConfigResponse> {
        let url = self.endpoint("rtc/config")?;
        tracing::debug!(target: LOG_TARGET, %url, "fetching rtc config");
        let response = self.http.get(url).send().await?;
        match response.status() {
            StatusCode::OK => Ok(response.json::<RtcConfigResponse>().await?),
            status => Err(MeshError::Setup(format!(
                "rtc config request returned {status}"
            ))),
        }
    }

    /// `GET /me` with the bearer token; resolves our participant id.
    pub async fn me(&self, credentials: &Credentials) -> MeshResult<Me> {
        let url = self.endpoint("me")?;
        let response = self
            .http
            .get(url)
            .bearer_auth(credentials.as_str())
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => Ok(response.json::<Me>().await?),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(MeshError::Setup("token rejected by the server".into()))
            }
            status => Err(MeshError::Setup(format!("identity request returned {status}"))),
        }
    }

    /// `POST /rooms/{room}/join`: records membership before the signaling
    /// socket is opened.
    pub async fn join_room(&self, room: &str, credentials: &Credentials) -> MeshResult<()> {
        let url = self.room_endpoint(room, "join")?;
        tracing::debug!(target: LOG_TARGET, %url, "registering room membership");
        let response = self
            .http
            .post(url)
            .bearer_auth(credentials.as_str())
            .json(&serde_json::json!({}))
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(MeshError::Setup(format!("room {room} not found"))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(MeshError::Setup("token rejected by the server".into()))
            }
            status => Err(MeshError::Setup(format!("room join returned {status}"))),
        }
    }

    /// `rooms/{room}/{action}` with the room id escaped as one path segment.
    fn room_endpoint(&self, room: &str, action: &str) -> MeshResult<Url> {
        if room.trim().is_empty() {
            return Err(MeshError::Setup("room id must not be empty".into()));
        }
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| MeshError::Setup(format!("api base {} cannot hold a path", self.base)))?
            .pop_if_empty()
            .extend(["rooms", room, action]);
        Ok(url)
    }
}

#[async_trait]
impl NetworkConfigProvider for ApiClient {
    async fn ice_servers(&self) -> MeshResult<Vec<IceServer>> {
        let servers = self.rtc_config().await?.ice_servers;
        tracing::debug!(target: LOG_TARGET, count = servers.len(), "ice servers");
        Ok(servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_keep_base_path() {
        let api = ApiClient::new("http://127.0.0.1:8000/api").unwrap();
        assert_eq!(
            api.endpoint("rtc/config").unwrap().as_str(),
            "http://127.0.0.1:8000/api/rtc/config"
        );
        let api = ApiClient::new("http://127.0.0.1:8000").unwrap();
        assert_eq!(api.endpoint("me").unwrap().as_str(), "http://127.0.0.1:8000/me");
    }

    #[test]
    fn me_accepts_numeric_ids() {
        let me: Me = serde_json::from_str(r#"{"id":12,"email":"a@b.c","created_at":"x"}"#).unwrap();
        assert_eq!(me.id, ParticipantId::from(12));
    }

    #[test]
    fn room_endpoint_escapes_the_room_id() {
        let api = ApiClient::new("http://127.0.0.1:8000/api").unwrap();
        assert_eq!(
            api.room_endpoint("standup", "join").unwrap().as_str(),
            "http://127.0.0.1:8000/api/rooms/standup/join"
        );
        assert_eq!(
            api.room_endpoint("a/b c", "join").unwrap().as_str(),
            "http://127.0.0.1:8000/api/rooms/a%2Fb%20c/join"
        );
        assert!(api.room_endpoint(" ", "join").is_err());
    }

    #[test]
    fn rejects_bad_base() {
        assert!(ApiClient::new("::nope").is_err());
    }
}
