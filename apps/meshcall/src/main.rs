use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use meshcall_core::api::ApiClient;
use meshcall_core::config::Config;
use meshcall_core::media::{SilentCapture, TracingView};
use meshcall_core::rtc_config::{NetworkConfigProvider, StaticIceServers};
use meshcall_core::signaling::{Credentials, SignalingConfig};
use meshcall_core::telemetry::logging::{self, LogConfig, LogLevel};
use meshcall_core::{MeshSession, ParticipantId, SessionEnd, SessionParams};

#[derive(Parser, Debug)]
#[command(name = "meshcall", about = "Join a meshcall room as a headless participant")]
struct Cli {
    /// Room id (the slug in the room url)
    #[arg(long, short = 'r')]
    room: String,

    /// Access token; falls back to MESHCALL_TOKEN
    #[arg(long)]
    token: Option<String>,

    #[arg(long, help = "HTTP base of the server (default MESHCALL_API_BASE)")]
    api_base: Option<String>,

    #[arg(long, help = "Our participant id; asked from /me when omitted")]
    participant_id: Option<ParticipantId>,

    #[arg(long = "ice-server", help = "STUN/TURN url; repeatable, skips /rtc/config")]
    ice_servers: Vec<String>,

    #[arg(long, help = "Do not POST /rooms/{room}/join before connecting")]
    skip_room_join: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[arg(long, help = "Append logs to this file instead of stderr")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })
    .context("initialize logging")?;

    let mut config = Config::from_env();
    if let Some(api_base) = cli.api_base {
        config.signaling_base = api_base.clone();
        config.api_base = api_base;
    }
    let Some(token) = cli.token.or_else(|| config.token.clone()) else {
        bail!("an access token is required (--token or MESHCALL_TOKEN)");
    };
    let credentials = Credentials::token(token);
    let api = ApiClient::new(&config.api_base)?;

    let local_id = match cli.participant_id.or_else(|| config.participant_id.clone()) {
        Some(id) => id,
        None => api.me(&credentials).await.context("resolve participant id")?.id,
    };

    let static_servers = if !cli.ice_servers.is_empty() {
        Some(StaticIceServers::from_urls(&cli.ice_servers.join(","))?)
    } else {
        config
            .ice_servers
            .as_deref()
            .map(StaticIceServers::from_urls)
            .transpose()?
    };
    let network: &dyn NetworkConfigProvider = match &static_servers {
        Some(servers) => servers,
        None => &api,
    };

    if !cli.skip_room_join {
        api.join_room(&cli.room, &credentials)
            .await
            .context("register room membership")?;
    }

    let params = SessionParams {
        signaling_base: config.signaling_base.clone(),
        room: cli.room,
        credentials,
        local_id,
        mesh: config.mesh.clone(),
        signaling: SignalingConfig::default(),
    };
    let session = MeshSession::join(
        params,
        network,
        &SilentCapture::default(),
        Arc::new(TracingView),
    )
    .await
    .context("join room")?;

    let leave = session.leave_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            leave.leave();
        }
    });

    match session.run().await {
        SessionEnd::Left => Ok(()),
        SessionEnd::ChannelLost => bail!("lost connection to the signaling server"),
    }
}
