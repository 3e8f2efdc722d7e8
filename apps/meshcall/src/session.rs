use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::MeshResult;
use crate::media::{MediaCapture, MeshView};
use crate::orchestrator::{MeshConfig, MeshOrchestrator, SessionEnd};
use crate::peer::{PeerConnector, RtcConnector};
use crate::rtc_config::NetworkConfigProvider;
use crate::signaling::{
    Credentials, InboundEvent, ParticipantId, SignalSink, SignalingClient, SignalingConfig,
};

#[derive(Debug, Clone)]
pub struct SessionParams {
    pub signaling_base: String,
    pub room: String,
    pub credentials: Credentials,
    pub local_id: ParticipantId,
    pub mesh: MeshConfig,
    pub signaling: SignalingConfig,
}

/// Asks a running session to leave the room. Cloneable; the first call wins.
#[derive(Clone, Debug)]
pub struct LeaveHandle {
    tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl LeaveHandle {
    pub fn leave(&self) -> bool {
        match self.tx.lock().take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

/// Everything that lives for one room: the relay connection, the local
/// media and the orchestrator that owns every peer connection.
pub struct MeshSession {
    client: Arc<SignalingClient>,
    orchestrator: MeshOrchestrator,
    inbound: mpsc::UnboundedReceiver<InboundEvent>,
    leave_rx: oneshot::Receiver<()>,
    leave: LeaveHandle,
}

impl MeshSession {
    /// Joins with `webrtc` peer connections configured from `network`.
    pub async fn join(
        params: SessionParams,
        network: &dyn NetworkConfigProvider,
        capture: &dyn MediaCapture,
        view: Arc<dyn MeshView>,
    ) -> MeshResult<Self> {
        let ice_servers = network.ice_servers().await?;
        let connector = Arc::new(RtcConnector::new(&ice_servers)?);
        Self::join_with_connector(params, connector, capture, view).await
    }

    pub async fn join_with_connector(
        params: SessionParams,
        connector: Arc<dyn PeerConnector>,
        capture: &dyn MediaCapture,
        view: Arc<dyn MeshView>,
    ) -> MeshResult<Self> {
        let media = capture.capture().await?;
        let (client, inbound) = SignalingClient::connect(
            &params.signaling_base,
            &params.room,
            &params.credentials,
            &params.signaling,
        )
        .await?;
        tracing::info!(
            room = %params.room,
            local = %params.local_id,
            tracks = media.len(),
            "joined room"
        );

        let sink: Arc<dyn SignalSink> = client.clone();
        let orchestrator =
            MeshOrchestrator::new(params.local_id, connector, media, sink, view, params.mesh);
        let (leave_tx, leave_rx) = oneshot::channel();
        Ok(Self {
            client,
            orchestrator,
            inbound,
            leave_rx,
            leave: LeaveHandle {
                tx: Arc::new(Mutex::new(Some(leave_tx))),
            },
        })
    }

    pub fn leave_handle(&self) -> LeaveHandle {
        self.leave.clone()
    }

    pub fn room(&self) -> &str {
        self.client.room()
    }

    /// Runs the mesh until the user leaves or the relay goes away. Every peer
    /// connection and the relay connection are closed on return.
    pub async fn run(self) -> SessionEnd {
        let MeshSession {
            client,
            orchestrator,
            inbound,
            leave_rx,
            leave: _leave,
        } = self;
        let end = orchestrator.run(inbound, leave_rx).await;
        client.close();
        tracing::info!(room = %client.room(), ?end, "session ended");
        end
    }
}
