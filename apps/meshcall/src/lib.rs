pub mod api;
pub mod config;
pub mod error;
pub mod media;
pub mod mock;
pub mod negotiation;
pub mod orchestrator;
pub mod peer;
pub mod registry;
pub mod rtc_config;
pub mod session;
pub mod signaling;
pub mod telemetry;

pub use error::{MeshError, MeshResult};
pub use orchestrator::{MeshConfig, MeshOrchestrator, SessionEnd};
pub use session::{LeaveHandle, MeshSession, SessionParams};
pub use signaling::ParticipantId;
