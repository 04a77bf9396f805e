//! Supervision of a single Minecraft server process: detached launch,
//! runtime-pid resolution, readiness probing over RCON, resource
//! sampling, and lifecycle control. The web layer sits on top of the
//! [`Supervisor`] handle; everything here is transport-agnostic.

pub mod launcher;
pub mod monitor;
pub mod rcon_codec;
pub mod rcon_session;
pub mod server_properties;
pub mod supervisor;

mod support;

pub use hearth_process::{
    Ack, LaunchId, LaunchSpec, ProcessHandle, RconEndpoint, RconError, ResourceSample,
    StatusSnapshot, SupervisorError, SupervisorState,
};
pub use monitor::RuntimeSignature;
pub use rcon_session::RconSession;
pub use server_properties::ServerProperties;
pub use supervisor::{RconSource, Supervisor, SupervisorConfig};

/// Installs the global tracing subscriber. `RUST_LOG` controls the
/// filter; embedding processes call this once at startup.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}
