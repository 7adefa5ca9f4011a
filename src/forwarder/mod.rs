pub mod tcp_accessor;
pub mod tcp_exposer;
pub mod throttle;
pub mod udp_accessor;
pub mod udp_exposer;

use std::sync::Arc;

use crate::config::{Config, Protocol, Role};
use crate::mux::MuxSession;
use crate::shutdown::ShutdownSignal;
use crate::supervisor::Supervisor;

/// Installs the forwarder(s) matching `config.role` and the negotiated
/// `protocol` over an established mux session (spec.md §2 "Data flow").
pub async fn install(
    role: Role,
    protocol: Protocol,
    mux: Arc<MuxSession>,
    config: Arc<Config>,
    supervisor: Arc<Supervisor>,
    shutdown: ShutdownSignal,
) {
    match (role, protocol) {
        (Role::Exposer, Protocol::Tcp) => tcp_exposer::run(mux, config, supervisor, shutdown).await,
        (Role::Exposer, Protocol::Udp) => udp_exposer::run(mux, config, supervisor, shutdown).await,
        (Role::Exposer, Protocol::Both) => {
            let tcp = tcp_exposer::run(mux.clone(), config.clone(), supervisor.clone(), shutdown.clone());
            let udp = udp_exposer::run(mux, config, supervisor, shutdown);
            tokio::join!(tcp, udp);
        }
        (Role::Accessor, Protocol::Tcp) => tcp_accessor::run(mux, config, supervisor, shutdown).await,
        (Role::Accessor, Protocol::Udp) => udp_accessor::run(mux, config, supervisor, shutdown).await,
        (Role::Accessor, Protocol::Both) => {
            unreachable!("Config::validate forbids accessor + protocol=both")
        }
    }
}
