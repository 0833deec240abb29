//! UDP Tunnel Warden library
//!
//! Supervises a set of udp2raw tunnel processes: builds their command
//! lines from a configuration snapshot, keeps their lifecycle observable,
//! streams their output into a bounded log, and reconciles leftover
//! iptables state between runs.

pub mod command;
pub mod config;
pub mod error;
pub mod firewall;
pub mod log_sink;
pub mod platform;
pub mod pump;
pub mod signal;
pub mod supervisor;

// Re-export commonly used types for convenience
pub use command::{build_tunnel_args, log_level_ordinal};
pub use config::{ConfigSnapshot, ExtraArgs, GlobalSpec, InstanceSpec, Role, TUNNEL_BIN};
pub use error::WardenError;
pub use firewall::{FirewallReconciler, FIREWALL_TAG};
pub use log_sink::{LogRecord, LogSink, SYSTEM_SOURCE};
pub use supervisor::{SupervisorOptions, TunnelStatus, TunnelSupervisor};
