//! Configuration snapshot consumed by the supervisor.
//!
//! The snapshot is owned by the external configuration collaborator; this
//! module only defines its shape and a thin JSON loader for the binary.
//! Field names and defaults match the on-disk `udp-tunnel.json` schema, so
//! absent fields deserialize to the same values older configs were written
//! with.

use crate::error::WardenError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Name of the external tunnel binary, resolved through PATH at spawn time.
pub const TUNNEL_BIN: &str = "udp2raw";

/// Whether an instance binds as the public-facing endpoint (server) or the
/// local-facing endpoint (client).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Server => "server",
            Role::Client => "client",
        }
    }

    /// udp2raw mode selector.
    pub fn mode_flag(&self) -> &'static str {
        match self {
            Role::Server => "-s",
            Role::Client => "-c",
        }
    }
}

/// Settings shared read-only across all instances in one start cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSpec {
    pub enabled: bool,
    pub log_level: String,
    pub wait_lock: bool,
    pub retry_on_error: bool,
}

impl Default for GlobalSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            log_level: "info".to_string(),
            wait_lock: true,
            retry_on_error: true,
        }
    }
}

/// One tunnel endpoint definition. A single shape covers both roles; the
/// command builder picks the endpoint fields that apply to the instance's
/// role and ignores the rest. Immutable once handed to the supervisor for
/// a start cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceSpec {
    pub enabled: bool,
    /// Display name. Stable per config entry but not guaranteed unique.
    pub alias: String,

    // Server endpoints: listen on WAN, forward to the local service.
    pub listen_ip: String,
    pub listen_port: u16,
    pub forward_ip: String,
    pub forward_port: u16,

    // Client endpoints: listen locally, forward to the remote server.
    pub local_ip: String,
    pub local_port: u16,
    pub server_ip: String,
    pub server_port: u16,

    pub password: String,
    pub raw_mode: String,
    pub cipher_mode: String,
    pub auth_mode: String,
    /// Let udp2raw insert its own iptables rule (`-a`).
    pub auto_iptables: bool,
    /// Per-instance verbosity override; falls back to the global level.
    pub log_level: Option<String>,

    // Client-only parameters. Never emitted for a server instance.
    pub source_ip: String,
    pub source_port: String,
    pub seq_mode: Option<u32>,

    pub lower_level: String,
    pub dev: String,
    pub disable_anti_replay: bool,
    pub disable_bpf: bool,

    pub extra_args: ExtraArgs,
}

impl Default for InstanceSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            alias: "Unnamed".to_string(),
            listen_ip: "0.0.0.0".to_string(),
            listen_port: 29900,
            forward_ip: "127.0.0.1".to_string(),
            forward_port: 51820,
            local_ip: "127.0.0.1".to_string(),
            local_port: 3333,
            server_ip: "127.0.0.1".to_string(),
            server_port: 29900,
            password: "password".to_string(),
            raw_mode: "faketcp".to_string(),
            cipher_mode: "xor".to_string(),
            auth_mode: "simple".to_string(),
            auto_iptables: true,
            log_level: None,
            source_ip: String::new(),
            source_port: String::new(),
            seq_mode: None,
            lower_level: String::new(),
            dev: String::new(),
            disable_anti_replay: false,
            disable_bpf: false,
            extra_args: ExtraArgs::default(),
        }
    }
}

/// User-supplied extra arguments for the tunnel binary.
///
/// Old configs stored a single shell-syntax string, newer ones a list of
/// fragments; both shapes deserialize. Each fragment is tokenized
/// independently with shell rules and appended in list order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtraArgs {
    Fragment(String),
    FragmentList(Vec<String>),
}

impl Default for ExtraArgs {
    fn default() -> Self {
        ExtraArgs::FragmentList(Vec::new())
    }
}

impl ExtraArgs {
    /// Flatten to a token list. Blank fragments are skipped; a malformed
    /// fragment (unclosed quote) yields no tokens rather than an error.
    pub fn tokens(&self) -> Vec<String> {
        match self {
            ExtraArgs::Fragment(fragment) => split_fragment(fragment),
            ExtraArgs::FragmentList(fragments) => fragments
                .iter()
                .flat_map(|fragment| split_fragment(fragment))
                .collect(),
        }
    }
}

fn split_fragment(fragment: &str) -> Vec<String> {
    if fragment.trim().is_empty() {
        return Vec::new();
    }
    shlex::split(fragment).unwrap_or_default()
}

/// Read-only view of one configuration generation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigSnapshot {
    pub global: GlobalSpec,
    pub servers: Vec<InstanceSpec>,
    pub clients: Vec<InstanceSpec>,
}

impl ConfigSnapshot {
    pub fn load(path: &Path) -> Result<Self, WardenError> {
        let data = fs::read_to_string(path).map_err(|err| WardenError::Config {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        serde_json::from_str(&data).map_err(|err| WardenError::Config {
            path: path.display().to_string(),
            message: err.to_string(),
        })
    }
}
