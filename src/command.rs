//! Builds the udp2raw argument vector for one tunnel instance.
//!
//! Pure construction, no I/O. The udp2raw argument grammar requires each
//! flag and its value as separate whitespace-delimited tokens; joined
//! `--flag=value` tokens are not accepted.

use crate::config::{GlobalSpec, InstanceSpec, Role};

/// udp2raw `--log-level` ordinal for a named verbosity level. Unknown
/// names fall back to `info`.
pub fn log_level_ordinal(level: &str) -> u8 {
    match level {
        "fatal" => 1,
        "error" => 2,
        "warn" => 3,
        "info" => 4,
        "debug" => 5,
        "trace" => 6,
        _ => 4,
    }
}

/// Argument vector for one instance, in the order udp2raw documents them:
/// mode, endpoints, credentials, transport modes, then advanced flags and
/// user extras.
pub fn build_tunnel_args(role: Role, spec: &InstanceSpec, global: &GlobalSpec) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    args.push(role.mode_flag().to_string());
    match role {
        Role::Server => {
            push_pair(&mut args, "-l", format!("{}:{}", spec.listen_ip, spec.listen_port));
            push_pair(&mut args, "-r", format!("{}:{}", spec.forward_ip, spec.forward_port));
        }
        Role::Client => {
            push_pair(&mut args, "-l", format!("{}:{}", spec.local_ip, spec.local_port));
            push_pair(&mut args, "-r", format!("{}:{}", spec.server_ip, spec.server_port));
        }
    }

    push_pair(&mut args, "-k", spec.password.clone());
    push_pair(&mut args, "--raw-mode", spec.raw_mode.clone());
    push_pair(&mut args, "--cipher-mode", spec.cipher_mode.clone());
    push_pair(&mut args, "--auth-mode", spec.auth_mode.clone());
    if spec.auto_iptables {
        args.push("-a".to_string());
    }

    if !spec.lower_level.is_empty() {
        push_pair(&mut args, "--lower-level", spec.lower_level.clone());
    }
    if !spec.dev.is_empty() {
        push_pair(&mut args, "--dev", spec.dev.clone());
    }
    if spec.disable_anti_replay {
        args.push("--disable-anti-replay".to_string());
    }
    if spec.disable_bpf {
        args.push("--disable-bpf".to_string());
    }

    if role == Role::Client {
        if !spec.source_ip.is_empty() {
            push_pair(&mut args, "--source-ip", spec.source_ip.clone());
        }
        if !spec.source_port.is_empty() {
            push_pair(&mut args, "--source-port", spec.source_port.clone());
        }
        if let Some(seq_mode) = spec.seq_mode {
            push_pair(&mut args, "--seq-mode", seq_mode.to_string());
        }
    }

    let level = spec.log_level.as_deref().unwrap_or(&global.log_level);
    push_pair(&mut args, "--log-level", log_level_ordinal(level).to_string());

    if global.wait_lock {
        args.push("--wait-lock".to_string());
    }
    if global.retry_on_error {
        args.push("--retry-on-error".to_string());
    }

    args.extend(spec.extra_args.tokens());
    args
}

fn push_pair(args: &mut Vec<String>, flag: &str, value: String) {
    args.push(flag.to_string());
    args.push(value);
}
