//! Best-effort iptables cleanup for udp2raw artifacts.
//!
//! udp2raw started with `-a` inserts an INPUT rule and a per-tunnel chain,
//! both named with a well-known prefix, and its own cleanup does not run
//! when the process is killed abruptly. Every stop cycle therefore
//! rediscovers artifacts by tag on the live host and removes them; no
//! ledger of what was created is kept. Nothing here may abort a stop/start
//! cycle: missing tool, missing privileges, and mutation failures all
//! degrade to warnings.

use std::io;
use std::process::Command;
use tracing::{debug, warn};

/// Naming prefix udp2raw uses for the rules and chains it creates.
pub const FIREWALL_TAG: &str = "udp2rawDwrW";

/// Cap on delete passes over the INPUT chain, in case deletion silently
/// fails and the same rule keeps matching.
const MAX_RULE_PASSES: usize = 32;

#[derive(Debug, Clone)]
pub struct FirewallReconciler {
    iptables: String,
    tag: String,
}

impl Default for FirewallReconciler {
    fn default() -> Self {
        Self::new("iptables", FIREWALL_TAG)
    }
}

impl FirewallReconciler {
    pub fn new(iptables: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            iptables: iptables.into(),
            tag: tag.into(),
        }
    }

    /// Removes every tagged INPUT rule, then every tagged chain.
    pub fn reconcile(&self) {
        if let Err(err) = self.delete_tagged_input_rules() {
            warn!("firewall rule cleanup skipped: {err}");
        }
        if let Err(err) = self.delete_tagged_chains() {
            warn!("firewall chain cleanup skipped: {err}");
        }
    }

    /// Re-lists INPUT with line numbers each pass and deletes the lowest
    /// tagged rule, because numbers shift after every deletion.
    fn delete_tagged_input_rules(&self) -> io::Result<()> {
        for _ in 0..MAX_RULE_PASSES {
            let listing = self.run(&["-L", "INPUT", "--line-numbers", "-n"])?;
            let Some(number) = find_tagged_rule(&listing, &self.tag) else {
                return Ok(());
            };
            debug!("deleting tagged INPUT rule #{number}");
            if !self.run_status(&["-D", "INPUT", &number.to_string()])? {
                warn!("failed to delete INPUT rule #{number}");
                return Ok(());
            }
        }
        warn!("rule cleanup pass cap reached; tagged INPUT rules may remain");
        Ok(())
    }

    fn delete_tagged_chains(&self) -> io::Result<()> {
        let listing = self.run(&["-S"])?;
        for chain in tagged_chain_names(&listing, &self.tag) {
            debug!("removing chain {chain}");
            if !self.run_status(&["-F", &chain])? {
                warn!("failed to flush chain {chain}");
                continue;
            }
            if !self.run_status(&["-X", &chain])? {
                // A concurrent actor may have removed it already.
                warn!("failed to delete chain {chain}");
            }
        }
        Ok(())
    }

    fn run(&self, args: &[&str]) -> io::Result<String> {
        let output = Command::new(&self.iptables).args(args).output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "{} {} exited with {}",
                self.iptables,
                args.join(" "),
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn run_status(&self, args: &[&str]) -> io::Result<bool> {
        Ok(Command::new(&self.iptables).args(args).output()?.status.success())
    }
}

/// Line number of the lowest-numbered INPUT rule mentioning `tag`, from
/// `iptables -L INPUT --line-numbers -n` output.
fn find_tagged_rule(listing: &str, tag: &str) -> Option<u32> {
    listing
        .lines()
        .filter(|line| line.contains(tag))
        .find_map(|line| line.split_whitespace().next()?.parse().ok())
}

/// Chain names declared with `-N` in `iptables -S` output that match `tag`.
fn tagged_chain_names(listing: &str, tag: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let name = line.strip_prefix("-N ")?.trim();
            if name.contains(tag) {
                Some(name.to_string())
            } else {
                None
            }
        })
        .collect()
}
