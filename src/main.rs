use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use utw::config::ConfigSnapshot;
use utw::supervisor::{SupervisorOptions, TunnelSupervisor};
use utw::{build_tunnel_args, signal, FirewallReconciler, Role, TUNNEL_BIN};

const DEFAULT_CONFIG: &str = "/etc/utw/udp-tunnel.json";

#[derive(Parser)]
#[command(name = "utw", version, about = "udp2raw tunnel supervisor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every enabled tunnel and supervise until SIGINT/SIGTERM.
    Run {
        /// Path to the tunnel configuration snapshot (JSON).
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Override the log file path.
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Print the command line each enabled instance would run, without
    /// starting anything.
    Render {
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Remove leftover udp2raw iptables rules and chains.
    Clean,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run { config, log_file } => {
            let snapshot = ConfigSnapshot::load(&config)
                .with_context(|| format!("loading {}", config.display()))?;

            let mut options = SupervisorOptions::default();
            if let Some(path) = log_file {
                options.log_path = path;
            }
            let supervisor = TunnelSupervisor::new(options);

            signal::install();
            supervisor.start_all(&snapshot);

            while !signal::shutdown_requested() {
                thread::sleep(Duration::from_millis(200));
            }
            tracing::info!("shutdown requested, stopping tunnels");
            supervisor.stop_all();
            Ok(())
        }
        Commands::Render { config } => {
            let snapshot = ConfigSnapshot::load(&config)
                .with_context(|| format!("loading {}", config.display()))?;

            let groups = [
                (Role::Server, &snapshot.servers),
                (Role::Client, &snapshot.clients),
            ];
            for (role, specs) in groups {
                for (index, spec) in specs.iter().enumerate() {
                    if !spec.enabled {
                        continue;
                    }
                    let args = build_tunnel_args(role, spec, &snapshot.global);
                    println!(
                        "{}_{} ({}): {} {}",
                        role.as_str(),
                        index,
                        spec.alias,
                        TUNNEL_BIN,
                        args.join(" ")
                    );
                }
            }
            Ok(())
        }
        Commands::Clean => {
            FirewallReconciler::default().reconcile();
            Ok(())
        }
    }
}
