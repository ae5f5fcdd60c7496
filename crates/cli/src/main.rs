use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing::info;

use tiller_cache::Cache;
use tiller_config::Config;
use tiller_envoy::EnvoyConfig;
use tiller_fetch::ResourceFetcher;
use tiller_ir::{check_deltas, AconfSecretReader, Ir, RealFileChecker};

#[derive(Parser, Debug)]
#[command(name = "tiller", version, about = "Tiller gateway config compiler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile a snapshot into Envoy configuration
    Compile {
        /// Snapshot file: a flat YAML/JSON object list, or a watt bundle
        /// with --watt
        snapshot: PathBuf,

        /// Treat the input as a multiplexed watt snapshot bundle
        #[arg(long = "watt", action = ArgAction::SetTrue)]
        watt: bool,

        /// Print bootstrap and dynamic resources as separate documents
        #[arg(long = "split", action = ArgAction::SetTrue)]
        split: bool,

        /// Print the validation error report to stderr
        #[arg(long = "errors", action = ArgAction::SetTrue)]
        errors: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("TILLER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TILLER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TILLER_METRICS_ADDR; expected host:port");
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Compile { snapshot, watt, split, errors } => {
            let serialization = std::fs::read_to_string(&snapshot)
                .with_context(|| format!("could not read {}", snapshot.display()))?;

            let mut fetcher = ResourceFetcher::new().context("building the processor pipeline")?;
            let mut aconf = Config::new();

            if watt {
                fetcher.parse_snapshot_str(&mut aconf, &serialization);
            } else {
                fetcher.parse_yaml(&mut aconf, &serialization);
            }
            fetcher.finalize(&mut aconf);

            let mut cache = Cache::new();
            let check = check_deltas(fetcher.deltas(), Some(&mut cache), false);
            info!(config_type = %check.config_type, "compiling");

            aconf.load_all(fetcher.sorted());

            let reader = AconfSecretReader::new(&aconf);
            let ir = Ir::new(
                &mut aconf,
                &mut cache,
                &check.invalidate_groups_for,
                &reader,
                &RealFileChecker,
            );
            let econf = EnvoyConfig::generate(&ir, &mut cache);

            if split {
                let (bootstrap, resources) = econf.split();
                println!("{}", serde_json::to_string_pretty(&bootstrap)?);
                println!("{}", serde_json::to_string_pretty(&resources)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&econf.as_value())?);
            }

            if errors {
                for (rkey, message) in aconf.error_report() {
                    eprintln!("{rkey}: {message}");
                }
            }
        }
    }

    Ok(())
}
