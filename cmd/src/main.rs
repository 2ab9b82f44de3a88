//! bm-sbc: run one Bristlemouth mesh node as a Linux process.
//!
//! Each process is one mesh node. Local peers talk over Unix datagram
//! sockets in a shared directory; an optional serial line bridges the
//! local fabric to an off-host mesh segment.

mod app;
mod config;
mod runtime;

use app::MultinodeApp;
use clap::Parser;
use config::{Args, LaunchConfig};
use runtime::StartupError;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    let cfg = match LaunchConfig::from_args(args) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("bm-sbc: {err:#}");
            return ExitCode::from(1);
        }
    };
    if let Err(err) = init_tracing(&cfg.log_level) {
        eprintln!("bm-sbc: {err:#}");
        return ExitCode::from(1);
    }

    info!("starting bm-sbc node {:016x}", cfg.node_id);
    let rt = match runtime::start(&cfg).await {
        Ok(rt) => rt,
        Err(err) => {
            return match err.downcast_ref::<StartupError>() {
                Some(startup) => {
                    error!("startup sequence failed err={} ({err:#})", startup.stage());
                    ExitCode::from(startup.stage())
                }
                None => {
                    error!("startup failed: {err:#}");
                    ExitCode::from(1)
                }
            };
        }
    };

    let mut app = MultinodeApp::new();
    app::run(&rt, &mut app).await
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let mut filter = EnvFilter::new("info");
    for crate_name in ["bm_sbc", "bm_net", "bm_stack", "bm_wire"] {
        filter = filter.add_directive(format!("{crate_name}={level}").parse()?);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}
