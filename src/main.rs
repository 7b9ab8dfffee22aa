#![warn(unused_extern_crates)]
use anyhow::Result;
use clap::Parser;
use facemood::app;
use facemood::config::CmdArgs;
use tokio::runtime;
use tokio::task::LocalSet;
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let filter = EnvFilter::from_default_env();
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_env_filter(filter)
        .init();

    let args = CmdArgs::parse();

    let rt = runtime::Builder::new_current_thread().enable_all().build()?;
    let local = LocalSet::new();
    if let Err(e) = local.block_on(&rt, app::run(args)) {
        error!("{e:?}");
        std::process::exit(1);
    }

    Ok(())
}
