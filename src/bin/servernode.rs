use clap::Parser;
use servernode::node::cli::Args;
use servernode::node::daemon::{DaemonOptions, run_daemon_async};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = args.resolve_config()?;
    run_daemon_async(
        cfg,
        DaemonOptions {
            console: !args.no_console,
        },
    )
    .await
}
