use std::path::PathBuf;

use clap::Parser;
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;

use mycel_daemon::config::DaemonConfig;
use mycel_daemon::core::Core;

#[derive(Parser, Debug)]
#[command(name = "myceld", about = "delay-tolerant mesh networking daemon")]
struct Args {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Instance directory (overrides the config file).
    #[arg(long)]
    instance: Option<PathBuf>,
    /// Extra interface rules, e.g. `+eth0=ethernet` or `+>dummy`.
    #[arg(long = "interface")]
    interfaces: Vec<String>,
    /// Accept incoming voice calls (requires an attached call client).
    #[arg(long)]
    accept_calls: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let local = LocalSet::new();
    local
        .run_until(async {
            let args = Args::parse();
            let mut config = match &args.config {
                Some(path) => DaemonConfig::from_path(path)?,
                None => DaemonConfig::from_toml("")?,
            };
            if let Some(dir) = args.instance {
                config.instance_dir = dir;
            }
            config.interfaces.extend(args.interfaces);
            if args.accept_calls {
                config.accept_calls = true;
            }

            let cancel = CancellationToken::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _ = tokio::signal::ctrl_c().await;
                    log::info!("shutting down");
                    cancel.cancel();
                });
            }

            let core = Core::bootstrap(&config, cancel).await?;
            core.run().await;
            Ok(())
        })
        .await
}
