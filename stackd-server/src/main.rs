use clap::Parser;
use stackd_server::config::ServerConfig;
use tracing::error;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "stackd", version, about = "Compose fleet control plane")]
struct Cli {
    /// Run a single reconcile pass and exit.
    #[arg(long)]
    once: bool,
    /// Workspace root; overrides STACKD_ROOT.
    #[arg(long)]
    root: Option<std::path::PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Some(root) = &cli.root {
        std::env::set_var("STACKD_ROOT", root);
    }

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(anyhow::Error::from)
        .and_then(|runtime| {
            runtime.block_on(async {
                let config = ServerConfig::from_env()?;
                if cli.once {
                    stackd_server::run_once(config).await
                } else {
                    stackd_server::run(config).await
                }
            })
        });

    if let Err(e) = result {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
