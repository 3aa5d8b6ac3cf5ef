mod exposehost;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "exposehost",
    version,
    about = "exposehost - expose local services through a public reverse tunnel"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses EXPOSEHOST_CONFIG; then auto-detects exposehost.toml > exposehost.yaml > exposehost.yml from CWD; then falls back to the OS default path (Linux: /etc/exposehost/exposehost.toml; others: user config dir).
    #[arg(long, env = "EXPOSEHOST_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Run as a balancer worker on this port. Set by the balancer when it spawns workers.
    #[arg(long, hide = true)]
    worker_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    exposehost::run(cli.config, cli.worker_port).await
}
