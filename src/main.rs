mod vncproxy;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "vncproxy",
    version,
    about = "vncproxy - WebSocket to VNC/RDP TCP tunnel"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses VNCPROXY_CONFIG; then auto-detects vncproxy.toml > vncproxy.yaml > vncproxy.yml from CWD; then falls back to the OS default path (Linux: /etc/vncproxy/vncproxy.toml; others: user config dir).
    #[arg(long, env = "VNCPROXY_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    vncproxy::run(cli.config).await
}
