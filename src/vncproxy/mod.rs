pub mod admin;
pub mod app;
pub mod config;
pub mod dial;
pub mod frame;
pub mod logging;
pub mod net;
pub mod peer;
pub mod proxy;
pub mod registry;
pub mod resolver;
pub mod telemetry;
pub mod ws;

#[cfg(test)]
pub(crate) mod testutil;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
