use fpga_miner::{config::MinerConfig, daemon::Daemon, tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = MinerConfig::from_env()?;
    tracing::init_journald_or_stdout(config.log_file.as_deref());

    Daemon::new(config).run().await
}
