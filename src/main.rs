use std::process::ExitCode;

use clap::Parser;
use rdma_test::config::{Cli, TestConfig};
use rdma_test::runner;

fn try_main() -> anyhow::Result<()> {
    let config = TestConfig::resolve(Cli::parse())?;
    log::debug!("running with {:?}", config);
    runner::run(&config)?;
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match try_main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
