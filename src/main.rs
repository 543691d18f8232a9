mod agent;
mod cli;
mod cmd;
mod command;
mod config;
mod logger;
mod multiplexer;
mod runtime;
mod sandbox;
mod spinner;
mod state;
mod vcs;

use anyhow::Result;
use tracing::{error, info};

fn main() -> Result<()> {
    logger::init()?;
    info!(args = ?std::env::args().collect::<Vec<_>>(), "sandcastles start");

    match cli::run() {
        Ok(result) => {
            info!("sandcastles finished successfully");
            Ok(result)
        }
        Err(err) => {
            error!(error = ?err, "sandcastles failed");
            Err(err)
        }
    }
}
