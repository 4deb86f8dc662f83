use std::process::ExitCode;

use clap::Parser;
use htlc_relayer::Relayer;
use relayer_types::RelayerOptions;
use relayer_utils::logging::setup_logging;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let opt = RelayerOptions::parse();
    setup_logging(&opt.general.log_level);

    let relayer = match Relayer::init(opt).await {
        Ok(relayer) => relayer,
        Err(err) => {
            tracing::error!("startup failed: {err:#}");
            return ExitCode::FAILURE;
        },
    };

    match relayer.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("relayer exited with error: {err:#}");
            ExitCode::FAILURE
        },
    }
}
