use std::io;
use std::process::ExitCode;

use log::error;
use ofrep_smoke::smoke::{self, SmokeConfig};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            eprintln!("FAIL {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut stdout = io::stdout();
    match smoke::run(&config, &mut stdout).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("FAIL {}", e);
            ExitCode::FAILURE
        }
    }
}
