use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "aispeaker", version, about = "Wake-word voice assistant")]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, default_value = aispeaker::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match aispeaker::run(&cli.config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("aispeaker: {e}");
            ExitCode::FAILURE
        }
    }
}
