use clap::Parser;
use polyarb::{Cli, EngineError};

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() {
    let cli = Cli::parse();

    match polyarb::run(cli).await {
        Ok(()) => {}
        Err(EngineError::Configuration(msg)) => {
            eprintln!("💥 Configuration error: {}", msg);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("💥 Fatal error: {}", e);
            std::process::exit(2);
        }
    }
}
