use std::env;

use nyvera::cli::{self, Mode};

#[tokio::main]
async fn main() -> nyvera::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().skip(1).collect();
    let parsed = match cli::parse_args(&args) {
        Ok(parsed) => parsed,
        Err(message) => {
            eprintln!("Error: {message}");
            eprintln!();
            cli::print_usage();
            std::process::exit(2);
        }
    };

    if parsed.mode == Mode::Help {
        cli::print_usage();
        return Ok(());
    }

    if let Err(e) = cli::run(parsed).await {
        log::error!("{e}");
        std::process::exit(1);
    }
    Ok(())
}
