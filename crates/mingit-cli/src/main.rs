mod commands;

use clap::Parser;

#[derive(Parser)]
#[command(name = "mingit", version, about = "Object-store index tooling")]
pub struct Cli {
    /// Path to the repository metadata directory.
    #[arg(long, default_value = ".mingit", global = true)]
    pub repo_dir: std::path::PathBuf,

    #[command(subcommand)]
    command: commands::Command,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match commands::run(&cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            1
        }
    };
    std::process::exit(code);
}
