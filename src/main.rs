use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;

use secretshare::commands::{self, CommandOptions};
use secretshare::DEFAULT_PORT;

#[derive(Parser)]
#[command(name = "secretshare")]
#[command(about = "Share a file with a GPG-verified peer", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// gpg executable to run
    #[arg(long, global = true, env = "SECRETSHARE_GPG")]
    gpg: Option<PathBuf>,

    /// GnuPG home directory (defaults to gpg's own choice)
    #[arg(long, global = true, env = "GNUPGHOME")]
    gnupg_home: Option<PathBuf>,

    /// Give up on a silent peer after this many seconds
    #[arg(long, global = true, value_name = "SECS")]
    timeout: Option<u64>,

    /// Answer yes to every consent prompt
    #[arg(short, long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Offer a file to connecting peers
    Host {
        /// Path to the file to share
        #[arg(short, long)]
        file: String,

        /// Port to listen on (default: any free port)
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Fetch the file offered by a host
    Connect {
        /// Host address as printed by `secretshare host`, e.g. 192.168.1.20:40123
        addr: String,

        /// Directory to save the file into
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let opts = CommandOptions::new(cli.gpg, cli.gnupg_home, cli.timeout, cli.yes);

    match cli.command {
        Commands::Host { file, port } => {
            commands::host::run(&file, port, opts).await?;
        }
        Commands::Connect { addr, output } => {
            commands::connect::run(&addr, output, opts).await?;
        }
    }

    Ok(())
}
