mod commands;
mod utils;

use clap::{Parser, Subcommand};
use commands::{ImageCommands, InstanceArgs, handle_image_command};
use kiln_instance::Paths;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Disposable QEMU sandboxes from local disk images")]
struct Cli {
    /// Data directory holding images and runtime state
    /// (default: $KILN_DATA or ~/.kiln)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot an instance and run a command inside it
    Run {
        #[command(flatten)]
        args: InstanceArgs,

        /// Command to execute in the guest
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Boot an instance and open an interactive shell
    Login {
        #[command(flatten)]
        args: InstanceArgs,
    },
    /// Boot an instance and attach to its serial console
    Console {
        #[command(flatten)]
        args: InstanceArgs,
    },
    /// Manage images
    #[command(subcommand)]
    Image(ImageCommands),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let paths = Paths::new(cli.data_dir.unwrap_or_else(utils::default_data_dir));

    match cli.command {
        Commands::Run { args, command } => commands::run_command(&paths, args, command).await,
        Commands::Login { args } => commands::login_command(&paths, args).await,
        Commands::Console { args } => commands::console_command(&paths, args).await,
        Commands::Image(cmd) => handle_image_command(&paths, cmd).await,
    }
}
