use clap::{Parser, Subcommand};
use std::process;

mod commands;

use commands::{master, status, submit, worker};

/// Arena - master/worker scheduler for contest compilations and matches
#[derive(Parser)]
#[command(name = "arena")]
#[command(author = "Arena Contributors")]
#[command(version)]
#[command(about = "Master and worker nodes for the Arena contest match scheduler", long_about = None)]
#[command(propagate_version = true)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the master node
    #[command(visible_alias = "m")]
    Master(master::MasterArgs),

    /// Run a worker node
    #[command(visible_alias = "w")]
    Worker(worker::WorkerArgs),

    /// Show workers, queue depth and in-flight matches
    #[command(visible_alias = "s")]
    Status(status::StatusArgs),

    /// Submit a champion source archive for compilation
    SubmitChampion(submit::SubmitChampionArgs),

    /// Request a match between compiled champions
    RequestMatch(submit::RequestMatchArgs),

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    // Handle color output
    if cli.no_color {
        colored::control::set_override(false);
    }

    // Execute command
    let result = match cli.command {
        Commands::Master(args) => master::execute(args).await,
        Commands::Worker(args) => worker::execute(args).await,
        Commands::Status(args) => status::execute(args).await,
        Commands::SubmitChampion(args) => submit::execute_submit(args).await,
        Commands::RequestMatch(args) => submit::execute_match(args).await,
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(())
        }
    };

    // Handle errors
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        if cli.verbose {
            eprintln!("\nCaused by:");
            for cause in e.chain().skip(1) {
                eprintln!("  {}", cause);
            }
        }
        process::exit(1);
    }
}

fn generate_completions(shell: clap_complete::Shell) {
    use clap::CommandFactory;
    use clap_complete::generate;
    use std::io;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();
    generate(shell, &mut cmd, bin_name, &mut io::stdout());
}
