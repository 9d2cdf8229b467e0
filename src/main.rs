use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod index;
mod indexer;
mod resolver;
mod server;
mod syntax;

#[derive(Parser)]
#[command(name = "phpls")]
#[command(author = "phpls Project Team")]
#[command(version)]
#[command(about = "Incremental semantic index and language server for PHP", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Project directory (shorthand for 'phpls serve --project <project>')
    #[arg(value_name = "PROJECT")]
    project: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the language server on stdio - default command
    Serve {
        /// Directory whose configuration applies when the client names no root
        #[arg(short, long)]
        project: Option<String>,
    },

    /// Index a project and save the snapshot
    Index {
        /// Project directory to index
        #[arg(short, long, default_value = ".")]
        project: String,

        /// Keep watching for changes
        #[arg(short, long)]
        watch: bool,

        /// Ignore the existing snapshot
        #[arg(short, long)]
        rebuild: bool,
    },

    /// Query the saved index
    Query {
        /// Query type: definition, references
        query_type: String,

        /// Fully qualified name, e.g. 'App\User::save()'
        target: String,

        /// Project directory
        #[arg(short, long, default_value = ".")]
        project: String,

        /// Output format: json, text
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show index statistics
    Stats {
        /// Project directory
        #[arg(short, long, default_value = ".")]
        project: String,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },
}

fn init_logging(cli: &Cli, project: Option<&str>) {
    let logging = project
        .map(|project| config::Config::from_project_dir(project).logging)
        .unwrap_or_default();
    let level = if cli.debug {
        "debug".to_string()
    } else if cli.verbose {
        "info".to_string()
    } else {
        logging.level
    };

    // RUST_LOG wins over flags and config
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // stdout carries protocol traffic
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match logging.format.as_str() {
        "pretty" => builder.pretty().init(),
        "full" => builder.init(),
        _ => builder.compact().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let project = match &cli.command {
        Some(Commands::Serve { project }) => project.clone(),
        Some(Commands::Index { project, .. })
        | Some(Commands::Query { project, .. })
        | Some(Commands::Stats { project, .. }) => Some(project.clone()),
        None => cli.project.clone(),
    };
    init_logging(&cli, project.as_deref());
    debug!("phpls v{} starting", env!("CARGO_PKG_VERSION"));

    // Shorthand: phpls [PROJECT]
    let command = cli.command.unwrap_or(Commands::Serve { project });

    match command {
        Commands::Serve { project } => {
            let code = cli::serve::serve(project).await?;
            // Stdin is read on a blocking thread that never returns; leave without waiting on it
            std::process::exit(code);
        }

        Commands::Index {
            project,
            watch,
            rebuild,
        } => {
            cli::index::index_project(project, watch, rebuild).await?;
        }

        Commands::Query {
            query_type,
            target,
            project,
            format,
        } => {
            cli::query::query_index(query_type, target, project, format).await?;
        }

        Commands::Stats { project, verbose } => {
            cli::stats::show_stats(project, verbose).await?;
        }
    }

    Ok(())
}
