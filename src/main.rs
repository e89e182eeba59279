use anyhow::Result;
use clap::{Parser, Subcommand};
use sheetquery::analyzer::Analyzer;
use sheetquery::config::AgentConfig;
use sheetquery::metadata;
use sheetquery::server;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sheetquery")]
#[command(about = "Natural-language questions over spreadsheet files")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ask a question about a spreadsheet
    Analyze {
        /// Path to the workbook
        #[arg(short, long)]
        file: PathBuf,

        /// The question in natural language
        #[arg(short, long)]
        query: String,
    },
    /// Print the metadata summary for a workbook
    Metadata {
        /// Path to the workbook
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Run the HTTP API server
    Serve {
        #[arg(short, long, default_value_t = 8080)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = AgentConfig::from_env();

    match args.command {
        Command::Analyze { file, query } => {
            info!(file = %file.display(), "starting analysis");
            let analyzer = Analyzer::new(config)?;
            let outcome = analyzer.analyze(&file, &query).await;
            println!("{}", outcome.answer);
            if !outcome.success {
                std::process::exit(1);
            }
        }
        Command::Metadata { file } => {
            let meta = metadata::extract(&file)?;
            println!("{}", meta.summary(&file));
        }
        Command::Serve { port } => {
            if config.api_key.is_empty() {
                warn!("OPENAI_API_KEY is not set; analysis requests will fail");
            }
            server::run(config, port).await?;
        }
    }

    Ok(())
}
