mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ojudge-cli")]
#[command(about = "ojudge CLI - Submit jobs, watch results, inspect queues and manage runtimes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a source file (or SQL query) for judging
    Submit {
        /// Problem id
        #[arg(short, long)]
        problem: i64,

        /// Language tag (e.g., py, js, mysql)
        #[arg(short, long)]
        language: String,

        /// Path to the source file
        #[arg(short, long)]
        file: PathBuf,

        /// Official submission id; omit for a test run
        #[arg(short, long)]
        submission: Option<i64>,

        /// Session token for a test run (generated when omitted)
        #[arg(long)]
        session: Option<String>,

        /// Wait for the test-run result and print it
        #[arg(short, long, default_value = "false")]
        wait: bool,

        /// Seconds to wait for a result
        #[arg(long, default_value = "60")]
        timeout: u64,
    },

    /// Print the result published for a test-run session
    Watch {
        /// Session token
        #[arg(short, long)]
        session: String,

        /// Seconds to wait for a result
        #[arg(long, default_value = "60")]
        timeout: u64,
    },

    /// Show pending and in-flight jobs per queue
    Stats,

    /// Add a sandbox runtime to config/languages.json
    AddLang {
        /// Language tag, also used as the source file extension (e.g., rb)
        #[arg(short, long)]
        name: String,

        /// Pre-built sandbox image
        #[arg(short, long)]
        image: String,

        /// Container base name (defaults to {name}_oj)
        #[arg(long)]
        container_name: Option<String>,

        /// Interpreter command (defaults to the language tag)
        #[arg(short, long)]
        command: Option<String>,

        /// Memory limit in MB
        #[arg(short, long, default_value = "256")]
        memory: u32,

        /// CPU limit
        #[arg(long, default_value = "1.0")]
        cpu: f32,
    },

    /// Remove a sandbox runtime from config/languages.json
    RemoveLang {
        /// Language tag
        #[arg(short, long)]
        name: String,

        /// Skip confirmation
        #[arg(short, long, default_value = "false")]
        yes: bool,
    },

    /// List configured runtimes
    ListLangs,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("⚠️  Failed to load .env: {}", e);
        }
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Submit {
            problem,
            language,
            file,
            submission,
            session,
            wait,
            timeout,
        } => {
            commands::submit(problem, &language, &file, submission, session, wait, timeout).await?;
        }
        Commands::Watch { session, timeout } => {
            commands::watch(&session, timeout).await?;
        }
        Commands::Stats => {
            commands::stats().await?;
        }
        Commands::AddLang {
            name,
            image,
            container_name,
            command,
            memory,
            cpu,
        } => {
            commands::add_language(
                &name,
                &image,
                container_name.as_deref(),
                command.as_deref(),
                memory,
                cpu,
            )?;
        }
        Commands::RemoveLang { name, yes } => {
            commands::remove_language(&name, yes)?;
        }
        Commands::ListLangs => {
            commands::list_languages()?;
        }
    }

    Ok(())
}
