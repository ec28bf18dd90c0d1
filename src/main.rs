use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;

use status_console::config::Config;
use status_console::services::Backends;
use status_console::store::TestResultStore;
use status_console::workflow::MashupTests;

#[derive(Parser)]
#[command(version, about = "STATUS console: authenticated API calls and local mashup test history")]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to a TOML config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// GET a path on the primary backend and print the payload.
    Get { path: String },
    /// Inspect or prune local mashup test history.
    Tests {
        #[command(subcommand)]
        action: TestsAction,
    },
    /// Run a mashup test on the flow backend and record the result.
    Run {
        mashup: String,
        #[arg(long, default_value = "{}", help = "JSON input for the mashup")]
        input: String,
    },
}

#[derive(Subcommand)]
enum TestsAction {
    List {
        #[arg(long)]
        mashup: Option<String>,
    },
    Delete { mashup: String, test: String },
    Clear {
        #[arg(long)]
        mashup: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Get { path } => {
            let backends = Backends::from_config(&config)?;
            let payload = backends.api.get(&path).await.inspect_err(|e| {
                tracing::error!(kind = ?e.kind(), "request failed: {e}");
            })?;
            print_json(&payload)?;
        }
        Command::Tests { action } => {
            let tests = open_history(&config).await;
            match action {
                TestsAction::List { mashup: Some(mashup) } => {
                    print_json(&tests.get_tests_for_mashup(&mashup).await)?;
                }
                TestsAction::List { mashup: None } => {
                    for mashup in tests.mashup_ids() {
                        let group = tests.get_tests_for_mashup_sync(&mashup);
                        println!("{mashup}\t{} test(s)", group.len());
                    }
                }
                TestsAction::Delete { mashup, test } => tests.delete_test(&mashup, &test).await?,
                TestsAction::Clear { mashup: Some(mashup) } => {
                    tests.clear_tests_for_mashup(&mashup).await?
                }
                TestsAction::Clear { mashup: None } => tests.clear_all_tests().await?,
            }
        }
        Command::Run { mashup, input } => {
            let input: Value = serde_json::from_str(&input)
                .map_err(|e| anyhow::anyhow!("--input is not valid JSON: {e}"))?;
            let backends = Backends::from_config(&config)?;
            let tests = open_history(&config).await;
            let execution = tests.run_test(&backends.mashups(), &mashup, &input).await?;
            print_json(&execution)?;
        }
    }

    Ok(())
}

async fn open_history(config: &Config) -> MashupTests {
    let tests = MashupTests::new(Arc::new(TestResultStore::open(&config.store_path)));
    tests.start().await;
    tests
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
