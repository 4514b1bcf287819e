use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use clap::{Args, Parser, Subcommand};

use docreason_engine::{Engine, EngineConfig, RunRequest};
use docreason_protocol::{ModelProvider, ReasoningEvent};
use docreason_provider::{GeminiClient, ScriptedProvider};
use docreason_store::{ingest_document, DocumentTree, SqliteStore};

const DEFAULT_MODEL: &str = "gemini-2.0-flash";

#[derive(Parser)]
#[command(name = "docreason")]
#[command(about = "Agentic question answering over ingested document trees", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the SQLite database
    #[arg(long, global = true, default_value = "docreason.db")]
    db: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database (and run migrations) without doing anything else
    Init,

    /// Load a parsed document tree (JSON) into a project
    Ingest(IngestArgs),

    /// Run a reasoning query and stream its steps
    Ask(AskArgs),

    /// Print the stored snapshot of a run as JSON
    Show(ShowArgs),
}

#[derive(Args)]
struct IngestArgs {
    /// Project the document belongs to
    project: String,

    /// Path to the parsed document tree JSON
    file: PathBuf,

    /// Output JSON format
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct AskArgs {
    /// Project scope for the query
    project: String,

    /// The question to answer
    query: String,

    /// Restrict retrieval to one document
    #[arg(long)]
    focus_document: Option<String>,

    /// Maximum retrieval steps (default from engine config)
    #[arg(long)]
    max_steps: Option<usize>,

    /// Replay provider responses from a JSON array of strings instead of
    /// calling Gemini (reproducible offline runs)
    #[arg(long)]
    script: Option<PathBuf>,

    /// Gemini model id
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Print the final run snapshot as JSON instead of human-readable text
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ShowArgs {
    /// Run id returned by `ask`
    run_id: String,

    /// Pretty-print the JSON snapshot
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();

    match cli.command {
        Commands::Init => run_init(&cli.db),
        Commands::Ingest(args) => run_ingest(&cli.db, args),
        Commands::Ask(args) => run_ask(&cli.db, args).await,
        Commands::Show(args) => run_show(&cli.db, args),
    }
}

fn open_store(db: &PathBuf) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::open(db)
        .with_context(|| format!("Failed to open database {}", db.display()))?;
    Ok(Arc::new(store))
}

fn run_init(db: &PathBuf) -> Result<()> {
    open_store(db)?;
    eprintln!("Database ready at {}", db.display());
    Ok(())
}

fn run_ingest(db: &PathBuf, args: IngestArgs) -> Result<()> {
    let store = open_store(db)?;
    let raw = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let tree: DocumentTree = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid document tree in {}", args.file.display()))?;

    let report = ingest_document(&store, &args.project, &tree)?;

    if args.json {
        println!(
            "{}",
            serde_json::json!({
                "document_id": report.document_id,
                "node_count": report.node_count,
            })
        );
    } else {
        eprintln!(
            "Ingested '{}' as document {} ({} nodes)",
            tree.name, report.document_id, report.node_count
        );
    }
    Ok(())
}

fn build_provider(args: &AskArgs) -> Result<Arc<dyn ModelProvider>> {
    if let Some(script) = &args.script {
        let provider = ScriptedProvider::from_file(script)
            .with_context(|| format!("Failed to load script {}", script.display()))?;
        return Ok(Arc::new(provider));
    }
    let api_key = std::env::var("DOCREASON_API_KEY")
        .or_else(|_| std::env::var("GEMINI_API_KEY"))
        .context("Set DOCREASON_API_KEY (or GEMINI_API_KEY), or pass --script")?;
    let client = GeminiClient::new(args.model.clone(), api_key)
        .map_err(|err| anyhow::anyhow!("Failed to build Gemini client: {err}"))?;
    Ok(Arc::new(client))
}

async fn run_ask(db: &PathBuf, args: AskArgs) -> Result<()> {
    let store = open_store(db)?;
    let provider = build_provider(&args)?;
    let engine = Engine::new(
        Arc::clone(&store),
        Arc::clone(&store) as Arc<dyn docreason_protocol::NodeRepository>,
        provider,
        EngineConfig::default(),
    );

    let mut events = engine.subscribe();
    let started = engine.run_query(RunRequest {
        project_id: args.project.clone(),
        query: args.query.clone(),
        max_steps: args.max_steps,
        focus_document_id: args.focus_document.clone(),
    })?;
    eprintln!("Run {} started", started.run_id);

    let failure = loop {
        let event = events.recv().await.context("event stream closed")?;
        if event.run_id() != started.run_id {
            continue;
        }
        match event {
            ReasoningEvent::Step(step) => {
                eprintln!(
                    "step {} [{}] {} -> {}",
                    step.step_index,
                    step.kind.as_str(),
                    step.objective,
                    step.observation,
                );
            }
            ReasoningEvent::Complete(complete) => {
                eprintln!(
                    "Completed: confidence {:.2}, quality {:.2}, {} ms, ${:.6}",
                    complete.final_confidence,
                    complete.quality_score,
                    complete.total_latency_ms,
                    complete.cost_usd,
                );
                break None;
            }
            ReasoningEvent::Error(error) => {
                break Some(error);
            }
        }
    };

    let snapshot = engine.get_run(&started.run_id)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else if let Some(answer) = &snapshot.answer {
        println!("{}", answer.answer_markdown);
        if !answer.citations.is_empty() {
            println!();
            println!("Citations: {}", answer.citations.join(", "));
        }
    }

    if let Some(error) = failure {
        eprintln!("Error [{}]: {}", error.code.as_str(), error.message);
        std::process::exit(1);
    }
    Ok(())
}

fn run_show(db: &PathBuf, args: ShowArgs) -> Result<()> {
    let store = open_store(db)?;
    let snapshot = store
        .get_run(&args.run_id)?
        .with_context(|| format!("run {} not found", args.run_id))?;
    let output = if args.pretty {
        serde_json::to_string_pretty(&snapshot)?
    } else {
        serde_json::to_string(&snapshot)?
    };
    println!("{output}");
    Ok(())
}
