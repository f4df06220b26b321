//! CLI binary for edgequake-docops.
//!
//! A thin shim over the library crate: maps flags onto
//! `OrchestratorConfig`, renders session events with indicatif and turns
//! Ctrl-C into a session cancel.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use edgequake_docops::{
    CatalogSource, HttpCatalogSource, HttpExchangeExecutor, JsonFileCatalogSource, JsonFileSink,
    NoticeLevel, OperationRequest, OrderedFileSet, Orchestrator, OrchestratorConfig,
    PriorityList, SessionEvent, SessionOutcome, SessionState, StaticCatalogSource,
    TechnologyCatalog, TechnologyId,
};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # List operation families and the engines that serve them
  docops families

  # Show, reorder and reset the engine priority for a family
  docops priority show compress
  docops priority swap-up compress 1
  docops priority reset compress

  # Compress a PDF, trying adobe first and falling back to pdf_lib
  docops run compress report.pdf \
      --endpoint adobe=https://adobe.internal.example \
      --endpoint pdf_lib=http://localhost:8081

  # Merge three files, moving the last one to the front first
  docops run merge a.pdf b.pdf c.pdf --move 2:0 --endpoint pdf_lib=http://localhost:8081

ENVIRONMENT VARIABLES:
  DOCOPS_CATALOG       Catalog JSON file or http(s) URL (default: builtin catalog)
  DOCOPS_PRIORITIES    Priority store file (default: docops-priorities.json)
  DOCOPS_TIMEOUT       Per-attempt exchange ceiling in seconds
  RUST_LOG             Override the log filter
"#;

/// Run document operations with engine fallback.
#[derive(Parser, Debug)]
#[command(
    name = "docops",
    version,
    about = "Run document operations against interchangeable engines with fallback",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Catalog JSON file or http(s) URL. Builtin catalog when unset.
    #[arg(long, global = true, env = "DOCOPS_CATALOG")]
    catalog: Option<String>,

    /// JSON file holding per-family engine priorities.
    #[arg(
        long,
        global = true,
        env = "DOCOPS_PRIORITIES",
        default_value = "docops-priorities.json"
    )]
    priorities: PathBuf,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DOCOPS_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors and the result.
    #[arg(short, long, global = true, env = "DOCOPS_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List operation families, their arity and capable engines.
    Families {
        /// Print the whole catalog as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Inspect or change the engine priority of a family.
    Priority {
        #[command(subcommand)]
        action: PriorityAction,
    },

    /// Run one operation.
    Run(RunArgs),
}

#[derive(Subcommand, Debug)]
enum PriorityAction {
    /// Print the current order.
    Show { family: String },
    /// Move the engine at INDEX one place up (0 is a no-op).
    SwapUp { family: String, index: usize },
    /// Restore the catalog default order.
    Reset { family: String },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Operation family, e.g. compress, merge, ocr.
    family: String,

    /// Input files, in order.
    files: Vec<PathBuf>,

    /// Engine endpoint as ID=BASE_URL. Repeatable.
    #[arg(long = "endpoint", value_parser = parse_endpoint)]
    endpoints: Vec<(TechnologyId, String)>,

    /// Operation parameters as a JSON object.
    #[arg(long)]
    params: Option<String>,

    /// Reorder inputs before running: FROM:TO (0-based). Repeatable.
    #[arg(long = "move", value_parser = parse_move)]
    moves: Vec<(usize, usize)>,

    /// Per-attempt exchange ceiling in seconds.
    #[arg(long, env = "DOCOPS_TIMEOUT", default_value_t = 300)]
    timeout: u64,

    /// Typical processing time in seconds (shapes the progress estimate).
    #[arg(long, env = "DOCOPS_EXPECTED_SECS", default_value_t = 30)]
    expected_secs: u64,

    /// Disable progress bar.
    #[arg(long, env = "DOCOPS_NO_PROGRESS")]
    no_progress: bool,

    /// Print the full outcome as JSON.
    #[arg(long)]
    json: bool,
}

fn parse_endpoint(s: &str) -> Result<(TechnologyId, String), String> {
    let (id, url) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=URL, got '{s}'"))?;
    if id.trim().is_empty() || url.trim().is_empty() {
        return Err(format!("expected ID=URL, got '{s}'"));
    }
    Ok((TechnologyId::new(id.trim()), url.trim().to_string()))
}

fn parse_move(s: &str) -> Result<(usize, usize), String> {
    let (from, to) = s
        .split_once(':')
        .ok_or_else(|| format!("expected FROM:TO, got '{s}'"))?;
    let from = from.trim().parse().map_err(|_| format!("invalid index '{from}'"))?;
    let to = to.trim().parse().map_err(|_| format!("invalid index '{to}'"))?;
    Ok((from, to))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Library logs drop to ERROR while the progress bar is on screen.
    let show_progress = match &cli.command {
        Command::Run(args) => !cli.quiet && !args.no_progress && !args.json,
        _ => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let source: Arc<dyn CatalogSource> = match &cli.catalog {
        Some(s) if s.starts_with("http://") || s.starts_with("https://") => {
            Arc::new(HttpCatalogSource::new(s.clone(), 30))
        }
        Some(path) => Arc::new(JsonFileCatalogSource::new(path)),
        None => Arc::new(StaticCatalogSource(TechnologyCatalog::builtin())),
    };

    match cli.command {
        Command::Families { json } => {
            let orchestrator =
                build(&cli.priorities, source, cli.catalog.is_some(), &[], None).await?;
            print_families(&orchestrator.catalog(), json)
        }
        Command::Priority { action } => {
            let orchestrator =
                build(&cli.priorities, source, cli.catalog.is_some(), &[], None).await?;
            let list = match action {
                PriorityAction::Show { family } => orchestrator.get_priority(&family),
                PriorityAction::SwapUp { family, index } => orchestrator.swap_up(&family, index),
                PriorityAction::Reset { family } => orchestrator.reset(&family),
            }
            .context("Priority update failed")?;
            print_priority(&orchestrator.catalog(), &list);
            Ok(())
        }
        Command::Run(args) => {
            let orchestrator = build(
                &cli.priorities,
                source,
                cli.catalog.is_some(),
                &args.endpoints,
                Some(&args),
            )
            .await?;
            run(&orchestrator, args, show_progress, cli.quiet).await
        }
    }
}

async fn build(
    priorities: &std::path::Path,
    source: Arc<dyn CatalogSource>,
    refresh: bool,
    endpoints: &[(TechnologyId, String)],
    run: Option<&RunArgs>,
) -> Result<Orchestrator> {
    let mut builder = OrchestratorConfig::builder().refresh_catalog_on_start(refresh);
    if let Some(args) = run {
        builder = builder
            .exchange_timeout_secs(args.timeout)
            .expected_processing_secs(args.expected_secs);
    }
    let config = builder.build().context("Invalid configuration")?;

    let mut executor = HttpExchangeExecutor::new().context("Failed to create HTTP client")?;
    for (id, url) in endpoints {
        executor = executor.with_endpoint(id.clone(), url.clone());
    }

    Orchestrator::from_source(
        config,
        source,
        Arc::new(executor),
        Arc::new(JsonFileSink::new(priorities)),
    )
    .await
    .context("Failed to initialise orchestrator")
}

fn print_families(catalog: &TechnologyCatalog, json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(catalog).context("Failed to serialise catalog")?;
        println!("{out}");
        return Ok(());
    }
    for spec in catalog.families() {
        let arity = match spec.max_inputs {
            Some(max) if max == spec.min_inputs => format!("{max}"),
            Some(max) => format!("{}–{}", spec.min_inputs, max),
            None => format!("{}+", spec.min_inputs),
        };
        let engines: Vec<String> = catalog
            .default_order(&spec.family)
            .iter()
            .map(|id| {
                let hard_stop = catalog
                    .technology(id)
                    .map(|t| t.fallback_policy(&spec.family))
                    == Some(edgequake_docops::FallbackPolicy::HardStop);
                if hard_stop {
                    format!("{id} (no fallback)")
                } else {
                    id.to_string()
                }
            })
            .collect();
        println!(
            "{:<20} {:<26} {} {}",
            bold(spec.family.as_str()),
            spec.label,
            dim(&format!("[{arity} input(s)]")),
            engines.join(" → ")
        );
    }
    Ok(())
}

fn print_priority(catalog: &TechnologyCatalog, list: &PriorityList) {
    println!("{}", bold(list.family().as_str()));
    for (i, id) in list.ids().iter().enumerate() {
        let label = catalog.technology(id).map(|t| t.label.as_str()).unwrap_or("");
        println!("  {i}. {id} {}", dim(label));
    }
}

// ── Run ──────────────────────────────────────────────────────────────────────

async fn run(
    orchestrator: &Orchestrator,
    args: RunArgs,
    show_progress: bool,
    quiet: bool,
) -> Result<()> {
    let catalog = orchestrator.catalog();
    let family = catalog.parse_family(&args.family)?;

    let mut files: OrderedFileSet<PathBuf> = args.files.into_iter().collect();
    for (from, to) in &args.moves {
        orchestrator
            .reorder(&mut files, *from, *to)
            .with_context(|| format!("Invalid move {from}:{to}"))?;
    }

    let mut request = OperationRequest::from_file_set(family, &files);
    if let Some(params) = &args.params {
        let params: serde_json::Value =
            serde_json::from_str(params).context("--params is not valid JSON")?;
        request = request.with_params(params);
    }

    let bar = if show_progress {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:>10.bold} [{bar:30.cyan/blue}] {pos:>3}% {elapsed_precise} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░"),
        );
        bar.set_prefix("admitted");
        bar.enable_steady_tick(Duration::from_millis(120));
        Some(bar)
    } else {
        None
    };

    let mut events = orchestrator.subscribe();
    let handle = orchestrator
        .admit_and_run(request)
        .context("Could not start operation")?;
    let session_id = handle.id();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut poll = tokio::time::interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            r = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                if r.is_ok() && orchestrator.cancel(&handle) {
                    if let Some(bar) = &bar {
                        bar.set_message(yellow("cancelling…"));
                    }
                }
            }
            event = events.next() => {
                let Some(event) = event else { break };
                if event.session_id() != session_id {
                    continue;
                }
                if render_event(bar.as_ref(), &event, quiet) {
                    break;
                }
            }
            _ = poll.tick() => {
                if handle.is_terminal() {
                    break;
                }
            }
        }
    }

    let outcome = handle.wait().await;
    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }

    if args.json {
        let out = serde_json::to_string_pretty(&outcome).context("Failed to serialise outcome")?;
        println!("{out}");
    }

    match outcome {
        SessionOutcome::Completed {
            technology,
            attempts,
            response,
        } => {
            if !args.json {
                let out = serde_json::to_string_pretty(&response.payload)
                    .context("Failed to serialise payload")?;
                io::stdout()
                    .write_all(format!("{out}\n").as_bytes())
                    .context("Failed to write to stdout")?;
            }
            if !quiet {
                eprintln!(
                    "{} via {} ({} attempt(s))",
                    green("✓ done"),
                    bold(technology.as_str()),
                    attempts
                );
            }
            Ok(())
        }
        SessionOutcome::Failed { reason, attempts } => {
            bail!("{} after {} attempt(s): {}", red("failed"), attempts, reason)
        }
        SessionOutcome::Cancelled { .. } => {
            if !quiet {
                eprintln!("{}", yellow("cancelled"));
            }
            std::process::exit(130);
        }
    }
}

/// Render one event. Returns `true` on the session's terminal notice.
fn render_event(bar: Option<&ProgressBar>, event: &SessionEvent, quiet: bool) -> bool {
    match event {
        SessionEvent::Transition(t) => {
            if let Some(bar) = bar {
                bar.set_prefix(t.to.to_string());
                if let Some(tech) = &t.technology {
                    bar.set_message(dim(tech.as_str()));
                }
                if t.to == SessionState::Processing && t.from == SessionState::Processing {
                    bar.set_position(0);
                }
            }
            false
        }
        SessionEvent::Progress(p) => {
            if let Some(bar) = bar {
                if p.upload_percent < 100 {
                    bar.set_position(u64::from(p.upload_percent));
                } else {
                    // processing percent is an estimate, not backend state
                    bar.set_position(u64::from(p.processing_percent));
                }
            }
            false
        }
        SessionEvent::Notice(n) => {
            if !n.terminal {
                let line = format!("{} {}", yellow("↻"), n.message);
                match bar {
                    Some(bar) => bar.println(line),
                    None if !quiet => eprintln!("{line}"),
                    None => {}
                }
                return false;
            }
            if let Some(bar) = bar {
                let marker = match n.level {
                    NoticeLevel::Success => green("✓"),
                    NoticeLevel::Error => red("✗"),
                    NoticeLevel::Cancelled => yellow("⊘"),
                    NoticeLevel::Info => dim("i"),
                };
                bar.println(format!("{marker} {}", n.message));
            }
            true
        }
    }
}
