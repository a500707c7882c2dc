use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use flexi_logger::{Logger, LoggerHandle};
use temporal::RenderView;
use temporal::commands::{
    AddOptions, InitOptions, ScratchAddOptions, Session, SpanOptions, WhenOptions,
};
use temporal::storage::{DEFAULT_SCRATCH_DIR, FsStore, TIME_FILE};

#[derive(Debug, Parser)]
#[command(
    name = "temporal",
    about = "Keep a markdown time context: now, events behind and ahead, sequences and spans",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Time context document to operate on.
    #[arg(long, global = true, env = "TEMPORAL_FILE", default_value = TIME_FILE)]
    file: PathBuf,
    /// Directory holding scratch pads.
    #[arg(long, global = true, env = "TEMPORAL_SCRATCH_DIR", default_value = DEFAULT_SCRATCH_DIR)]
    scratch_dir: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a fresh time context document.
    Init(InitArgs),

    /// Update the NOW snapshot without touching events.
    Now(NowArgs),

    /// Add a named event.
    Add(AddArgs),

    /// Update NOW and recompute every event's distance and side.
    Refresh,

    /// Print the whole document.
    Show(ShowArgs),

    /// Print only events behind now.
    Past,

    /// Print only events ahead of now.
    Ahead,

    /// Remove an event and drop it from every sequence.
    Remove(RemoveArgs),

    /// Define or replace an ordered sequence of events.
    Seq(SeqArgs),

    /// Define or replace a named span.
    Span(SpanArgs),

    /// Work with throwaway scratch pads outside the project document.
    Scratch(ScratchArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    /// IANA timezone for the NOW snapshot.
    #[arg(long)]
    timezone: Option<String>,
    /// Overwrite an existing document.
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Args)]
struct NowArgs {
    /// Switch the stored timezone.
    #[arg(long)]
    timezone: Option<String>,
}

#[derive(Debug, Args, Clone, Default)]
struct WhenArgs {
    /// Relative duration such as "3 days" or "2 hours ago".
    #[arg(long = "in", value_name = "DURATION", allow_hyphen_values = true)]
    in_duration: Option<String>,
    /// Date such as 2026-02-20, "Feb 20 2026", tomorrow or "next monday".
    #[arg(long = "on", value_name = "DATE")]
    on_date: Option<String>,
    /// ISO datetime such as 2026-02-20T14:00:00Z.
    #[arg(long = "at", value_name = "DATETIME")]
    at_datetime: Option<String>,
}

impl From<WhenArgs> for WhenOptions {
    fn from(args: WhenArgs) -> Self {
        WhenOptions {
            in_duration: args.in_duration,
            on_date: args.on_date,
            at_datetime: args.at_datetime,
        }
    }
}

#[derive(Debug, Args)]
struct AddArgs {
    /// Event name, unique case-insensitively.
    event: Option<String>,
    #[command(flatten)]
    when: WhenArgs,
    /// Free-form category.
    #[arg(long = "type", value_name = "TYPE")]
    kind: Option<String>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Args)]
struct ShowArgs {
    /// Emit the parsed model as JSON instead of markdown.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct RemoveArgs {
    event: Option<String>,
}

#[derive(Debug, Args)]
struct SeqArgs {
    name: Option<String>,
    /// Event names in order; at least two.
    events: Vec<String>,
}

#[derive(Debug, Args)]
struct SpanArgs {
    name: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    from: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    to: Option<String>,
}

#[derive(Debug, Args)]
#[command(args_conflicts_with_subcommands = true)]
struct ScratchArgs {
    /// Label of the pad to create; without a subcommand this is `scratch create`.
    label: Option<String>,
    #[command(subcommand)]
    action: Option<ScratchAction>,
}

#[derive(Debug, Subcommand)]
enum ScratchAction {
    /// Create (or reset) a scratch pad.
    Create { label: Option<String> },
    /// Add an event to a scratch pad.
    Add(ScratchAddArgs),
    /// Print a scratch pad.
    Show(ScratchTarget),
    /// Delete a scratch pad.
    Clear(ScratchTarget),
}

#[derive(Debug, Args)]
struct ScratchAddArgs {
    event: Option<String>,
    #[command(flatten)]
    when: WhenArgs,
    #[command(flatten)]
    target: ScratchTarget,
}

#[derive(Debug, Args)]
struct ScratchTarget {
    /// Scratch pad label; omit for the default pad.
    #[arg(long = "scratch", value_name = "LABEL")]
    scratch: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _logger = init_logging(cli.verbose)?;

    let store = FsStore::new();
    let scratch_store = FsStore::no_follow();
    let warn = |message: &str| eprintln!("Warning: {message}");
    let session = Session {
        store: &store,
        scratch_store: &scratch_store,
        time_file: cli.file,
        scratch_dir: cli.scratch_dir,
        clock: Utc::now(),
        warn: &warn,
    };
    if cli.verbose {
        eprintln!(
            "Using {:?} (scratch pads in {:?})",
            session.time_file, session.scratch_dir
        );
    }

    match cli.command {
        Commands::Init(args) => handle_init(&session, args),
        Commands::Now(args) => emit(session.now(args.timezone.as_deref())?),
        Commands::Add(args) => handle_add(&session, args),
        Commands::Refresh => emit(session.refresh()?),
        Commands::Show(args) => handle_show(&session, args),
        Commands::Past => emit(session.show(RenderView::Past)?),
        Commands::Ahead => emit(session.show(RenderView::Ahead)?),
        Commands::Remove(args) => emit(session.remove(args.event)?),
        Commands::Seq(args) => emit(session.seq(args.name, args.events)?),
        Commands::Span(args) => handle_span(&session, args),
        Commands::Scratch(args) => handle_scratch(&session, args),
    }
}

fn init_logging(verbose: bool) -> Result<LoggerHandle> {
    let spec = if verbose { "debug" } else { "warn" };
    Logger::try_with_env_or_str(spec)
        .context("invalid log specification")?
        .format(flexi_logger::default_format)
        .start()
        .context("starting logger")
}

fn emit(rendered: String) -> Result<()> {
    print!("{rendered}");
    Ok(())
}

fn handle_init(session: &Session<'_>, args: InitArgs) -> Result<()> {
    let InitArgs { timezone, force } = args;
    let rendered = session.init(InitOptions { timezone, force })?;
    log::info!("initialized {:?}", session.time_file);
    emit(rendered)
}

fn handle_add(session: &Session<'_>, args: AddArgs) -> Result<()> {
    let AddArgs {
        event,
        when,
        kind,
        notes,
    } = args;
    emit(session.add(AddOptions {
        name: event,
        when: when.into(),
        kind,
        notes,
    })?)
}

fn handle_show(session: &Session<'_>, args: ShowArgs) -> Result<()> {
    if !args.json {
        return emit(session.show(RenderView::Full)?);
    }
    let context = session.load()?;
    let json = serde_json::to_string_pretty(&context).context("serializing time context")?;
    println!("{json}");
    Ok(())
}

fn handle_span(session: &Session<'_>, args: SpanArgs) -> Result<()> {
    let SpanArgs { name, from, to } = args;
    emit(session.span(SpanOptions { name, from, to })?)
}

fn handle_scratch(session: &Session<'_>, args: ScratchArgs) -> Result<()> {
    let action = args.action.unwrap_or(ScratchAction::Create { label: args.label });
    let rendered = match action {
        ScratchAction::Create { label } => session.scratch_create(label.as_deref())?,
        ScratchAction::Add(ScratchAddArgs {
            event,
            when,
            target,
        }) => session.scratch_add(ScratchAddOptions {
            name: event,
            when: when.into(),
            scratch: target.scratch,
        })?,
        ScratchAction::Show(target) => session.scratch_show(target.scratch.as_deref())?,
        ScratchAction::Clear(target) => session.scratch_clear(target.scratch.as_deref())?,
    };
    emit(rendered)
}
