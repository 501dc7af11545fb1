use anyhow::{Context, Result};
use clap::Parser;
use quill::chat::format_tokens;
use quill::coder::{Coder, CoderConfig};
use quill::config::Config;
use quill::edits::EditFormat;
use quill::ignorespec::ensure_default_spec_files;
use quill::model::HttpModelClient;
use quill::protocol::{FileOutcome, ProgressEvent};
use quill::repo::{Attribution, GitRepo};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "quill",
    about = "An AI pair-programming assistant for your repository",
    version
)]
struct Args {
    /// Path to the repository (defaults to current directory)
    #[arg(default_value = ".")]
    path: PathBuf,

    /// The change to request from the model
    #[arg(short, long)]
    message: String,

    /// Files to add to the chat as editable context
    #[arg(short, long)]
    file: Vec<PathBuf>,

    /// Files to add as read-only context
    #[arg(short = 'r', long)]
    read_only: Vec<PathBuf>,

    /// Edit format: search-replace, fenced-search-replace, udiff, wholefile, none
    #[arg(long)]
    format: Option<String>,

    /// Skip the automatic commit after applying edits
    #[arg(long)]
    no_auto_commit: bool,

    /// Run post-apply checks and let the model fix failures
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let settings = Config::load();

    let edit_format = match &args.format {
        Some(name) => EditFormat::from_name(name)
            .with_context(|| format!("Unknown edit format '{}'", name))?,
        None => EditFormat::from_name(&settings.edit_format).unwrap_or_default(),
    };

    let api_key = settings
        .api_key()
        .context("No API key found. Set QUILL_API_KEY or OPENAI_API_KEY.")?;
    let model: Arc<HttpModelClient> = Arc::new(HttpModelClient::new(
        &settings.api_url,
        &api_key,
        &settings.model,
        settings.context_window,
    ));

    let path = args.path.canonicalize()?;
    let repo = Arc::new(GitRepo::discover(
        &[path],
        Attribution {
            committer: settings.attribute_commits,
            author: settings.attribute_commits,
        },
        Some(model.clone()),
    )?);
    ensure_default_spec_files(repo.root())?;

    let config = CoderConfig {
        edit_format,
        auto_commit: settings.auto_commit && !args.no_auto_commit,
        max_repair_attempts: settings.max_repair_attempts,
        overflow_policy: settings.overflow_policy,
        run_checks: settings.run_checks || args.check,
        allow_new_files: true,
    };

    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            match event {
                ProgressEvent::Chunk(_) => {}
                ProgressEvent::RepairAttempt { attempt, max, reason } => {
                    eprintln!("retrying ({attempt}/{max}): {reason}");
                }
                ProgressEvent::ContextWarning { tokens, window } => {
                    eprintln!(
                        "warning: prompt is {} tokens against a {} window",
                        format_tokens(tokens),
                        format_tokens(window)
                    );
                }
                ProgressEvent::FileApplied { path, outcome } => match outcome {
                    FileOutcome::Applied { created: true } => {
                        eprintln!("created {}", path.display())
                    }
                    FileOutcome::Applied { created: false } => {
                        eprintln!("applied {}", path.display())
                    }
                    FileOutcome::Failed { reason } => {
                        eprintln!("failed {}: {}", path.display(), reason)
                    }
                },
                ProgressEvent::Committed(record) => {
                    eprintln!("commit {} {}", record.hash, record.message);
                }
                ProgressEvent::CheckFailed { name, .. } => {
                    eprintln!("check failed: {}", name);
                }
                ProgressEvent::Usage(usage) => {
                    tracing::debug!(
                        prompt = usage.prompt_tokens,
                        completion = usage.completion_tokens,
                        "usage"
                    );
                }
            }
        }
    });

    let mut coder = Coder::new(repo, model, config).with_progress(sender);
    for file in &args.file {
        coder.add_file(file)?;
    }
    for file in &args.read_only {
        coder.add_read_only_file(file);
    }

    let report = coder.submit(&args.message).await?;
    drop(coder);
    let _ = printer.await;

    println!("{}", report.response);
    let failures = report.failure_summary();
    if !failures.is_empty() {
        eprintln!("\nSome edits could not be applied:\n{}", failures);
    }
    eprintln!(
        "\ntokens: {} sent, {} received{}",
        format_tokens(report.usage.prompt_tokens as usize),
        format_tokens(report.usage.completion_tokens as usize),
        report
            .commit
            .map(|c| format!("; commit {}", c.hash))
            .unwrap_or_default()
    );

    Ok(())
}
