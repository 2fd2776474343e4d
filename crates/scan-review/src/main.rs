use std::io::{self, BufRead, Write};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::FutureExt;
use scan_review::{
    models::Scan, AppConfig, BulkOutcome, ResumeChoice, ReviewContext, Severity,
};
use serde::Serialize;
use tracing::info;

#[derive(Parser)]
#[command(name = "scan-review", about = "Review state, workflows and scan comparison")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List imported scans, newest first.
    Scans,
    /// Show loaded workflows, or the one mapped to a plugin id.
    Workflows {
        #[arg(long)]
        plugin: Option<String>,
    },
    /// Review progress and per-severity counts of a scan.
    Progress { scan: String },
    /// Mark findings complete inside a review session of their scan.
    Mark {
        #[arg(long)]
        scan: String,
        #[arg(required = true)]
        findings: Vec<i64>,
        /// Skip the confirmation prompt for more than one finding.
        #[arg(long)]
        yes: bool,
    },
    /// Revert a completed finding to pending.
    Undo {
        #[arg(long)]
        scan: String,
        finding: i64,
    },
    /// Compare two scans by name or id.
    Compare {
        base: String,
        candidate: String,
        #[arg(long)]
        min_severity: Option<Severity>,
    },
    /// Every scan an address appears in, oldest first.
    History { ip_address: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::load()?;

    let (ctx, report) = ReviewContext::open(config)
        .await
        .context("failed to open review context")?;
    info!(workflows = report.total, "starting");

    match cli.command {
        Command::Scans => print_json(&ctx.store.list_scans().await?),
        Command::Workflows { plugin: None } => print_json(&ctx.workflows.get_all_workflows()),
        Command::Workflows { plugin: Some(id) } => match ctx.workflows.get_workflow(&id) {
            Some(workflow) => print_json(&workflow),
            None => bail!("no workflow mapped to plugin {id}"),
        },
        Command::Progress { scan } => {
            let scan = resolve_scan(&ctx, &scan).await?;
            #[derive(Serialize)]
            struct Progress {
                scan: Scan,
                progress: scan_review::store::ReviewProgress,
                by_severity: Vec<scan_review::store::SeverityBucket>,
            }
            print_json(&Progress {
                progress: ctx.store.review_progress(scan.scan_id).await?,
                by_severity: ctx.store.severity_buckets(scan.scan_id).await?,
                scan,
            })
        }
        Command::Mark { scan, findings, yes } => {
            let scan = resolve_scan(&ctx, &scan).await?;
            let (outcome, summary) = ctx
                .sessions()
                .run_review(scan.scan_id, |_| ResumeChoice::Resume, move |session| {
                    async move { session.bulk_mark_complete(&findings, |n| yes || confirm(n)).await }
                        .boxed()
                })
                .await?;
            if let BulkOutcome::Cancelled { requested } = &outcome {
                info!(requested, "nothing marked");
            }
            print_json(&serde_json::json!({ "outcome": outcome, "session": summary }))
        }
        Command::Undo { scan, finding } => {
            let scan = resolve_scan(&ctx, &scan).await?;
            let (transition, summary) = ctx
                .sessions()
                .run_review(scan.scan_id, |_| ResumeChoice::Resume, move |session| {
                    async move { session.undo_complete(finding).await }.boxed()
                })
                .await?;
            print_json(&serde_json::json!({ "transition": transition?, "session": summary }))
        }
        Command::Compare { base, candidate, min_severity } => {
            let base = resolve_scan(&ctx, &base).await?;
            let candidate = resolve_scan(&ctx, &candidate).await?;
            let comparison = ctx
                .comparator()
                .compare_scans(base.scan_id, candidate.scan_id, min_severity)
                .await?
                .context("scan disappeared during comparison")?;
            print_json(&comparison)
        }
        Command::History { ip_address } => {
            match ctx.comparator().get_host_vulnerability_history(&ip_address).await? {
                Some(history) => print_json(&history),
                None => bail!("host {ip_address} was not seen in any scan"),
            }
        }
    }
}

async fn resolve_scan(ctx: &ReviewContext, reference: &str) -> anyhow::Result<Scan> {
    let scan = match reference.parse::<i64>() {
        Ok(id) => ctx.store.get_scan(id).await?,
        Err(_) => ctx.store.get_scan_by_name(reference).await?,
    };
    scan.with_context(|| format!("scan {reference:?} not found"))
}

/// EOF or a read error counts as "no".
fn confirm(count: usize) -> bool {
    eprint!("Mark {count} findings as review complete? [y/N] ");
    if io::stderr().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    match io::stdin().lock().read_line(&mut answer) {
        Ok(0) | Err(_) => false,
        Ok(_) => matches!(answer.trim(), "y" | "Y" | "yes"),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    let out = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{out}");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .with_writer(io::stderr)
        .init();
}
