use clap::{Parser, Subcommand};
use settlement_sync::config::SyncConfig;
use settlement_sync::models::{RecordStatus, RecordType};
use settlement_sync::services::notify::FileNotifier;
use settlement_sync::services::orchestrator::{Orchestrator, RunOptions};
use settlement_sync::services::payloads::{GlMapping, JournalMode};
use settlement_sync::services::reconcile::{self, Reconciler};
use settlement_sync::services::remediation::Remediation;
use settlement_sync::services::repository::{CsvSettlementRepository, SettlementRepository};
use settlement_sync::services::tracking::{SettlementHistoryStore, TrackingStore};
use settlement_sync::services::txlog::TransactionLog;
use settlement_sync::services::zoho::ZohoClient;
use sync_core::observability::init_tracing;

#[derive(Parser)]
#[command(
    name = "settlement-sync",
    about = "Idempotent synchronization of Amazon settlement records to Zoho Books",
    version
)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Post settlements (journal, invoices, payments) to the remote ledger
    Sync {
        /// Settlement ids to sync; all local settlements when omitted
        settlements: Vec<String>,
        /// Walk the full path without remote writes or store updates
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        skip_invoices: bool,
        #[arg(long)]
        skip_payments: bool,
        /// Post the journal netted per GL account instead of one line per source row
        #[arg(long)]
        aggregate: bool,
        /// Post even when the journal is out of balance
        #[arg(long)]
        override_balance: bool,
    },
    /// Compare local records, tracking, and remote state; write a report
    Reconcile {
        /// Settlement ids to reconcile; all local settlements when omitted
        settlements: Vec<String>,
    },
    /// Delete settlements' remote records (payments, invoices, then journals)
    Reset {
        settlements: Vec<String>,
        #[arg(long)]
        dry_run: bool,
        /// Required to actually delete; without it only the plan is shown
        #[arg(long)]
        yes: bool,
    },
    /// Reverse a posted journal and post a corrected one
    ReverseRepost {
        settlement: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Show tracking and history counts
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = SyncConfig::from_env()?;
    init_tracing(&config.log_level, cli.json_logs);

    let txlog = TransactionLog::new(&config.storage.transaction_log);
    txlog.ensure_writable()?;
    let ledger = ZohoClient::new(
        config.zoho.clone(),
        config.policy.clone(),
        config.retry.clone(),
        txlog,
    );

    let repo = CsvSettlementRepository::new(&config.storage.data_dir);
    let mut tracking = TrackingStore::load(&config.storage.tracking_file)?;
    let mut history = SettlementHistoryStore::load(&config.storage.history_file)?;

    match cli.command {
        Command::Sync {
            settlements,
            dry_run,
            skip_invoices,
            skip_payments,
            aggregate,
            override_balance,
        } => {
            let gl_mapping = GlMapping::load(&config.storage.gl_mapping_file)?;
            let notifier =
                FileNotifier::new(config.storage.reports_dir.join("posting_alerts.jsonl"));
            let orchestrator =
                Orchestrator::new(&ledger, config.policy.clone(), gl_mapping, &notifier);

            let ids = resolve_ids(&repo, settlements)?;
            let opts = RunOptions {
                dry_run,
                post_journal: true,
                post_invoices: !skip_invoices,
                post_payments: !skip_invoices && !skip_payments,
                journal_mode: if aggregate {
                    JournalMode::Aggregated
                } else {
                    JournalMode::LineByLine
                },
                override_balance,
            };

            let summary = orchestrator
                .run(&repo, &mut tracking, &mut history, &ids, &opts)
                .await?;

            println!(
                "{}Processed {} settlement(s): {} journals, {} invoices, {} payments posted; \
                 {} adopted, {} conflicts, {} errors",
                if dry_run { "[DRY RUN] " } else { "" },
                summary.settlements_processed,
                summary.journals_posted,
                summary.invoices_posted,
                summary.payments_posted,
                summary.adopted,
                summary.conflicts,
                summary.errors.len(),
            );
            if !summary.is_clean() {
                for alert in &summary.errors {
                    eprintln!(
                        "  [{}] {} {}: {}",
                        alert.settlement_id, alert.stage, alert.identifier, alert.message
                    );
                }
                std::process::exit(1);
            }
        }

        Command::Reconcile { settlements } => {
            let reconciler = Reconciler::new(
                &ledger,
                config.policy.clone(),
                config.storage.reports_dir.clone(),
            );

            let ids = resolve_ids(&repo, settlements)?;
            let mut all_findings = Vec::new();
            let mut per_settlement = Vec::new();
            for id in &ids {
                let local = repo.load(id)?;
                let findings = reconciler.reconcile(&local).await?;
                all_findings.extend(findings.iter().cloned());
                per_settlement.push((id.clone(), findings));
            }
            all_findings.extend(reconcile::history_drift(&tracking, &history));

            let report = reconciler.write_report(&all_findings)?;
            let summary = reconcile::summarize(&per_settlement);
            let summary_report = reconciler.write_summary(&summary)?;
            println!(
                "Reconciled {} settlement(s): {} fully matched, {} with mismatches, \
                 {} with missing records, {} with orphans, {} drift finding(s)",
                summary.settlements,
                summary.fully_matched,
                summary.with_mismatches,
                summary.with_missing,
                summary.with_orphans,
                summary.drift_findings,
            );
            println!("Report: {}", report.display());
            println!("Summary: {}", summary_report.display());
        }

        Command::Reset {
            settlements,
            dry_run,
            yes,
        } => {
            anyhow::ensure!(!settlements.is_empty(), "at least one settlement id is required");
            let remediation =
                Remediation::new(&ledger, config.policy.clone(), GlMapping::default());

            // Destructive; require explicit confirmation for a live run.
            let effective_dry_run = dry_run || !yes;
            if effective_dry_run && !dry_run {
                println!("No --yes given; showing the plan only.");
            }

            let mut failed = false;
            for settlement in &settlements {
                let summary = remediation
                    .reset(&mut tracking, &mut history, settlement, effective_dry_run)
                    .await?;

                if summary.dry_run {
                    println!(
                        "[DRY RUN] {}: would delete {} record(s):",
                        settlement,
                        summary.planned.len()
                    );
                    for action in &summary.planned {
                        println!(
                            "  {} {} ({})",
                            action.record_type, action.identifier, action.remote_id
                        );
                    }
                } else {
                    println!(
                        "{}: deleted {} payment(s), {} invoice(s), {} journal(s)",
                        settlement,
                        summary.deleted_payments,
                        summary.deleted_invoices,
                        summary.deleted_journals
                    );
                    for failure in &summary.failures {
                        eprintln!("  failed: {}", failure);
                        failed = true;
                    }
                }
            }
            if failed {
                std::process::exit(1);
            }
        }

        Command::ReverseRepost {
            settlement,
            dry_run,
        } => {
            let gl_mapping = GlMapping::load(&config.storage.gl_mapping_file)?;
            let remediation = Remediation::new(&ledger, config.policy.clone(), gl_mapping);

            let local = repo.load(&settlement)?;
            let outcome = remediation
                .reverse_and_repost(&local, &mut tracking, &mut history, dry_run)
                .await?;

            if outcome.dry_run {
                println!("[DRY RUN] Would reverse and repost journal for {}", settlement);
            } else {
                println!(
                    "Reversal {} posted, corrected journal {}",
                    outcome.reversal_id.unwrap_or_default(),
                    outcome.new_journal_id.unwrap_or_default(),
                );
            }
        }

        Command::Status => print_status(&tracking, &history),
    }

    Ok(())
}

fn resolve_ids(
    repo: &CsvSettlementRepository,
    requested: Vec<String>,
) -> anyhow::Result<Vec<String>> {
    if requested.is_empty() {
        let ids = repo.list_settlements()?;
        anyhow::ensure!(!ids.is_empty(), "no local settlements found");
        Ok(ids)
    } else {
        Ok(requested)
    }
}

fn print_status(tracking: &TrackingStore, history: &SettlementHistoryStore) {
    for record_type in [RecordType::Journal, RecordType::Invoice, RecordType::Payment] {
        let mut posted = 0;
        let mut pending = 0;
        let mut error = 0;
        for row in tracking.bulk_load().iter().filter(|r| r.record_type == record_type) {
            match row.status {
                RecordStatus::Posted => posted += 1,
                RecordStatus::Pending => pending += 1,
                RecordStatus::Error => error += 1,
            }
        }
        println!(
            "{:<8} posted {:>5}  pending {:>4}  error {:>4}",
            record_type, posted, pending, error
        );
    }

    let synced = history.entries().iter().filter(|e| e.zoho_synced).count();
    println!(
        "settlements: {} tracked, {} synced",
        history.entries().len(),
        synced
    );
}
