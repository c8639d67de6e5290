//! Long-running mode: fixtures from a scenario file, a background escalation
//! sweeper, and newline-delimited JSON commands on stdin.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use signoff_core::config::{AppConfig, LoadOptions};
use signoff_core::{AuditSink, NotificationDispatcher, OrgDirectory, TimerOutcome, WorkflowService};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::commands::CommandResult;
use crate::scenario::{Scenario, ScenarioStep, Session, StepReport};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub commands: usize,
    pub auto_rejected: usize,
}

pub fn run(path: &Path) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure("run", "config_validation", error.to_string(), 2)
        }
    };
    let scenario = match Scenario::from_path(path) {
        Ok(scenario) => scenario,
        Err(error) => return CommandResult::failure("run", error.code(), error.to_string(), 4),
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "run",
                "runtime",
                format!("failed to initialize async runtime: {error}"),
                6,
            )
        }
    };

    match runtime.block_on(serve(config, scenario)) {
        Ok(summary) => CommandResult::success(
            "run",
            format!(
                "processed {} commands; {} steps auto-rejected",
                summary.commands, summary.auto_rejected
            ),
        ),
        Err(error) => CommandResult::failure("run", "runtime", format!("{error:#}"), 6),
    }
}

async fn serve(config: AppConfig, scenario: Scenario) -> Result<RunSummary> {
    let mut session = Session::live(&scenario, &config)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(sweep_until(
        session.service(),
        Duration::from_secs(config.escalation.sweep_interval_secs),
        shutdown_rx,
    ));

    info!(
        event_name = "system.run.started",
        scenario = %scenario.name,
        sweep_interval_secs = config.escalation.sweep_interval_secs,
        "accepting commands on stdin"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut commands = 0;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let command = line.trim();
                if command.is_empty() {
                    continue;
                }
                commands += 1;
                let report = match serde_json::from_str::<ScenarioStep>(command) {
                    Ok(step) => session.apply(commands, &step),
                    Err(error) => StepReport::invalid(commands, session.now(), error.to_string()),
                };
                let mut encoded = serde_json::to_string(&report)?;
                encoded.push('\n');
                stdout.write_all(encoded.as_bytes()).await?;
                stdout.flush().await?;
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!(event_name = "system.run.interrupted", "ctrl-c received");
                break;
            }
        }
    }

    // Receiver may already be gone if the sweeper exited early.
    let _ = shutdown_tx.send(true);
    let auto_rejected = sweeper.await?;
    info!(event_name = "system.run.stopped", commands, auto_rejected, "run finished");

    Ok(RunSummary { commands, auto_rejected })
}

/// Fires due timers every `period` until `shutdown` flips to true. Returns
/// how many steps were auto-rejected.
pub async fn sweep_until<O, N, S>(
    service: Arc<WorkflowService<O, N, S>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> usize
where
    O: OrgDirectory,
    N: NotificationDispatcher,
    S: AuditSink,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut auto_rejected = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let fired = service.fire_due_timers(Utc::now());
                let rejected = fired
                    .iter()
                    .filter(|timer| timer.outcome == TimerOutcome::AutoRejected)
                    .count();
                auto_rejected += rejected;
                if !fired.is_empty() {
                    info!(
                        event_name = "escalation.sweep",
                        fired = fired.len(),
                        auto_rejected = rejected,
                        "escalation sweep fired timers"
                    );
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    warn!(event_name = "escalation.sweeper_orphaned", "shutdown sender dropped");
                    break;
                }
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    auto_rejected
}
