use std::path::Path;

use serde::Serialize;
use signoff_core::config::{AppConfig, LoadOptions};

use crate::commands::CommandResult;
use crate::scenario::{InstanceReport, NotificationReport, Scenario, Session, StepReport};

pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_SCENARIO: u8 = 4;
pub const EXIT_UNMET_EXPECTATIONS: u8 = 5;

#[derive(Debug, Serialize)]
struct SimulationReport {
    scenario: String,
    unmet_expectations: usize,
    steps: Vec<StepReport>,
    instances: Vec<InstanceReport>,
    notifications: Vec<NotificationReport>,
}

pub fn run(path: &Path, json_output: bool) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure("simulate", "config_validation", error.to_string(), EXIT_CONFIG)
        }
    };
    let scenario = match Scenario::from_path(path) {
        Ok(scenario) => scenario,
        Err(error) => {
            return CommandResult::failure("simulate", error.code(), error.to_string(), EXIT_SCENARIO)
        }
    };
    let mut session = match Session::simulated(&scenario, &config) {
        Ok(session) => session,
        Err(error) => {
            return CommandResult::failure("simulate", error.code(), error.to_string(), EXIT_SCENARIO)
        }
    };

    let steps: Vec<StepReport> = scenario
        .steps
        .iter()
        .enumerate()
        .map(|(index, step)| session.apply(index + 1, step))
        .collect();
    let report = SimulationReport {
        scenario: scenario.name.clone(),
        unmet_expectations: steps.iter().filter(|step| !step.expectation_met).count(),
        steps,
        instances: session.instance_reports(),
        notifications: session.notification_reports(),
    };
    let exit_code = if report.unmet_expectations == 0 { 0 } else { EXIT_UNMET_EXPECTATIONS };

    if json_output {
        return match serde_json::to_string_pretty(&report) {
            Ok(output) => CommandResult::report(exit_code, output),
            Err(error) => CommandResult::failure("simulate", "serialization", error.to_string(), 1),
        };
    }

    CommandResult::report(exit_code, render_human(&report))
}

fn render_human(report: &SimulationReport) -> String {
    let mut lines = vec![format!("scenario: {}", report.scenario)];

    for step in &report.steps {
        let marker = if step.expectation_met { "ok" } else { "UNMET" };
        let outcome = match step.code {
            Some(code) => format!("{} [{code}]", step.status),
            None => step.status.to_string(),
        };
        lines.push(format!(
            "[{:>3}] {} {:<18} {:<10} {} ({marker})",
            step.index,
            step.at.format("%Y-%m-%d %H:%M"),
            step.action,
            outcome,
            step.message
        ));
    }

    lines.push("instances:".to_string());
    for instance in &report.instances {
        lines.push(format!(
            "- {} {} at step {} ({} decisions, replay {})",
            instance.alias,
            instance.summary.status.as_str(),
            instance.summary.current_step_order,
            instance.summary.decisions.len(),
            if instance.replay_matches { "matches" } else { "DIVERGES" }
        ));
    }

    lines.push(format!("notifications: {}", report.notifications.len()));
    if report.unmet_expectations > 0 {
        lines.push(format!("unmet expectations: {}", report.unmet_expectations));
    }

    lines.join("\n")
}
