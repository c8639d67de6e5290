use std::path::{Path, PathBuf};

use serde::Serialize;
use signoff_core::config::{AppConfig, LoadOptions};

use crate::commands::CommandResult;
use crate::scenario::{Scenario, Session};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool, scenarios: &[PathBuf]) -> CommandResult {
    let report = build_report(scenarios);
    let exit_code = if report.overall_status == CheckStatus::Fail { 3 } else { 0 };

    if json_output {
        let output = serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
        return CommandResult::report(exit_code, output);
    }

    CommandResult::report(exit_code, render_human(&report))
}

fn build_report(scenarios: &[PathBuf]) -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation".to_string(),
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(DoctorCheck {
                name: "approver_chain".to_string(),
                status: CheckStatus::Pass,
                details: format!(
                    "unit-scoped setups default to {} -> {}",
                    config.workflow.lead_role, config.workflow.manager_role
                ),
            });
            if scenarios.is_empty() {
                checks.push(DoctorCheck {
                    name: "scenario_files".to_string(),
                    status: CheckStatus::Skipped,
                    details: "no scenario file given (use --scenario)".to_string(),
                });
            }
            checks.extend(scenarios.iter().map(|path| check_scenario(path, &config)));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation".to_string(),
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            checks.push(DoctorCheck {
                name: "scenario_files".to_string(),
                status: CheckStatus::Skipped,
                details: "skipped because configuration did not load".to_string(),
            });
        }
    }

    let any_failed = checks.iter().any(|check| check.status == CheckStatus::Fail);
    let overall_status = if any_failed { CheckStatus::Fail } else { CheckStatus::Pass };
    let summary = if any_failed {
        "doctor: one or more readiness checks failed".to_string()
    } else {
        "doctor: all readiness checks passed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

/// Parses the scenario and loads its fixtures into a scratch service, so
/// overlapping setups and invalid delegations surface before a run.
fn check_scenario(path: &Path, config: &AppConfig) -> DoctorCheck {
    let name = format!("scenario:{}", path.display());
    let loaded = Scenario::from_path(path)
        .and_then(|scenario| Session::simulated(&scenario, config).map(|_| scenario));

    match loaded {
        Ok(scenario) => DoctorCheck {
            name,
            status: CheckStatus::Pass,
            details: format!(
                "`{}`: {} employees, {} setups, {} delegations, {} steps",
                scenario.name,
                scenario.employees.len(),
                scenario.setups.len(),
                scenario.delegations.len(),
                scenario.steps.len()
            ),
        },
        Err(error) => DoctorCheck {
            name,
            status: CheckStatus::Fail,
            details: format!("{} ({})", error, error.code()),
        },
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
