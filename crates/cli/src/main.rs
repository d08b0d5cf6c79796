//! `stepflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `status`: report the status of dispatched tasks.
//! - `kill`: stop pending or running tasks.
//! - `purge`: remove task markers.
//! - `execute`: run one task from the task store (the worker side of a
//!   marker-backed remote queue).

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::{ArgAction, Parser, Subcommand};
use dispatch::{run_marked_task, DispatchError};
use eval::shell::ShellEvaluator;
use tasks::{
    AgeFilter, MonitorConfig, PurgeOptions, TaskFilter, TaskMonitor, TaskReport, TaskStatus,
    TaskStore,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "stepflow",
    about = "Inspect and run tasks dispatched by workflow steps",
    version
)]
struct Cli {
    /// Directory holding stepflow state; tasks live in `<home>/tasks`.
    #[arg(long, env = "STEPFLOW_HOME", global = true)]
    home: Option<PathBuf>,

    /// Raise the log level (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Report the status of tasks.
    Status {
        /// Task ids or id prefixes; all tasks when omitted.
        ids: Vec<String>,
        /// 0: status only, 1: id and status, 2: also age and tags.
        #[arg(short = 'v', long = "verbosity", default_value_t = 1)]
        verbosity: u8,
        /// Only tasks at least (`3d`) or at most (`-3d`) this old.
        #[arg(long)]
        age: Option<AgeFilter>,
        #[arg(long, num_args = 1..)]
        tags: Vec<String>,
        #[arg(long = "status", num_args = 1..)]
        statuses: Vec<TaskStatus>,
    },
    /// Stop pending or running tasks.
    Kill {
        /// Task ids or id prefixes; all tasks when neither ids nor tags are given.
        ids: Vec<String>,
        #[arg(long, num_args = 1..)]
        tags: Vec<String>,
    },
    /// Remove the markers of tasks.
    Purge {
        ids: Vec<String>,
        /// Remove the whole task store.
        #[arg(long, conflicts_with_all = ["ids", "age", "statuses", "tags"])]
        all: bool,
        #[arg(long)]
        age: Option<AgeFilter>,
        #[arg(long = "status", num_args = 1..)]
        statuses: Vec<TaskStatus>,
        #[arg(long, num_args = 1..)]
        tags: Vec<String>,
    },
    /// Run a task and write its result marker.
    Execute {
        id: String,
        /// Shell used to run the task script.
        #[arg(long, default_value = "sh")]
        shell: String,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn monitor_config(home: Option<PathBuf>) -> MonitorConfig {
    let root = home.map_or_else(TaskStore::default_root, |home| home.join("tasks"));
    MonitorConfig {
        root,
        ..MonitorConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

fn format_age(seconds: f64) -> String {
    let seconds = seconds.max(0.0) as u64;
    match seconds {
        s if s < 60 => format!("{s}s"),
        s if s < 3_600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3_600),
        s => format!("{}d", s / 86_400),
    }
}

fn report_line(report: &TaskReport, verbosity: u8, now: f64) -> String {
    match verbosity {
        0 => report.status.to_string(),
        1 => format!("{}\t{}", report.id, report.status),
        _ => {
            let created = report.created.map_or_else(
                || "-".to_string(),
                |created| {
                    let stamp = DateTime::from_timestamp(created as i64, 0)
                        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_default();
                    format!("{stamp} ({} ago)", format_age(now - created))
                },
            );
            format!(
                "{}\t{}\t{}\t{}",
                report.id,
                report.status,
                created,
                report.tags.join(",")
            )
        }
    }
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn run(cli: Cli) -> Result<ExitCode> {
    let config = monitor_config(cli.home);
    let interval = config.interval;
    let monitor = TaskMonitor::new(config);

    match cli.command {
        Command::Status {
            ids,
            verbosity,
            age,
            tags,
            statuses,
        } => {
            let filter = TaskFilter {
                age,
                tags,
                statuses,
            };
            let reports = monitor
                .check_tasks(&ids, &filter)
                .context("failed to check task status")?;
            let now = now_secs();
            for report in &reports {
                println!("{}", report_line(report, verbosity, now));
            }
        }
        Command::Kill { ids, tags } => {
            if ids.is_empty() && tags.is_empty() {
                info!("killing all tasks");
            }
            let killed = monitor
                .kill_tasks(&ids, &tags)
                .context("failed to kill tasks")?;
            for (id, status) in &killed {
                println!("{id}\t{status}");
            }
        }
        Command::Purge {
            ids,
            all,
            age,
            statuses,
            tags,
        } => {
            let options = PurgeOptions {
                ids,
                all,
                filter: TaskFilter {
                    age,
                    tags,
                    statuses,
                },
            };
            let summary = monitor
                .purge_tasks(&options)
                .context("failed to purge tasks")?;
            info!(
                "{} task(s) purged, {} file(s) removed",
                summary.tasks.len(),
                summary.removed_files
            );
            if summary.failures > 0 {
                warn!("{} file(s) could not be removed", summary.failures);
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Execute { id, shell } => {
            let evaluator = ShellEvaluator::new(shell);
            match run_marked_task(monitor.store(), &id, &evaluator, interval) {
                Ok(result) => {
                    let code = u8::try_from(result.ret_code).unwrap_or(1);
                    return Ok(ExitCode::from(code));
                }
                Err(DispatchError::Killed(id)) => {
                    warn!("task {id} was killed");
                    return Ok(ExitCode::FAILURE);
                }
                Err(e) => return Err(e).with_context(|| format!("failed to execute task {id}")),
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(created: Option<f64>) -> TaskReport {
        TaskReport {
            id: "0123456789abcdef".into(),
            status: TaskStatus::Completed,
            created,
            tags: vec!["align".into(), "nightly".into()],
        }
    }

    #[test]
    fn status_lines_follow_verbosity() {
        let report = report(Some(1_000.0));
        assert_eq!(report_line(&report, 0, 1_000.0), "completed");
        assert_eq!(report_line(&report, 1, 1_000.0), "0123456789abcdef\tcompleted");

        let detailed = report_line(&report, 2, 1_000.0 + 7_200.0);
        assert!(detailed.contains("(2h ago)"));
        assert!(detailed.ends_with("align,nightly"));
    }

    #[test]
    fn unknown_ids_have_no_age() {
        let line = report_line(&report(None), 2, 0.0);
        assert_eq!(line.split('\t').nth(2), Some("-"));
    }

    #[test]
    fn ages_use_the_largest_unit() {
        assert_eq!(format_age(-3.0), "0s");
        assert_eq!(format_age(59.0), "59s");
        assert_eq!(format_age(61.0), "1m");
        assert_eq!(format_age(90_000.0), "1d");
    }

    #[test]
    fn arguments_parse() {
        let cli = Cli::try_parse_from([
            "stepflow", "-vv", "--home", "/tmp/sf", "status", "ab", "-v", "2", "--age", "-1d",
            "--status", "failed", "running",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.home, Some(PathBuf::from("/tmp/sf")));
        match cli.command {
            Command::Status {
                ids,
                verbosity,
                age,
                statuses,
                ..
            } => {
                assert_eq!(ids, vec!["ab"]);
                assert_eq!(verbosity, 2);
                assert!(age.unwrap().matches(3_600.0));
                assert_eq!(statuses, vec![TaskStatus::Failed, TaskStatus::Running]);
            }
            _ => panic!("expected status"),
        }

        assert!(Cli::try_parse_from(["stepflow", "purge", "--all", "ab"]).is_err());
    }

    #[test]
    fn home_selects_the_task_root() {
        let config = monitor_config(Some(PathBuf::from("/data/stepflow")));
        assert_eq!(config.root, PathBuf::from("/data/stepflow/tasks"));
    }

    #[test]
    fn kill_without_ids_targets_every_task() {
        let home = tempfile::tempdir().unwrap();
        let root = home.path().join("tasks");
        let store = TaskStore::new(&root);
        for id in ["aa01", "bb01"] {
            store
                .write_definition(&tasks::TaskDefinition {
                    id: id.into(),
                    script: "run".into(),
                    global_def: String::new(),
                    namespace: eval::NamespaceSnapshot::default(),
                    tags: Vec::new(),
                    workdir: None,
                    created_at: chrono::Utc::now(),
                })
                .unwrap();
        }
        let cli = Cli::try_parse_from([
            "stepflow",
            "--home",
            home.path().to_str().unwrap(),
            "kill",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Kill { ref ids, ref tags } if ids.is_empty() && tags.is_empty()
        ));
        assert_eq!(run(cli).unwrap(), ExitCode::SUCCESS);

        let monitor = TaskMonitor::new(monitor_config(Some(home.path().to_path_buf())));
        for id in ["aa01", "bb01"] {
            let entry = monitor.check_task(id, None).unwrap().unwrap();
            assert_eq!(entry.status, TaskStatus::Aborted);
        }
    }

    #[test]
    fn execute_without_a_definition_fails() {
        let home = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "stepflow",
            "--home",
            home.path().to_str().unwrap(),
            "execute",
            "deadbeef",
        ])
        .unwrap();
        assert!(run(cli).is_err());
    }
}
