//! Plain-text listings of mapped jobs
//!
//! The same block layout is used for the `run_summary.txt` file written
//! after every `map` and for the output of the query tool.

use chrono::{DateTime, Utc};
use flotilla_core::{TaskSnapshot, TaskStatus};
use regex::Regex;
use std::fmt;
use std::str::FromStr;

use crate::task::job_label;

const RULE: &str =
    "-------------------------------------------------------------------------------------";

/// Timestamp layout used throughout the listings
pub fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// `H:MM:SS[.ffffff]`, prefixed with `N day(s), ` for long runtimes
pub fn format_runtime(runtime: chrono::Duration) -> String {
    let micros = runtime.num_microseconds().unwrap_or(i64::MAX).max(0);
    let total_secs = micros / 1_000_000;
    let fraction = micros % 1_000_000;
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{} day{}, ", days, if days == 1 { "" } else { "s" }));
    }
    out.push_str(&format!("{}:{:02}:{:02}", hours, minutes, seconds));
    if fraction > 0 {
        out.push_str(&format!(".{:06}", fraction));
    }
    out
}

fn optional_time(time: &Option<DateTime<Utc>>) -> String {
    time.as_ref().map(format_timestamp).unwrap_or_default()
}

fn worker(job: &TaskSnapshot) -> &str {
    job.worker_name.as_deref().unwrap_or("")
}

fn push_completed(lines: &mut Vec<String>, job: &TaskSnapshot) {
    lines.push(format!("  Completed: {}", optional_time(&job.end_time)));
    if let Some(runtime) = job.runtime() {
        lines.push(format!("  Runtime:               {}", format_runtime(runtime)));
    }
    lines.push(format!("  Completed by worker: {}.", worker(job)));
}

fn push_errors(lines: &mut Vec<String>, job: &TaskSnapshot) {
    lines.push("  Incomplete. ERROR(S).".to_string());
    lines.push(format!("  Retried {} times.", job.attempts.len()));
}

/// Status lines of one job, without the `Job:` header
fn status_lines(job: &TaskSnapshot) -> Vec<String> {
    let mut lines = Vec::new();
    match job.start_time {
        Some(start) => {
            lines.push(format!("  Started:   {}", format_timestamp(&start)));
            if job.end_time.is_some() {
                push_completed(&mut lines, job);
            } else if !job.attempts.is_empty() {
                push_errors(&mut lines, job);
            } else {
                lines.push("  Incomplete.".to_string());
                lines.push(format!("  Run by {}.", worker(job)));
            }
        }
        None if !job.attempts.is_empty() => push_errors(&mut lines, job),
        None => lines.push("  Not started.".to_string()),
    }
    lines
}

fn push_block(out: &mut String, mut lines: Vec<String>) {
    lines.push("\n".to_string());
    out.push_str(&lines.join("\n"));
}

/// Render the run summary of every batch mapped so far
pub fn format_jobs_summary(batches: &[Vec<TaskSnapshot>], now: DateTime<Utc>) -> String {
    let jobs: Vec<&TaskSnapshot> = batches.iter().flatten().collect();
    let mut out = format!(
        "{}: Listing {} jobs registered with the server.\n{}\n",
        format_timestamp(&now),
        jobs.len(),
        RULE
    );

    for job in &jobs {
        let mut lines = vec![format!("Job: {}", job_label(&job.description))];
        lines.extend(status_lines(job));
        push_block(&mut out, lines);
    }

    out.push_str(RULE);
    out.push('\n');
    out.push_str(&format!("{}: Listed {} jobs\n", format_timestamp(&now), jobs.len()));
    out
}

/// Which jobs the query tool lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayFilter {
    #[default]
    All,
    /// Started and not finished
    Running,
    Completed,
    /// No result yet
    Incomplete,
    /// At least one failed attempt
    Errors,
}

impl fmt::Display for DisplayFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DisplayFilter::All => "all",
            DisplayFilter::Running => "running",
            DisplayFilter::Completed => "completed",
            DisplayFilter::Incomplete => "incomplete",
            DisplayFilter::Errors => "errors",
        };
        f.write_str(name)
    }
}

impl FromStr for DisplayFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" | "a" => Ok(DisplayFilter::All),
            "running" | "r" => Ok(DisplayFilter::Running),
            "completed" | "c" => Ok(DisplayFilter::Completed),
            "incomplete" | "i" => Ok(DisplayFilter::Incomplete),
            "errors" | "e" => Ok(DisplayFilter::Errors),
            other => Err(format!(
                "unknown display filter '{}' (expected all, running, completed, incomplete or errors)",
                other
            )),
        }
    }
}

/// Options of a query listing
#[derive(Debug, Clone, Default)]
pub struct ListingOptions {
    pub display: DisplayFilter,
    /// Stop after this many listed jobs
    pub max: Option<usize>,
    /// Only list jobs whose label matches
    pub pattern: Option<Regex>,
    /// Print the full task description under each job
    pub show_descriptions: bool,
}

fn listing_lines(job: &TaskSnapshot, display: DisplayFilter) -> Option<Vec<String>> {
    let mut lines = Vec::new();
    match display {
        DisplayFilter::All => lines.extend(status_lines(job)),
        DisplayFilter::Running => {
            if job.status() != TaskStatus::Running {
                return None;
            }
            lines.push(format!("  Started:   {}", optional_time(&job.start_time)));
            lines.push("  Incomplete.".to_string());
            lines.push(format!("  Run by {}.", worker(job)));
        }
        DisplayFilter::Completed => {
            if job.status() != TaskStatus::Completed {
                return None;
            }
            lines.push(format!("  Started:   {}", optional_time(&job.start_time)));
            push_completed(&mut lines, job);
        }
        DisplayFilter::Incomplete => {
            if job.resolved {
                return None;
            }
            match job.start_time {
                Some(start) => {
                    lines.push(format!("  Started:   {}", format_timestamp(&start)));
                    lines.push(if job.attempts.is_empty() {
                        "  Incomplete.".to_string()
                    } else {
                        "  Incomplete. ERROR(S).".to_string()
                    });
                    if job.worker_name.is_some() {
                        lines.push(format!("  Run by {}.", worker(job)));
                    }
                }
                None => {
                    lines.push("  Not started.".to_string());
                    if !job.attempts.is_empty() {
                        lines.push("  Incomplete. ERROR(S).".to_string());
                    }
                }
            }
        }
        DisplayFilter::Errors => {
            if job.attempts.is_empty() {
                return None;
            }
            lines.push(format!("  Attempted {} times with result(s):", job.attempts.len()));
            for attempt in &job.attempts {
                lines.push(format!(
                    "  Attempt at worker {}\n  at time {}.",
                    attempt.worker_name,
                    optional_time(&attempt.start_time)
                ));
                lines.push(format!("  Received error message:\n{}", attempt.error));
            }
        }
    }
    Some(lines)
}

/// Render the query tool's listing of the jobs registered at `address`
pub fn format_listing(
    batches: &[Vec<TaskSnapshot>],
    address: &str,
    options: &ListingOptions,
    now: DateTime<Utc>,
) -> String {
    let jobs: Vec<&TaskSnapshot> = batches.iter().flatten().collect();
    let mut out = format!(
        "{}: Listing '{}' out of {} jobs currently registered\n                            at the server with address: {}.\n",
        format_timestamp(&now),
        options.display,
        jobs.len(),
        address
    );
    if let Some(pattern) = &options.pattern {
        out.push_str(&format!(
            "                            Filtering listing using regex: '{}'.\n",
            pattern.as_str()
        ));
    }
    out.push_str(RULE);
    out.push('\n');

    let mut listed = 0;
    for job in &jobs {
        if options.max.is_some_and(|max| listed >= max) {
            break;
        }
        let label = job_label(&job.description);
        if let Some(pattern) = &options.pattern {
            if !pattern.is_match(&label) {
                continue;
            }
        }
        let Some(status) = listing_lines(job, options.display) else {
            continue;
        };

        let mut lines = vec![format!("Job: {}", label)];
        if options.show_descriptions {
            lines.push(format!("  Description: {}", job.description));
        }
        lines.extend(status);
        push_block(&mut out, lines);
        listed += 1;
    }

    out.push_str(RULE);
    out.push('\n');
    out.push_str(&format!(
        "Finished listing {} jobs matching criteria '{}' out of {} registered jobs\n",
        listed,
        options.display,
        jobs.len()
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flotilla_core::AttemptRecord;
    use serde_json::json;

    fn at(secs: u32, micros: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, secs).unwrap()
            + chrono::Duration::microseconds(micros as i64)
    }

    fn job(name: &str) -> TaskSnapshot {
        TaskSnapshot {
            description: json!({"name": name, "reads": format!("{}.fq", name)}).to_string(),
            worker_name: None,
            start_time: None,
            end_time: None,
            attempts: Vec::new(),
            resolved: false,
        }
    }

    fn sample_batches() -> Vec<Vec<TaskSnapshot>> {
        let mut done = job("done");
        done.worker_name = Some("node-1:4100".to_string());
        done.start_time = Some(at(0, 0));
        done.end_time = Some(at(5, 250_000));
        done.resolved = true;

        let mut running = job("running");
        running.worker_name = Some("local".to_string());
        running.start_time = Some(at(1, 0));

        let mut failed = job("failed");
        failed.attempts = vec![
            AttemptRecord {
                worker_name: "local".to_string(),
                start_time: Some(at(2, 0)),
                error: "exit status 1".to_string(),
            },
            AttemptRecord {
                worker_name: "node-1:4100".to_string(),
                start_time: Some(at(3, 0)),
                error: "exit status 1".to_string(),
            },
        ];
        failed.resolved = true;

        vec![vec![done, running], vec![failed, job("waiting")]]
    }

    #[test]
    fn test_runtime_format() {
        assert_eq!(format_runtime(chrono::Duration::seconds(5)), "0:00:05");
        assert_eq!(format_runtime(chrono::Duration::milliseconds(3_723_500)), "1:02:03.500000");
        assert_eq!(
            format_runtime(chrono::Duration::days(2) + chrono::Duration::seconds(61)),
            "2 days, 0:01:01"
        );
        assert_eq!(format_runtime(chrono::Duration::days(1)), "1 day, 0:00:00");
    }

    #[test]
    fn test_jobs_summary_blocks() {
        let text = format_jobs_summary(&sample_batches(), at(10, 0));
        let expected = "\
2024-03-01 12:00:10.000000: Listing 4 jobs registered with the server.
-------------------------------------------------------------------------------------
Job: done
  Started:   2024-03-01 12:00:00.000000
  Completed: 2024-03-01 12:00:05.250000
  Runtime:               0:00:05.250000
  Completed by worker: node-1:4100.

Job: running
  Started:   2024-03-01 12:00:01.000000
  Incomplete.
  Run by local.

Job: failed
  Incomplete. ERROR(S).
  Retried 2 times.

Job: waiting
  Not started.

-------------------------------------------------------------------------------------
2024-03-01 12:00:10.000000: Listed 4 jobs
";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_empty_summary() {
        let text = format_jobs_summary(&[], at(0, 0));
        assert!(text.contains("Listing 0 jobs"));
        assert!(text.ends_with("Listed 0 jobs\n"));
    }

    #[test]
    fn test_listing_filters() {
        let batches = sample_batches();
        let now = at(10, 0);

        let completed = ListingOptions {
            display: DisplayFilter::Completed,
            ..Default::default()
        };
        let text = format_listing(&batches, "tcp://127.0.0.1:4000", &completed, now);
        assert!(text.contains("Job: done"));
        assert!(!text.contains("Job: running"));
        assert!(text.contains("Finished listing 1 jobs matching criteria 'completed' out of 4 registered jobs"));

        let incomplete = ListingOptions {
            display: DisplayFilter::Incomplete,
            ..Default::default()
        };
        let text = format_listing(&batches, "tcp://127.0.0.1:4000", &incomplete, now);
        assert!(text.contains("Job: running"));
        assert!(text.contains("Job: waiting"));
        assert!(!text.contains("Job: failed"));

        let errors = ListingOptions {
            display: DisplayFilter::Errors,
            show_descriptions: true,
            ..Default::default()
        };
        let text = format_listing(&batches, "tcp://127.0.0.1:4000", &errors, now);
        assert!(text.contains("  Attempted 2 times with result(s):"));
        assert!(text.contains("  Attempt at worker node-1:4100\n  at time 2024-03-01 12:00:03.000000."));
        assert!(text.contains("  Received error message:\nexit status 1"));
        assert!(text.contains("failed.fq"));
    }

    #[test]
    fn test_listing_max_and_pattern() {
        let batches = sample_batches();
        let options = ListingOptions {
            max: Some(1),
            pattern: Some(Regex::new("^(running|waiting)$").unwrap()),
            ..Default::default()
        };
        let text = format_listing(&batches, "tcp://127.0.0.1:4000", &options, at(10, 0));
        assert!(text.contains("Filtering listing using regex: '^(running|waiting)$'."));
        assert!(text.contains("Job: running"));
        assert!(!text.contains("Job: waiting"));
        assert!(text.contains("Finished listing 1 jobs matching criteria 'all' out of 4 registered jobs"));
    }

    #[test]
    fn test_display_filter_parsing() {
        assert_eq!("errors".parse::<DisplayFilter>().unwrap(), DisplayFilter::Errors);
        assert_eq!("R".parse::<DisplayFilter>().unwrap(), DisplayFilter::Running);
        assert!("sideways".parse::<DisplayFilter>().is_err());
        assert_eq!(DisplayFilter::Incomplete.to_string(), "incomplete");
    }
}
