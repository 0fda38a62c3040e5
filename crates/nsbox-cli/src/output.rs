//! Formatted output helpers for CLI commands.
//!
//! Everything here writes to stderr; stdout carries the container's output.

use nsbox_runtime::RunReport;

/// Formats a byte count into a human-readable string (e.g., "128.0 MiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Renders the report as requested: JSON when `json`, otherwise one summary
/// line for runs that did not end cleanly.
pub fn render_report(report: &RunReport, json: bool) -> anyhow::Result<Option<String>> {
    if json {
        return Ok(Some(serde_json::to_string_pretty(report)?));
    }
    if report.status.success() && !report.oom_killed() {
        return Ok(None);
    }
    let mut line = format!("nsbox: {report}");
    if let Some(peak) = report.memory_peak_bytes() {
        line.push_str(&format!(", peak memory {}", format_bytes(peak)));
    }
    Ok(Some(line))
}

/// Prints the report to stderr.
pub fn print_report(report: &RunReport, json: bool) -> anyhow::Result<()> {
    if let Some(text) = render_report(report, json)? {
        eprintln!("{text}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use nsbox_common::types::{ContainerId, ExitStatus};

    use super::*;

    fn report(status: ExitStatus) -> RunReport {
        let now = Utc::now();
        RunReport {
            id: ContainerId::new("c1"),
            entrypoint: "sh -c exit 3".into(),
            host_pid: 99,
            status,
            exit_code: status.code(),
            metrics: None,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn format_bytes_displays_bytes() {
        assert_eq!(format_bytes(512), "512 B");
    }

    #[test]
    fn format_bytes_displays_kib() {
        assert_eq!(format_bytes(2048), "2.0 KiB");
    }

    #[test]
    fn format_bytes_displays_mib() {
        assert_eq!(format_bytes(52_428_800), "50.0 MiB");
    }

    #[test]
    fn format_bytes_displays_gib() {
        assert_eq!(format_bytes(2_147_483_648), "2.0 GiB");
    }

    #[test]
    fn clean_exit_prints_nothing() {
        let text = render_report(&report(ExitStatus::Exited(0)), false).expect("render");
        assert!(text.is_none());
    }

    #[test]
    fn failed_exit_is_summarised() {
        let text = render_report(&report(ExitStatus::Exited(3)), false)
            .expect("render")
            .expect("summary");
        assert!(text.contains("exited with code 3"));
    }

    #[test]
    fn json_report_is_always_printed() {
        let text = render_report(&report(ExitStatus::Exited(0)), true)
            .expect("render")
            .expect("json");
        let value: serde_json::Value = serde_json::from_str(&text).expect("valid json");
        assert_eq!(value["exit_code"], 0);
        assert_eq!(value["id"], "c1");
    }
}
