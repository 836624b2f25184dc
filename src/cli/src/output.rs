//! Table formatting helpers for CLI output.

use comfy_table::{ContentArrangement, Table};
use hostlink_core::status::Status;

/// Create a styled table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// One row per worker: name, state, liveness error.
pub fn status_table(status: &Status) -> Table {
    let mut table = new_table(&["WORKER", "STATUS", "ERROR"]);
    for process in &status.processes {
        table.add_row(vec![
            process.name.clone(),
            if process.running { "running" } else { "stopped" }.to_string(),
            process.error.clone().unwrap_or_default(),
        ]);
    }
    table
}

/// Compact uptime such as `3d 4h`, `2h 5m` or `42s`.
pub fn format_uptime(
    started_at: &chrono::DateTime<chrono::Utc>,
    now: &chrono::DateTime<chrono::Utc>,
) -> String {
    let secs = now.signed_duration_since(*started_at).num_seconds().max(0);
    let (days, hours, mins) = (secs / 86_400, secs % 86_400 / 3600, secs % 3600 / 60);
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {mins}m")
    } else if mins > 0 {
        format!("{mins}m {}s", secs % 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use hostlink_core::status::ProcessStatus;

    #[test]
    fn test_new_table() {
        let table = new_table(&["A", "B"]);
        let rendered = table.to_string();
        assert!(rendered.contains('A'));
        assert!(rendered.contains('B'));
    }

    #[test]
    fn test_status_table_rows() {
        let status = Status {
            running: true,
            processes: vec![
                ProcessStatus {
                    name: "gvproxy".to_string(),
                    running: true,
                    error: None,
                },
                ProcessStatus {
                    name: "vmnet".to_string(),
                    running: false,
                    error: Some("vmnet is not running".to_string()),
                },
            ],
        };
        let rendered = status_table(&status).to_string();
        assert!(rendered.contains("gvproxy"));
        assert!(rendered.contains("running"));
        assert!(rendered.contains("vmnet is not running"));
    }

    #[test]
    fn test_format_uptime() {
        let now = Utc::now();
        assert_eq!(format_uptime(&now, &now), "0s");
        assert_eq!(format_uptime(&(now - Duration::seconds(42)), &now), "42s");
        assert_eq!(format_uptime(&(now - Duration::seconds(125)), &now), "2m 5s");
        assert_eq!(format_uptime(&(now - Duration::minutes(125)), &now), "2h 5m");
        assert_eq!(format_uptime(&(now - Duration::hours(76)), &now), "3d 4h");
    }

    #[test]
    fn test_format_uptime_future_start() {
        let now = Utc::now();
        assert_eq!(format_uptime(&(now + Duration::seconds(5)), &now), "0s");
    }
}
