// Presentation layer: terminal prompts, spinners and the plain-text
// formatting used by the table-style commands. Everything here is small
// and synchronous; no command logic lives in this module.

use std::io;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use dialoguer::{Input, Password};
use indicatif::{ProgressBar, ProgressStyle};

use crate::jobs::LogLine;

/// Collects login credentials, prompting only for whatever was not given
/// on the command line.
pub fn prompt_login(
    email: Option<String>,
    password: Option<String>,
) -> io::Result<(String, String)> {
    let email = match email {
        Some(email) => email,
        None => Input::new().with_prompt("Email address").interact_text()?,
    };
    let password = match password {
        Some(password) => password,
        None => Password::new().with_prompt("Password").interact()?,
    };
    Ok((email, password))
}

/// A ticking spinner with a message, for calls that take a while.
pub fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template("{spinner} {msg}").unwrap());
    bar.enable_steady_tick(Duration::from_millis(120));
    bar.set_message(message.to_string());
    bar
}

/// Renders rows in aligned columns. With headers the table gets a dashed
/// rule under the header row; without, it is plain columns.
pub fn format_table(headers: Option<&[&str]>, rows: &[Vec<String>]) -> String {
    let columns = headers
        .map(|h| h.len())
        .or_else(|| rows.iter().map(|r| r.len()).max())
        .unwrap_or(0);
    let mut widths = vec![0usize; columns];
    if let Some(headers) = headers {
        for (i, header) in headers.iter().enumerate() {
            widths[i] = widths[i].max(header.len());
        }
    }
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let mut out = String::new();
    let mut push_row = |cells: &[String], out: &mut String| {
        let mut line = String::new();
        for (i, cell) in cells.iter().enumerate() {
            if i > 0 {
                line.push_str("  ");
            }
            line.push_str(cell);
            if i + 1 < cells.len() {
                for _ in cell.len()..widths[i] {
                    line.push(' ');
                }
            }
        }
        out.push_str(line.trim_end());
        out.push('\n');
    };

    if let Some(headers) = headers {
        let cells: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
        push_row(&cells, &mut out);
        let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        push_row(&rule, &mut out);
    }
    for row in rows {
        push_row(row, &mut out);
    }
    out
}

/// Parses the timestamp strings `ps` reports. The server is not entirely
/// consistent about the format, so a couple of spellings are accepted.
pub fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&t));
        }
    }
    None
}

/// Human-friendly "how long ago" rendering, for the WHEN column of `ps`.
pub fn datestr(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = (now - then).num_seconds();
    if seconds < 1 {
        return "Just now".to_string();
    }
    if seconds < 60 {
        return pluralize(seconds, "second");
    }
    let minutes = seconds / 60;
    if minutes < 60 {
        return pluralize(minutes, "minute");
    }
    let hours = minutes / 60;
    if hours < 24 {
        return pluralize(hours, "hour");
    }
    let days = hours / 24;
    if days < 30 {
        return pluralize(days, "day");
    }
    then.format("%d %b %Y").to_string()
}

fn pluralize(count: i64, unit: &str) -> String {
    if count == 1 {
        format!("1 {unit} ago")
    } else {
        format!("{count} {unit}s ago")
    }
}

/// Elapsed wall time between two instants, `H:MM:SS` with a day count
/// when it gets that far.
pub fn elapsed(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let mut seconds = (end - start).num_seconds().max(0);
    let days = seconds / 86_400;
    seconds %= 86_400;
    let hours = seconds / 3_600;
    let minutes = (seconds % 3_600) / 60;
    let secs = seconds % 60;
    match days {
        0 => format!("{hours}:{minutes:02}:{secs:02}"),
        1 => format!("1 day, {hours}:{minutes:02}:{secs:02}"),
        n => format!("{n} days, {hours}:{minutes:02}:{secs:02}"),
    }
}

/// Shortens long command strings for the `ps` table.
pub fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let cut: String = text.chars().take(width.saturating_sub(3)).collect();
    format!("{cut}...")
}

/// Renders one log line, optionally prefixed with its timestamp in local
/// time.
pub fn render_log_line(line: &LogLine, show_timestamp: bool) -> String {
    if !show_timestamp {
        return line.message.clone();
    }
    let stamp = Local
        .timestamp_opt(line.timestamp / 1000, 0)
        .single()
        .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_else(|| line.timestamp.to_string());
    format!("[{stamp}] {}", line.message)
}
