//! Run progress reporting.
//!
//! Reports observable progress during `rumah run` so operators see which
//! (query, page) units are being fetched and how many are left. Progress is
//! emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for a pipeline run.
#[derive(Clone, Debug, PartialEq)]
pub enum RunProgressEvent {
    /// A unit is being fetched.
    Fetching {
        source: String,
        query: String,
        page: u32,
    },
    /// `done` of `total` units finished for a source.
    Processed {
        source: String,
        done: u64,
        total: u64,
        records: u64,
    },
}

/// Reports run progress. Implementations write to stderr (human or JSON).
pub trait RunProgressReporter: Send + Sync {
    fn report(&self, event: RunProgressEvent);
}

/// Human-friendly progress on stderr: "run rumah123  12 / 34 pages  1,208 records".
pub struct StderrProgress;

impl RunProgressReporter for StderrProgress {
    fn report(&self, event: RunProgressEvent) {
        let line = match &event {
            RunProgressEvent::Fetching {
                source,
                query,
                page,
            } => format!("run {}  fetching {} page {}\n", source, query, page),
            RunProgressEvent::Processed {
                source,
                done,
                total,
                records,
            } => format!(
                "run {}  {} / {} pages  {} records\n",
                source,
                format_number(*done),
                format_number(*total),
                format_number(*records)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl RunProgressReporter for JsonProgress {
    fn report(&self, event: RunProgressEvent) {
        let obj = match &event {
            RunProgressEvent::Fetching {
                source,
                query,
                page,
            } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "fetching",
                "query": query,
                "page": page
            }),
            RunProgressEvent::Processed {
                source,
                done,
                total,
                records,
            } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "processed",
                "done": done,
                "total": total,
                "records": records
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl RunProgressReporter for NoProgress {
    fn report(&self, _event: RunProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn RunProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_get_thousands_separators() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
