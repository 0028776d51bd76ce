//! Scan and refine progress reporting.
//!
//! Reports observable progress during `snaplog scan` and `snaplog refine` so
//! users can see how many heights have been fetched and how many changes are
//! left to refine. Progress is emitted on **stderr** so stdout remains
//! parseable for scripts.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Sample heights fetched so far, out of total.
    Fetching { n: u64, total: u64 },
    /// Adjacent sample pairs compared so far, out of total.
    Comparing { n: u64, total: u64 },
    /// Approximate changes refined so far, out of total.
    Refining { n: u64, total: u64 },
}

impl ProgressEvent {
    fn phase(&self) -> &'static str {
        match self {
            ProgressEvent::Fetching { .. } => "fetching",
            ProgressEvent::Comparing { .. } => "comparing",
            ProgressEvent::Refining { .. } => "refining",
        }
    }

    fn counts(&self) -> (u64, u64) {
        match *self {
            ProgressEvent::Fetching { n, total }
            | ProgressEvent::Comparing { n, total }
            | ProgressEvent::Refining { n, total } => (n, total),
        }
    }

    fn unit(&self) -> &'static str {
        match self {
            ProgressEvent::Fetching { .. } => "heights",
            ProgressEvent::Comparing { .. } => "pairs",
            ProgressEvent::Refining { .. } => "changes",
        }
    }
}

/// Reports progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the scan and refine pipelines.
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "fetching  1,234 / 5,000 heights".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let (n, total) = event.counts();
        let line = format!(
            "{}  {} / {} {}\n",
            event.phase(),
            format_number(n),
            format_number(total),
            event.unit()
        );
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let (n, total) = event.counts();
        let obj = serde_json::json!({
            "event": "progress",
            "phase": event.phase(),
            "n": n,
            "total": total
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    Auto,
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Resolve `Auto` against the current stderr.
    pub fn resolve(self) -> Self {
        match self {
            ProgressMode::Auto if atty::is(atty::Stream::Stderr) => ProgressMode::Human,
            ProgressMode::Auto => ProgressMode::Off,
            other => other,
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self.resolve() {
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
            ProgressMode::Off | ProgressMode::Auto => Box::new(NoProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(1), "1");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn explicit_modes_resolve_to_themselves() {
        assert_eq!(ProgressMode::Off.resolve(), ProgressMode::Off);
        assert_eq!(ProgressMode::Json.resolve(), ProgressMode::Json);
        assert_ne!(ProgressMode::Auto.resolve(), ProgressMode::Auto);
    }

    #[test]
    fn event_phase_and_counts() {
        let event = ProgressEvent::Refining { n: 3, total: 9 };
        assert_eq!(event.phase(), "refining");
        assert_eq!(event.counts(), (3, 9));
        assert_eq!(event.unit(), "changes");
    }
}
