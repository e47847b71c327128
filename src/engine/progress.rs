use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Lifecycle of one simulator process as seen through its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    Running,
    /// The simulator printed its final summary or exited cleanly.
    Finished,
    /// Killed because cancellation was requested.
    Stopped,
    /// Killed because the run exceeded its time limit.
    TimedOut,
    /// Exited with an error or could not be read.
    Failed,
}

impl WorkerStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkerStatus::Running)
    }
}

/// One structured progress update from a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub seed: u64,
    pub name: String,
    pub presim: bool,
    pub calculated: u64,
    pub total: u64,
    pub percentage: u32,
    pub message: String,
    pub status: WorkerStatus,
}

impl ProgressRecord {
    pub fn new(seed: u64, name: &str) -> Self {
        Self {
            seed,
            name: name.to_string(),
            presim: true,
            calculated: 0,
            total: 0,
            percentage: 0,
            message: String::new(),
            status: WorkerStatus::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

const PRESIM_FINISHED: &str = "Presimulation finished";
const SUMMARY_START: &str = "Beam ion: ";
const SUMMARY_END: &str = "angave";

fn progress_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^Calculated (\d+) of (\d+) ions \((\d+)%\)").expect("valid progress regex")
    })
}

/// Turns raw simulator output lines into [`ProgressRecord`]s.
///
/// Values a line does not mention carry over from the previous record. The
/// closing summary block (from `Beam ion:` up to `angave`) is folded into a
/// single terminal record.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    last: ProgressRecord,
    summary: Option<Vec<String>>,
    done: bool,
}

impl ProgressParser {
    pub fn new(seed: u64, name: &str) -> Self {
        Self {
            last: ProgressRecord::new(seed, name),
            summary: None,
            done: false,
        }
    }

    /// True once the summary block has been seen in full.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn last(&self) -> &ProgressRecord {
        &self.last
    }

    /// Feeds one raw line. Returns a record when the line completes one.
    pub fn feed(&mut self, raw: &str) -> Option<ProgressRecord> {
        if self.done {
            return None;
        }
        let line = raw.trim();

        if line.starts_with(SUMMARY_START) {
            self.summary = Some(vec![line.to_string()]);
            return None;
        }
        if let Some(block) = self.summary.as_mut() {
            block.push(line.to_string());
            if line.starts_with(SUMMARY_END) {
                let message = block.join("\n");
                self.summary = None;
                self.done = true;
                let mut record = self.last.clone();
                record.percentage = 100;
                record.message = message;
                record.status = WorkerStatus::Finished;
                self.last = record.clone();
                return Some(record);
            }
            return None;
        }

        let mut record = self.last.clone();
        record.message.clear();

        if let Some(caps) = progress_pattern().captures(line) {
            // The pattern only matches digits, overflow is the only failure.
            record.calculated = caps[1].parse().unwrap_or(record.calculated);
            record.total = caps[2].parse().unwrap_or(record.total);
            record.percentage = caps[3].parse().unwrap_or(record.percentage);
        } else if line == PRESIM_FINISHED {
            record.presim = false;
            record.calculated = 0;
            record.percentage = 0;
            record.message = line.to_string();
        } else {
            record.message = line.to_string();
        }

        self.last = record.clone();
        Some(record)
    }

    /// A terminal record built from the latest values.
    pub fn terminal(&mut self, status: WorkerStatus, message: impl Into<String>) -> ProgressRecord {
        let mut record = self.last.clone();
        record.status = status;
        record.message = message.into();
        self.done = true;
        self.last = record.clone();
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_lines_are_parsed() {
        let mut p = ProgressParser::new(101, "4He-default");
        let r = p.feed("Calculated 100 of 1000 ions (10%)\n").unwrap();
        assert_eq!((r.calculated, r.total, r.percentage), (100, 1000, 10));
        assert!(r.presim);
        assert_eq!(r.seed, 101);
        assert_eq!(r.status, WorkerStatus::Running);
    }

    #[test]
    fn unknown_lines_keep_previous_values() {
        let mut p = ProgressParser::new(1, "x");
        p.feed("Calculated 5 of 50 ions (10%)");
        let r = p.feed("Opening target file xyz").unwrap();
        assert_eq!(r.message, "Opening target file xyz");
        assert_eq!((r.calculated, r.total, r.percentage), (5, 50, 10));

        let r = p.feed("Calculated of ions").unwrap();
        assert_eq!(r.message, "Calculated of ions");
        assert_eq!(r.calculated, 5);
    }

    #[test]
    fn presimulation_resets_counters() {
        let mut p = ProgressParser::new(1, "x");
        p.feed("Calculated 50 of 50 ions (100%)");
        let r = p.feed("Presimulation finished").unwrap();
        assert!(!r.presim);
        assert_eq!((r.calculated, r.total, r.percentage), (0, 50, 0));

        let r = p.feed("Calculated 10 of 100 ions (10%)").unwrap();
        assert!(!r.presim);
    }

    #[test]
    fn summary_block_is_one_record() {
        let mut p = ProgressParser::new(1, "x");
        p.feed("Calculated 90 of 100 ions (90%)");
        assert!(p.feed("Beam ion: 35Cl").is_none());
        assert!(p.feed("Energy: 10 MeV").is_none());
        let r = p.feed("angave 12.3").unwrap();
        assert_eq!(r.percentage, 100);
        assert_eq!(r.calculated, 90);
        assert_eq!(r.status, WorkerStatus::Finished);
        assert_eq!(r.message, "Beam ion: 35Cl\nEnergy: 10 MeV\nangave 12.3");
        assert!(p.is_done());
        assert!(p.feed("trailing").is_none());
    }
}
