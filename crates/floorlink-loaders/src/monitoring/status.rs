//! Equipment status normalization and aggregate counts

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of equipment states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EquipmentStatus {
    /// Producing
    Run,
    /// Powered, not producing
    Idle,
    /// Planned stop
    Stop,
    /// Unplanned stop, alarm or fault
    SuddenStop,
    /// Not reporting
    #[default]
    Disconnected,
}

impl EquipmentStatus {
    /// All statuses
    pub const ALL: [EquipmentStatus; 5] = [
        EquipmentStatus::Run,
        EquipmentStatus::Idle,
        EquipmentStatus::Stop,
        EquipmentStatus::SuddenStop,
        EquipmentStatus::Disconnected,
    ];

    /// Canonical name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "Run",
            Self::Idle => "Idle",
            Self::Stop => "Stop",
            Self::SuddenStop => "SuddenStop",
            Self::Disconnected => "Disconnected",
        }
    }
}

impl fmt::Display for EquipmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a raw backend status to the closed set.
///
/// Matching ignores case, surrounding whitespace, and `_`, `-` or space
/// separators. Missing and unrecognized values are `Disconnected`.
#[must_use]
pub fn normalize_status(raw: Option<&str>) -> EquipmentStatus {
    let Some(raw) = raw else {
        return EquipmentStatus::Disconnected;
    };
    let key: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect();

    match key.as_str() {
        "run" | "running" | "active" | "operating" | "working" | "production" | "busy" => {
            EquipmentStatus::Run
        }
        "idle" | "waiting" | "standby" | "ready" | "paused" => EquipmentStatus::Idle,
        "stop" | "stopped" | "off" | "halt" | "halted" | "shutdown" | "maintenance" => {
            EquipmentStatus::Stop
        }
        "suddenstop" | "emergency" | "emergencystop" | "estop" | "alarm" | "fault" | "error"
        | "breakdown" => EquipmentStatus::SuddenStop,
        _ => EquipmentStatus::Disconnected,
    }
}

/// Number of units per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusCounts {
    /// Units in `Run`
    pub run: usize,
    /// Units in `Idle`
    pub idle: usize,
    /// Units in `Stop`
    pub stop: usize,
    /// Units in `SuddenStop`
    pub sudden_stop: usize,
    /// Units in `Disconnected`
    pub disconnected: usize,
}

impl StatusCounts {
    /// Counts over `statuses`
    pub fn tally(statuses: impl IntoIterator<Item = EquipmentStatus>) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            counts.increment(status);
        }
        counts
    }

    /// Count of one status
    #[must_use]
    pub fn get(&self, status: EquipmentStatus) -> usize {
        match status {
            EquipmentStatus::Run => self.run,
            EquipmentStatus::Idle => self.idle,
            EquipmentStatus::Stop => self.stop,
            EquipmentStatus::SuddenStop => self.sudden_stop,
            EquipmentStatus::Disconnected => self.disconnected,
        }
    }

    fn slot(&mut self, status: EquipmentStatus) -> &mut usize {
        match status {
            EquipmentStatus::Run => &mut self.run,
            EquipmentStatus::Idle => &mut self.idle,
            EquipmentStatus::Stop => &mut self.stop,
            EquipmentStatus::SuddenStop => &mut self.sudden_stop,
            EquipmentStatus::Disconnected => &mut self.disconnected,
        }
    }

    /// Add one unit
    pub fn increment(&mut self, status: EquipmentStatus) {
        *self.slot(status) += 1;
    }

    /// Remove one unit; saturates at zero
    pub fn decrement(&mut self, status: EquipmentStatus) {
        let slot = self.slot(status);
        *slot = slot.saturating_sub(1);
    }

    /// Move one unit between statuses
    pub fn shift(&mut self, from: EquipmentStatus, to: EquipmentStatus) {
        if from != to {
            self.decrement(from);
            self.increment(to);
        }
    }

    /// Sum over all statuses
    #[must_use]
    pub fn total(&self) -> usize {
        self.run + self.idle + self.stop + self.sudden_stop + self.disconnected
    }
}
