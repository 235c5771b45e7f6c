//! Side-channel plan snapshots for transactions that request analysis.

use std::fmt;

use parking_lot::Mutex;

/// Pipeline stage a snapshot was taken at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Logical tree as received.
    LogicalPlan,
    /// Tree after constraint guards were added.
    ConstraintEnforcementPlan,
    /// Candidates proposed by the routers.
    RoutedPlans,
    /// Selected physical tree.
    PhysicalPlan,
    /// Text of the implemented artifact.
    GeneratedCode,
    /// Per-stage durations, as JSON.
    StageTimings,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::LogicalPlan => "logical plan",
            Stage::ConstraintEnforcementPlan => "constraint enforcement plan",
            Stage::RoutedPlans => "routed plans",
            Stage::PhysicalPlan => "physical plan",
            Stage::GeneratedCode => "generated code",
            Stage::StageTimings => "stage timings",
        };
        f.write_str(name)
    }
}

/// Receives plan snapshots.
pub trait Diagnostics: Send + Sync {
    /// Records `body` for `stage`.
    fn record(&self, stage: Stage, body: String);
}

/// One recorded snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    /// Stage.
    pub stage: Stage,
    /// Rendered plan or text.
    pub body: String,
}

/// Keeps every snapshot in memory.
#[derive(Default)]
pub struct RecordingDiagnostics {
    entries: Mutex<Vec<Snapshot>>,
}

impl RecordingDiagnostics {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshots in recording order.
    pub fn entries(&self) -> Vec<Snapshot> {
        self.entries.lock().clone()
    }

    /// Stages in recording order.
    pub fn stages(&self) -> Vec<Stage> {
        self.entries.lock().iter().map(|e| e.stage).collect()
    }

    /// Bodies recorded for `stage`.
    pub fn bodies(&self, stage: Stage) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.stage == stage)
            .map(|e| e.body.clone())
            .collect()
    }
}

impl Diagnostics for RecordingDiagnostics {
    fn record(&self, stage: Stage, body: String) {
        self.entries.lock().push(Snapshot { stage, body });
    }
}
