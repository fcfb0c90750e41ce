//! Execution records of a pipeline run.
//!
//! Every task of a phase gets a [`TaskRecord`] in registration order, including
//! those the run's [`Mode`] filtered out, so a record shows what a sequence
//! actually did on this machine.

use crate::runtime::Mode;

/// How one task of a completed phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { duration_ms: u128 },
    /// Not applicable in the mode the pipeline ran in.
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub name: String,
    pub outcome: TaskOutcome,
}

impl TaskRecord {
    pub fn duration_ms(&self) -> Option<u128> {
        match self.outcome {
            TaskOutcome::Completed { duration_ms } => Some(duration_ms),
            TaskOutcome::NotApplicable => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PhaseRecord {
    pub index: usize,
    pub description: String,
    pub duration_ms: u128,
    pub tasks: Vec<TaskRecord>,
}

impl PhaseRecord {
    /// Tasks that ran, with their durations.
    pub fn completed(&self) -> impl Iterator<Item = (&str, u128)> {
        self.tasks
            .iter()
            .filter_map(|t| t.duration_ms().map(|d| (t.name.as_str(), d)))
    }

    pub fn skipped(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.outcome == TaskOutcome::NotApplicable)
            .map(|t| t.name.as_str())
            .collect()
    }

    /// The slowest task: tasks of a phase run together, so this is the one
    /// the phase waited on.
    pub fn critical_task(&self) -> Option<(&str, u128)> {
        self.completed().max_by_key(|(_, duration_ms)| *duration_ms)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub mode: Mode,
    pub total_duration_ms: u128,
    pub phases: Vec<PhaseRecord>,
}

impl PipelineMetrics {
    pub fn task_duration_ms(&self, name: &str) -> Option<u128> {
        self.phases
            .iter()
            .flat_map(|phase| phase.tasks.iter())
            .find(|task| task.name == name)
            .and_then(TaskRecord::duration_ms)
    }

    pub fn phase(&self, description: &str) -> Option<&PhaseRecord> {
        self.phases.iter().find(|p| p.description == description)
    }

    /// Names of every task that ran, phase by phase.
    pub fn executed_tasks(&self) -> Vec<&str> {
        self.phases
            .iter()
            .flat_map(|phase| phase.completed().map(|(name, _)| name))
            .collect()
    }

    /// Names of every task the mode filtered out.
    pub fn skipped_tasks(&self) -> Vec<&str> {
        self.phases.iter().flat_map(PhaseRecord::skipped).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, outcome: TaskOutcome) -> TaskRecord {
        TaskRecord {
            name: name.to_string(),
            outcome,
        }
    }

    #[test]
    fn test_phase_record_queries() {
        let phase = PhaseRecord {
            index: 0,
            description: "stage 1".into(),
            duration_ms: 40,
            tasks: vec![
                record("api", TaskOutcome::Completed { duration_ms: 12 }),
                record("kspp", TaskOutcome::NotApplicable),
                record("networkd", TaskOutcome::Completed { duration_ms: 38 }),
            ],
        };

        assert_eq!(phase.skipped(), vec!["kspp"]);
        assert_eq!(phase.critical_task(), Some(("networkd", 38)));

        let metrics = PipelineMetrics {
            mode: Mode::Container,
            total_duration_ms: 40,
            phases: vec![phase],
        };
        assert_eq!(metrics.executed_tasks(), vec!["api", "networkd"]);
        assert_eq!(metrics.skipped_tasks(), vec!["kspp"]);
        assert_eq!(metrics.task_duration_ms("kspp"), None);
        assert_eq!(metrics.task_duration_ms("api"), Some(12));
    }
}
