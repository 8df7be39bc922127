//! Result aggregation and the on-disk result tree.

pub(crate) mod index;
pub(crate) mod layout;
pub(crate) mod stats;

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// The kind of a step within a test (or the per-run pre-run phase).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum StepKind {
    /// A test's setup step.
    Setup,
    /// A test's measured step.
    Test,
    /// A test's cleanup step.
    Cleanup,
    /// A per-run pre-run step.
    PreRun,
}

impl StepKind {
    /// The file basename prefix for this step kind.
    pub(crate) fn basename(&self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Test => "test",
            Self::Cleanup => "cleanup",
            Self::PreRun => "pre_run",
        }
    }

    /// Infers the step kind from a result-file basename prefix.
    pub(crate) fn from_basename(basename: &str) -> Option<Self> {
        match basename {
            "setup" => Some(Self::Setup),
            "test" => Some(Self::Test),
            "cleanup" => Some(Self::Cleanup),
            "pre_run" => Some(Self::PreRun),
            _ => None,
        }
    }
}

impl Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.basename())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basenames_round_trip() {
        for kind in [StepKind::Setup, StepKind::Test, StepKind::Cleanup, StepKind::PreRun] {
            assert_eq!(StepKind::from_basename(kind.basename()), Some(kind));
        }
        assert_eq!(StepKind::from_basename("other"), None);
    }
}
