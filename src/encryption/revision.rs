//! # Revision Convergence
//!
//! Determines whether every API server instance runs the same configuration revision.
//! The result is recomputed from a live listing at the start of each reconciliation
//! and passed along; nothing is cached between reconciliations.

use thiserror::Error;

/// Lifecycle phase of an instance, mirroring pod phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstancePhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl InstancePhase {
    pub fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => InstancePhase::Pending,
            Some("Running") => InstancePhase::Running,
            Some("Succeeded") => InstancePhase::Succeeded,
            Some("Failed") => InstancePhase::Failed,
            _ => InstancePhase::Unknown,
        }
    }
}

/// What the convergence check needs to know about one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    pub name: String,
    pub revision: Option<String>,
    pub phase: InstancePhase,
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceSnapshot {
    /// All instances run and are ready at this revision
    Converged { revision: String },
    Unconverged { reason: String },
}

impl ConvergenceSnapshot {
    pub fn revision(&self) -> Option<&str> {
        match self {
            ConvergenceSnapshot::Converged { revision } => Some(revision),
            ConvergenceSnapshot::Unconverged { .. } => None,
        }
    }

    fn unconverged(reason: impl Into<String>) -> Self {
        ConvergenceSnapshot::Unconverged {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RevisionError {
    #[error("instance {0} is in an unknown state")]
    UnknownPhase(String),
}

/// Compute the revision all instances agree on
pub fn converged_revision(
    instances: &[InstanceStatus],
) -> Result<ConvergenceSnapshot, RevisionError> {
    if instances.is_empty() {
        return Ok(ConvergenceSnapshot::unconverged("no instances found"));
    }

    let mut revision: Option<&str> = None;
    let mut failed = Vec::new();
    for instance in instances {
        match instance.phase {
            InstancePhase::Unknown => {
                return Err(RevisionError::UnknownPhase(instance.name.clone()));
            }
            InstancePhase::Pending => {
                return Ok(ConvergenceSnapshot::unconverged(format!(
                    "instance {} is pending",
                    instance.name
                )));
            }
            InstancePhase::Failed => failed.push(instance),
            InstancePhase::Succeeded => {}
            InstancePhase::Running => {
                if !instance.ready {
                    return Ok(ConvergenceSnapshot::unconverged(format!(
                        "instance {} is not ready",
                        instance.name
                    )));
                }
                let Some(current) = instance.revision.as_deref() else {
                    return Ok(ConvergenceSnapshot::unconverged(format!(
                        "instance {} has no revision",
                        instance.name
                    )));
                };
                match revision {
                    None => revision = Some(current),
                    Some(seen) if seen != current => {
                        return Ok(ConvergenceSnapshot::unconverged(format!(
                            "instances run revisions {seen} and {current}"
                        )));
                    }
                    Some(_) => {}
                }
            }
        }
    }

    let Some(revision) = revision else {
        return Ok(ConvergenceSnapshot::unconverged("no running instances"));
    };
    // a failed instance of an older revision was replaced, one at the current revision was not
    if let Some(instance) = failed
        .iter()
        .find(|i| i.revision.as_deref() == Some(revision))
    {
        return Ok(ConvergenceSnapshot::unconverged(format!(
            "instance {} failed at revision {revision}",
            instance.name
        )));
    }

    Ok(ConvergenceSnapshot::Converged {
        revision: revision.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(name: &str, revision: &str, phase: InstancePhase, ready: bool) -> InstanceStatus {
        InstanceStatus {
            name: name.to_string(),
            revision: Some(revision.to_string()),
            phase,
            ready,
        }
    }

    fn running(name: &str, revision: &str) -> InstanceStatus {
        instance(name, revision, InstancePhase::Running, true)
    }

    #[test]
    fn test_all_running_same_revision_converges() {
        let snapshot =
            converged_revision(&[running("a", "7"), running("b", "7"), running("c", "7")]).unwrap();
        assert_eq!(snapshot.revision(), Some("7"));
    }

    #[test]
    fn test_disagreeing_revisions_do_not_converge() {
        let snapshot = converged_revision(&[running("a", "7"), running("b", "8")]).unwrap();
        assert_eq!(snapshot.revision(), None);
    }

    #[test]
    fn test_not_ready_or_pending_do_not_converge() {
        let not_ready = instance("b", "7", InstancePhase::Running, false);
        assert_eq!(
            converged_revision(&[running("a", "7"), not_ready])
                .unwrap()
                .revision(),
            None
        );

        let pending = instance("b", "7", InstancePhase::Pending, false);
        assert_eq!(
            converged_revision(&[running("a", "7"), pending])
                .unwrap()
                .revision(),
            None
        );
    }

    #[test]
    fn test_failed_instance_at_current_revision_blocks() {
        let failed = instance("b", "7", InstancePhase::Failed, false);
        assert_eq!(
            converged_revision(&[running("a", "7"), failed])
                .unwrap()
                .revision(),
            None
        );

        let old_failure = instance("b", "6", InstancePhase::Failed, false);
        assert_eq!(
            converged_revision(&[running("a", "7"), old_failure])
                .unwrap()
                .revision(),
            Some("7")
        );
    }

    #[test]
    fn test_unknown_phase_is_an_error() {
        let unknown = instance("b", "7", InstancePhase::Unknown, false);
        assert_eq!(
            converged_revision(&[running("a", "7"), unknown]),
            Err(RevisionError::UnknownPhase("b".to_string()))
        );
    }

    #[test]
    fn test_no_instances_does_not_converge() {
        assert_eq!(converged_revision(&[]).unwrap().revision(), None);
    }

    #[test]
    fn test_missing_revision_label_does_not_converge() {
        let mut unlabelled = running("a", "7");
        unlabelled.revision = None;
        assert_eq!(converged_revision(&[unlabelled]).unwrap().revision(), None);
    }
}
