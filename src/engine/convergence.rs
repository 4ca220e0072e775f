//! RMSD-history convergence test.
//!
//! Refinement is considered converged when the RMSDs stop moving between
//! consecutive accepted steps: for every component whose previous value is
//! positive, the relative change `|Δrmsd / current|` must fall below the
//! tolerance. Components whose previous value is zero or negative are
//! vacuously satisfied. With fewer than two journal rows there is nothing to
//! compare and the test reports not converged.

use crate::engine::journal::Journal;

#[derive(Debug, Clone, Copy)]
pub struct RmsdConvergenceTester {
    tolerance: f64,
}

impl RmsdConvergenceTester {
    pub fn new(tolerance: f64) -> Self {
        RmsdConvergenceTester { tolerance }
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// True when every RMSD component has stopped decreasing relative to the
    /// previous accepted step.
    pub fn converged(&self, journal: &Journal) -> bool {
        let Some((previous, current)) = journal.last_two_rmsds() else {
            return false;
        };
        previous.iter().zip(current.iter()).all(|(&p, &c)| {
            if p > 0.0 {
                ((c - p) / c).abs() < self.tolerance
            } else {
                true
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::journal::JournalRow;
    use nalgebra::dvector;

    fn journal_with_rmsds(rows: &[Vec<f64>]) -> Journal {
        let mut journal = Journal::new();
        for (i, rmsds) in rows.iter().enumerate() {
            journal.push(JournalRow {
                step: i + 1,
                num_observations: 50,
                objective: 1.0,
                rmsds: rmsds.clone(),
                parameter_vector: dvector![0.0],
                shift: None,
                gradient: None,
                out_of_sample_rmsds: None,
                damping: None,
                nu: None,
            });
        }
        journal
    }

    #[test]
    fn test_fewer_than_two_rows_is_not_converged() {
        let tester = RmsdConvergenceTester::new(1e-4);
        assert!(!tester.converged(&journal_with_rmsds(&[])));
        assert!(!tester.converged(&journal_with_rmsds(&[vec![0.5]])));
    }

    #[test]
    fn test_unchanged_rmsds_converge() {
        let tester = RmsdConvergenceTester::new(1e-4);
        let journal = journal_with_rmsds(&[vec![0.5, 0.2], vec![0.5, 0.2]]);
        assert!(tester.converged(&journal));
    }

    #[test]
    fn test_small_relative_change_converges() {
        let tester = RmsdConvergenceTester::new(1e-4);
        // Relative change 2e-5, well inside tolerance
        let journal = journal_with_rmsds(&[vec![0.500_01], vec![0.500_00]]);
        assert!(tester.converged(&journal));
    }

    #[test]
    fn test_any_failing_component_blocks_convergence() {
        let tester = RmsdConvergenceTester::new(1e-4);
        // First component static, second still falling fast
        let journal = journal_with_rmsds(&[vec![0.5, 0.3], vec![0.5, 0.2]]);
        assert!(!tester.converged(&journal));
    }

    #[test]
    fn test_zero_previous_component_is_vacuous() {
        let tester = RmsdConvergenceTester::new(1e-4);
        // Previous value of the second component is zero, so only the first counts
        let journal = journal_with_rmsds(&[vec![0.5, 0.0], vec![0.5, 7.0]]);
        assert!(tester.converged(&journal));
    }

    #[test]
    fn test_current_dropping_to_zero_is_not_converged() {
        let tester = RmsdConvergenceTester::new(1e-4);
        let journal = journal_with_rmsds(&[vec![0.5], vec![0.0]]);
        assert!(!tester.converged(&journal));
    }

    #[test]
    fn test_change_just_above_tolerance_fails() {
        let tester = RmsdConvergenceTester::new(1e-4);
        let current = 1.0;
        let previous = current * (1.0 + 1.5e-4);
        let journal = journal_with_rmsds(&[vec![previous], vec![current]]);
        assert!(!tester.converged(&journal));
    }

    #[test]
    fn test_only_last_two_rows_matter() {
        let tester = RmsdConvergenceTester::new(1e-4);
        let journal = journal_with_rmsds(&[vec![9.0], vec![0.5], vec![0.5]]);
        assert!(tester.converged(&journal));
    }
}
