//! Observer pattern for monitoring refinement progress.
//!
//! Observers are registered on a [`Refinery`](crate::engine::Refinery) and
//! notified with the journal row of every accepted step, enabling live
//! progress reporting, CSV export, metrics collection or custom analysis
//! without coupling any of that to the minimization loop itself. Rejected
//! trial steps are internal to the engines and never reach observers.
//!
//! Observers receive an immutable row and cannot influence the refinement.
//! They should be lightweight; anything expensive belongs behind a buffer.
//! Use interior mutability (`Mutex`, atomics) to accumulate state, since
//! notification takes `&self`.

use crate::engine::journal::JournalRow;

/// Callback invoked after every accepted refinement step.
pub trait StepObserver: Send {
    /// Called with the freshly journaled row. `row.step` counts accepted
    /// steps from 1.
    fn on_step(&self, row: &JournalRow);
}

/// Collection of observers notified in registration order.
#[derive(Default)]
pub struct StepObserverVec {
    observers: Vec<Box<dyn StepObserver>>,
}

impl StepObserverVec {
    pub fn new() -> Self {
        StepObserverVec {
            observers: Vec::new(),
        }
    }

    /// Add an observer to the collection.
    pub fn add(&mut self, observer: impl StepObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    /// Notify all observers. A no-op when none are registered.
    #[inline]
    pub fn notify(&self, row: &JournalRow) {
        for observer in &self.observers {
            observer.on_step(row);
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.observers.len()
    }
}

impl std::fmt::Debug for StepObserverVec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepObserverVec")
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;
    use std::sync::{Arc, Mutex};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn example_row(step: usize) -> JournalRow {
        JournalRow {
            step,
            num_observations: 10,
            objective: 1.0 / step as f64,
            rmsds: vec![0.1],
            parameter_vector: dvector![1.0, 2.0],
            shift: None,
            gradient: None,
            out_of_sample_rmsds: None,
            damping: None,
            nu: None,
        }
    }

    #[derive(Clone)]
    struct RecordingObserver {
        steps: Arc<Mutex<Vec<usize>>>,
    }

    impl StepObserver for RecordingObserver {
        fn on_step(&self, row: &JournalRow) {
            if let Ok(mut steps) = self.steps.lock() {
                steps.push(row.step);
            }
        }
    }

    #[test]
    fn test_empty_observers() {
        let observers = StepObserverVec::new();
        assert!(observers.is_empty());
        assert_eq!(observers.len(), 0);
        observers.notify(&example_row(1));
    }

    #[test]
    fn test_observers_see_rows_in_order() -> TestResult {
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));

        let mut observers = StepObserverVec::new();
        observers.add(RecordingObserver {
            steps: first.clone(),
        });
        observers.add(RecordingObserver {
            steps: second.clone(),
        });
        assert_eq!(observers.len(), 2);

        observers.notify(&example_row(1));
        observers.notify(&example_row(2));
        observers.notify(&example_row(3));

        let seen = first.lock().map_err(|e| e.to_string())?;
        assert_eq!(*seen, vec![1, 2, 3]);
        let seen = second.lock().map_err(|e| e.to_string())?;
        assert_eq!(*seen, vec![1, 2, 3]);
        Ok(())
    }
}
