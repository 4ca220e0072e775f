//! Append-only record of accepted refinement steps.
//!
//! One [`JournalRow`] is pushed per accepted step, carrying the state at the
//! shifted point. Optional columns (shift vector, gradient, out-of-sample
//! RMSDs, damping) are populated according to the tracking options in force.
//! Rows are never mutated or removed; the convergence tester reads the last
//! two rows and the step table renders the whole history.

use nalgebra::DVector;

use crate::engine::TerminationReason;

/// State after one accepted step.
#[derive(Debug, Clone)]
pub struct JournalRow {
    /// Accepted step number, starting at 1
    pub step: usize,
    /// Observations across the whole block set, held-out block included
    pub num_observations: usize,
    /// Objective value at the shifted parameters
    pub objective: f64,
    /// RMSDs at the shifted parameters, one per target component
    pub rmsds: Vec<f64>,
    /// Parameter vector after the shift
    pub parameter_vector: DVector<f64>,
    /// Applied shift, when step tracking is on
    pub shift: Option<DVector<f64>>,
    /// Functional gradient, when gradient tracking is on
    pub gradient: Option<DVector<f64>>,
    /// RMSDs over the held-out block, when out-of-sample tracking is on
    pub out_of_sample_rmsds: Option<Vec<f64>>,
    /// Damping value, for damped engines
    pub damping: Option<f64>,
    /// Damping growth factor, for damped engines
    pub nu: Option<f64>,
}

/// The history of a refinement run.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    rows: Vec<JournalRow>,
    termination_reason: Option<TerminationReason>,
}

impl Journal {
    pub fn new() -> Self {
        Journal::default()
    }

    /// Append one accepted step. Rows arrive in step order.
    pub fn push(&mut self, row: JournalRow) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[JournalRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn last(&self) -> Option<&JournalRow> {
        self.rows.last()
    }

    /// The two most recent RMSD vectors as `(previous, current)`.
    pub fn last_two_rmsds(&self) -> Option<(&[f64], &[f64])> {
        if self.rows.len() < 2 {
            return None;
        }
        let current = &self.rows[self.rows.len() - 1];
        let previous = &self.rows[self.rows.len() - 2];
        Some((&previous.rmsds, &current.rmsds))
    }

    /// The two most recent objective values as `(previous, current)`.
    pub fn last_two_objectives(&self) -> Option<(f64, f64)> {
        if self.rows.len() < 2 {
            return None;
        }
        Some((
            self.rows[self.rows.len() - 2].objective,
            self.rows[self.rows.len() - 1].objective,
        ))
    }

    pub fn set_termination_reason(&mut self, reason: TerminationReason) {
        self.termination_reason = Some(reason);
    }

    pub fn termination_reason(&self) -> Option<TerminationReason> {
        self.termination_reason
    }

    /// Render the per-step RMSD table with the termination reason on the
    /// last line.
    pub fn step_table(&self, rmsd_names: &[String], rmsd_units: &[String]) -> String {
        let mut header = vec!["Step".to_string(), "Nobs".to_string()];
        for (name, unit) in rmsd_names.iter().zip(rmsd_units) {
            header.push(format!("{} ({})", name, unit));
        }

        let mut table: Vec<Vec<String>> = vec![header];
        for row in &self.rows {
            let mut cells = vec![row.step.to_string(), row.num_observations.to_string()];
            for rmsd in &row.rmsds {
                cells.push(format_general(*rmsd));
            }
            table.push(cells);
        }

        let columns = table.iter().map(Vec::len).max().unwrap_or(0);
        let widths: Vec<usize> = (0..columns)
            .map(|c| {
                table
                    .iter()
                    .filter_map(|cells| cells.get(c))
                    .map(String::len)
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let mut out = String::from("Refinement steps:\n");
        for cells in &table {
            let line: Vec<String> = cells
                .iter()
                .enumerate()
                .map(|(c, cell)| format!("{:>width$}", cell, width = widths[c]))
                .collect();
            out.push_str(line.join("  ").trim_end());
            out.push('\n');
        }
        if let Some(reason) = self.termination_reason {
            out.push_str(&reason.to_string());
            out.push('\n');
        }
        out
    }
}

/// Format with five significant digits, trimming trailing zeros, switching
/// to scientific notation for very large or very small magnitudes.
pub(crate) fn format_general(value: f64) -> String {
    if !value.is_finite() || value == 0.0 {
        return format!("{}", value);
    }
    let exponent = value.abs().log10().floor() as i32;
    if exponent < -4 || exponent >= 5 {
        let formatted = format!("{:.4e}", value);
        match formatted.split_once('e') {
            Some((mantissa, exp)) => {
                let mantissa = mantissa.trim_end_matches('0').trim_end_matches('.');
                format!("{}e{}", mantissa, exp)
            }
            None => formatted,
        }
    } else {
        let decimals = (4 - exponent).max(0) as usize;
        let formatted = format!("{:.*}", decimals, value);
        if formatted.contains('.') {
            formatted
                .trim_end_matches('0')
                .trim_end_matches('.')
                .to_string()
        } else {
            formatted
        }
    }
}
