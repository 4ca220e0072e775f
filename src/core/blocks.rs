//! Observation blocks and their evaluation.
//!
//! The observation set is partitioned once per refinement run into
//! [`DataBlock`]s, held by a [`BlockSet`]. A distinguished *free* block may be
//! held out of fitting entirely; it only ever contributes to out-of-sample
//! RMSD reporting. Everything the minimizers consume goes through a
//! [`BlockExecutor`], which evaluates the target function over the fitting
//! blocks and reduces the per-block results to a single functional/gradient
//! pair or a single normal-equations accumulation.
//!
//! Two executors implement the same interface:
//! - [`SequentialExecutor`] iterates blocks in order on the calling thread.
//! - [`ParallelExecutor`] dispatches one task per block to a fixed-size rayon
//!   pool and blocks until all workers return. Workers receive a read-only
//!   borrow of the parameterization and return self-contained partial
//!   results; any worker error aborts the whole evaluation with no partial
//!   merge. Partials are collected in block order and summed on the calling
//!   thread, so the two executors agree to floating-point tolerance; bit-exact
//!   equality with the sequential sum is not guaranteed.
//!
//! With the `parallel` feature disabled, [`ParallelExecutor`] degrades to
//! sequential evaluation and logs a warning at construction.

use nalgebra::DVector;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::core::normal_equations::NormalEquations;
use crate::core::parameters::Parameterization;
use crate::core::target::{TargetFunction, weighted_ssq};
use crate::core::{CoreError, CoreResult};

/// One immutable partition of the observation set.
///
/// A block is a half-open index range into the caller's observation arrays.
/// Blocks never overlap within a [`BlockSet`] and never change during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    id: usize,
    range: std::ops::Range<usize>,
}

impl DataBlock {
    pub fn new(id: usize, range: std::ops::Range<usize>) -> Self {
        DataBlock { id, range }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Index range of the observations in this block.
    pub fn observation_range(&self) -> std::ops::Range<usize> {
        self.range.clone()
    }

    pub fn num_observations(&self) -> usize {
        self.range.len()
    }
}

/// The blocks of one refinement run, with an optional held-out block.
///
/// When constructed with [`with_free_block`](BlockSet::with_free_block), the
/// last block is excluded from [`fitting_blocks`](BlockSet::fitting_blocks)
/// and is only reachable through [`free_block`](BlockSet::free_block).
#[derive(Debug, Clone)]
pub struct BlockSet {
    blocks: Vec<DataBlock>,
    has_free_block: bool,
}

impl BlockSet {
    /// A block set in which every block participates in fitting.
    pub fn new(blocks: Vec<DataBlock>) -> CoreResult<Self> {
        if blocks.is_empty() {
            return Err(CoreError::Block("block set cannot be empty".to_string()).log());
        }
        Ok(BlockSet {
            blocks,
            has_free_block: false,
        })
    }

    /// A block set whose last block is held out of fitting.
    pub fn with_free_block(blocks: Vec<DataBlock>) -> CoreResult<Self> {
        if blocks.len() < 2 {
            return Err(CoreError::Block(
                "a block set with a free block needs at least two blocks".to_string(),
            )
            .log());
        }
        Ok(BlockSet {
            blocks,
            has_free_block: true,
        })
    }

    /// Partition `num_observations` contiguous observations into
    /// `num_blocks` blocks of near-equal size.
    pub fn partition(num_observations: usize, num_blocks: usize) -> CoreResult<Self> {
        if num_observations == 0 {
            return Err(CoreError::Block("cannot partition zero observations".to_string()).log());
        }
        if num_blocks == 0 || num_blocks > num_observations {
            return Err(CoreError::Block(format!(
                "cannot partition {} observations into {} blocks",
                num_observations, num_blocks
            ))
            .log());
        }

        let base = num_observations / num_blocks;
        let remainder = num_observations % num_blocks;
        let mut blocks = Vec::with_capacity(num_blocks);
        let mut start = 0;
        for id in 0..num_blocks {
            let len = base + usize::from(id < remainder);
            blocks.push(DataBlock::new(id, start..start + len));
            start += len;
        }
        BlockSet::new(blocks)
    }

    /// Blocks that contribute to the fitted equations.
    pub fn fitting_blocks(&self) -> &[DataBlock] {
        if self.has_free_block {
            &self.blocks[..self.blocks.len() - 1]
        } else {
            &self.blocks
        }
    }

    /// The held-out block, if one exists.
    pub fn free_block(&self) -> Option<&DataBlock> {
        if self.has_free_block {
            self.blocks.last()
        } else {
            None
        }
    }

    pub fn all_blocks(&self) -> &[DataBlock] {
        &self.blocks
    }

    /// Observation count over every block, including any free block.
    pub fn num_observations(&self) -> usize {
        self.blocks.iter().map(DataBlock::num_observations).sum()
    }

    /// Observation count over the fitting blocks only.
    pub fn num_fitting_observations(&self) -> usize {
        self.fitting_blocks()
            .iter()
            .map(DataBlock::num_observations)
            .sum()
    }
}

/// Reduction of target-function evaluations over a set of fitting blocks.
///
/// Strategies depend only on this interface; whether the evaluation runs
/// sequentially or on a worker pool is a construction-time choice.
pub trait BlockExecutor: Send + Sync {
    /// Sum of `½·Σ w·r²` over the blocks. Objective-only path.
    fn functional(
        &self,
        target: &dyn TargetFunction,
        params: &dyn Parameterization,
        blocks: &[DataBlock],
    ) -> CoreResult<f64>;

    /// Fold residual/weight pairs from every block into the accumulator.
    fn accumulate_residuals(
        &self,
        target: &dyn TargetFunction,
        params: &dyn Parameterization,
        blocks: &[DataBlock],
        equations: &mut NormalEquations,
    ) -> CoreResult<()>;

    /// Fold full `(r, J, w)` triples from every block into the accumulator.
    fn accumulate_equations(
        &self,
        target: &dyn TargetFunction,
        params: &dyn Parameterization,
        blocks: &[DataBlock],
        equations: &mut NormalEquations,
    ) -> CoreResult<()>;

    /// Summed functional and gradient over the blocks.
    fn functional_gradients(
        &self,
        target: &dyn TargetFunction,
        params: &dyn Parameterization,
        blocks: &[DataBlock],
    ) -> CoreResult<(f64, DVector<f64>)>;

    /// Summed functional, gradient and curvatures over the blocks.
    fn functional_gradients_and_curvatures(
        &self,
        target: &dyn TargetFunction,
        params: &dyn Parameterization,
        blocks: &[DataBlock],
    ) -> CoreResult<(f64, DVector<f64>, DVector<f64>)>;
}

fn check_nonempty(blocks: &[DataBlock]) -> CoreResult<()> {
    if blocks.is_empty() {
        return Err(CoreError::Block("no fitting blocks to evaluate".to_string()).log());
    }
    Ok(())
}

fn add_checked(total: &mut DVector<f64>, partial: &DVector<f64>, context: &str) -> CoreResult<()> {
    if total.len() != partial.len() {
        return Err(CoreError::DimensionMismatch {
            context: context.to_string(),
            expected: total.len(),
            actual: partial.len(),
        }
        .log());
    }
    *total += partial;
    Ok(())
}

fn merge_functional_gradients(
    partials: Vec<(f64, DVector<f64>)>,
) -> CoreResult<(f64, DVector<f64>)> {
    let mut iter = partials.into_iter();
    let (mut f, mut g) = iter
        .next()
        .ok_or_else(|| CoreError::Block("no fitting blocks to evaluate".to_string()))?;
    for (fi, gi) in iter {
        f += fi;
        add_checked(&mut g, &gi, "block gradient")?;
    }
    Ok((f, g))
}

fn merge_functional_gradients_curvatures(
    partials: Vec<(f64, DVector<f64>, DVector<f64>)>,
) -> CoreResult<(f64, DVector<f64>, DVector<f64>)> {
    let mut iter = partials.into_iter();
    let (mut f, mut g, mut c) = iter
        .next()
        .ok_or_else(|| CoreError::Block("no fitting blocks to evaluate".to_string()))?;
    for (fi, gi, ci) in iter {
        f += fi;
        add_checked(&mut g, &gi, "block gradient")?;
        add_checked(&mut c, &ci, "block curvatures")?;
    }
    Ok((f, g, c))
}

/// Evaluates blocks one after another on the calling thread.
#[derive(Debug, Clone, Default)]
pub struct SequentialExecutor;

impl SequentialExecutor {
    pub fn new() -> Self {
        SequentialExecutor
    }
}

impl BlockExecutor for SequentialExecutor {
    fn functional(
        &self,
        target: &dyn TargetFunction,
        params: &dyn Parameterization,
        blocks: &[DataBlock],
    ) -> CoreResult<f64> {
        check_nonempty(blocks)?;
        let mut f = 0.0;
        for block in blocks {
            let (residuals, weights) = target.compute_residuals(params, block)?;
            f += weighted_ssq(&residuals, &weights)?;
        }
        Ok(f)
    }

    fn accumulate_residuals(
        &self,
        target: &dyn TargetFunction,
        params: &dyn Parameterization,
        blocks: &[DataBlock],
        equations: &mut NormalEquations,
    ) -> CoreResult<()> {
        check_nonempty(blocks)?;
        for block in blocks {
            let (residuals, weights) = target.compute_residuals(params, block)?;
            equations.add_residuals(&residuals, &weights)?;
        }
        Ok(())
    }

    fn accumulate_equations(
        &self,
        target: &dyn TargetFunction,
        params: &dyn Parameterization,
        blocks: &[DataBlock],
        equations: &mut NormalEquations,
    ) -> CoreResult<()> {
        check_nonempty(blocks)?;
        for block in blocks {
            let (residuals, jacobian, weights) =
                target.compute_residuals_and_gradients(params, block)?;
            equations.add_equations(&residuals, &jacobian, &weights)?;
        }
        Ok(())
    }

    fn functional_gradients(
        &self,
        target: &dyn TargetFunction,
        params: &dyn Parameterization,
        blocks: &[DataBlock],
    ) -> CoreResult<(f64, DVector<f64>)> {
        check_nonempty(blocks)?;
        let partials = blocks
            .iter()
            .map(|block| target.compute_functional_gradients(params, block))
            .collect::<CoreResult<Vec<_>>>()?;
        merge_functional_gradients(partials)
    }

    fn functional_gradients_and_curvatures(
        &self,
        target: &dyn TargetFunction,
        params: &dyn Parameterization,
        blocks: &[DataBlock],
    ) -> CoreResult<(f64, DVector<f64>, DVector<f64>)> {
        check_nonempty(blocks)?;
        let partials = blocks
            .iter()
            .map(|block| target.compute_functional_gradients_and_curvatures(params, block))
            .collect::<CoreResult<Vec<_>>>()?;
        merge_functional_gradients_curvatures(partials)
    }
}

/// Evaluates blocks on a fixed-size worker pool.
///
/// The pool is built once at construction with `nproc` threads and lives as
/// long as the executor; every evaluation is a synchronous barrier over one
/// task per block.
pub struct ParallelExecutor {
    #[cfg(feature = "parallel")]
    pool: rayon::ThreadPool,
    #[cfg(not(feature = "parallel"))]
    fallback: SequentialExecutor,
    nproc: usize,
}

impl ParallelExecutor {
    pub fn new(nproc: usize) -> CoreResult<Self> {
        if nproc == 0 {
            return Err(
                CoreError::ParallelEvaluation("worker pool needs at least 1 thread".to_string())
                    .log(),
            );
        }

        #[cfg(feature = "parallel")]
        {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(nproc)
                .build()
                .map_err(|e| {
                    CoreError::ParallelEvaluation("failed to build worker pool".to_string())
                        .log_with_source(e)
                })?;
            Ok(ParallelExecutor { pool, nproc })
        }

        #[cfg(not(feature = "parallel"))]
        {
            tracing::warn!(
                "parallel feature disabled; {} requested workers will run sequentially",
                nproc
            );
            Ok(ParallelExecutor {
                fallback: SequentialExecutor::new(),
                nproc,
            })
        }
    }

    pub fn num_workers(&self) -> usize {
        self.nproc
    }
}

impl std::fmt::Debug for ParallelExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelExecutor")
            .field("nproc", &self.nproc)
            .finish()
    }
}

impl BlockExecutor for ParallelExecutor {
    #[cfg(feature = "parallel")]
    fn functional(
        &self,
        target: &dyn TargetFunction,
        params: &dyn Parameterization,
        blocks: &[DataBlock],
    ) -> CoreResult<f64> {
        check_nonempty(blocks)?;
        let partials: CoreResult<Vec<f64>> = self.pool.install(|| {
            blocks
                .par_iter()
                .map(|block| {
                    let (residuals, weights) = target.compute_residuals(params, block)?;
                    weighted_ssq(&residuals, &weights)
                })
                .collect()
        });
        Ok(partials?.into_iter().sum())
    }

    #[cfg(feature = "parallel")]
    fn accumulate_residuals(
        &self,
        target: &dyn TargetFunction,
        params: &dyn Parameterization,
        blocks: &[DataBlock],
        equations: &mut NormalEquations,
    ) -> CoreResult<()> {
        check_nonempty(blocks)?;
        let partials: CoreResult<Vec<_>> = self.pool.install(|| {
            blocks
                .par_iter()
                .map(|block| target.compute_residuals(params, block))
                .collect()
        });
        for (residuals, weights) in partials? {
            equations.add_residuals(&residuals, &weights)?;
        }
        Ok(())
    }

    #[cfg(feature = "parallel")]
    fn accumulate_equations(
        &self,
        target: &dyn TargetFunction,
        params: &dyn Parameterization,
        blocks: &[DataBlock],
        equations: &mut NormalEquations,
    ) -> CoreResult<()> {
        check_nonempty(blocks)?;
        let partials: CoreResult<Vec<_>> = self.pool.install(|| {
            blocks
                .par_iter()
                .map(|block| target.compute_residuals_and_gradients(params, block))
                .collect()
        });
        for (residuals, jacobian, weights) in partials? {
            equations.add_equations(&residuals, &jacobian, &weights)?;
        }
        Ok(())
    }

    #[cfg(feature = "parallel")]
    fn functional_gradients(
        &self,
        target: &dyn TargetFunction,
        params: &dyn Parameterization,
        blocks: &[DataBlock],
    ) -> CoreResult<(f64, DVector<f64>)> {
        check_nonempty(blocks)?;
        let partials: CoreResult<Vec<_>> = self.pool.install(|| {
            blocks
                .par_iter()
                .map(|block| target.compute_functional_gradients(params, block))
                .collect()
        });
        merge_functional_gradients(partials?)
    }

    #[cfg(feature = "parallel")]
    fn functional_gradients_and_curvatures(
        &self,
        target: &dyn TargetFunction,
        params: &dyn Parameterization,
        blocks: &[DataBlock],
    ) -> CoreResult<(f64, DVector<f64>, DVector<f64>)> {
        check_nonempty(blocks)?;
        let partials: CoreResult<Vec<_>> = self.pool.install(|| {
            blocks
                .par_iter()
                .map(|block| target.compute_functional_gradients_and_curvatures(params, block))
                .collect()
        });
        merge_functional_gradients_curvatures(partials?)
    }

    #[cfg(not(feature = "parallel"))]
    fn functional(
        &self,
        target: &dyn TargetFunction,
        params: &dyn Parameterization,
        blocks: &[DataBlock],
    ) -> CoreResult<f64> {
        self.fallback.functional(target, params, blocks)
    }

    #[cfg(not(feature = "parallel"))]
    fn accumulate_residuals(
        &self,
        target: &dyn TargetFunction,
        params: &dyn Parameterization,
        blocks: &[DataBlock],
        equations: &mut NormalEquations,
    ) -> CoreResult<()> {
        self.fallback
            .accumulate_residuals(target, params, blocks, equations)
    }

    #[cfg(not(feature = "parallel"))]
    fn accumulate_equations(
        &self,
        target: &dyn TargetFunction,
        params: &dyn Parameterization,
        blocks: &[DataBlock],
        equations: &mut NormalEquations,
    ) -> CoreResult<()> {
        self.fallback
            .accumulate_equations(target, params, blocks, equations)
    }

    #[cfg(not(feature = "parallel"))]
    fn functional_gradients(
        &self,
        target: &dyn TargetFunction,
        params: &dyn Parameterization,
        blocks: &[DataBlock],
    ) -> CoreResult<(f64, DVector<f64>)> {
        self.fallback.functional_gradients(target, params, blocks)
    }

    #[cfg(not(feature = "parallel"))]
    fn functional_gradients_and_curvatures(
        &self,
        target: &dyn TargetFunction,
        params: &dyn Parameterization,
        blocks: &[DataBlock],
    ) -> CoreResult<(f64, DVector<f64>, DVector<f64>)> {
        self.fallback
            .functional_gradients_and_curvatures(target, params, blocks)
    }
}
