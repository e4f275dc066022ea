//! The scan plan builder: turns swept-instruction slots into a randomized
//! parameter matrix.
//!
//! A *slot* designates one instruction's duration as a swept parameter with a
//! start and end bound. A *plan* is one or more slots plus a sample count and
//! a repetition count. Building the matrix goes through three steps:
//!
//! 1. **Grid**: per slot, `sample_count` evenly spaced values inclusive of
//!    both bounds (one column per slot; a single sample collapses to `start`).
//! 2. **Expansion**: every grid row is duplicated `repetition` times,
//!    contiguously.
//! 3. **Shuffle**: one uniform permutation over *all* expanded rows, so
//!    repeated conditions are decorrelated from sample order and from each
//!    other. There is no block structure: repetitions of the same condition
//!    end up scattered across the whole scan.
//!
//! The permutation source is injectable (`build_matrix` takes any
//! [`rand::Rng`]), which is what makes scan ordering reproducible in tests.
//!
//! Rows of the resulting matrix are experimental conditions in execution
//! order; values are durations in nanoseconds.
//!
//! # Examples
//!
//! ```
//! use pbcompiler_backend::scan::{ScanPlan, ScanSlot};
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//!
//! let plan = ScanPlan::new(
//!     vec![ScanSlot::new(0, 1_000.0, 5_000.0)],
//!     5,
//!     3,
//! )
//! .unwrap();
//! let matrix = plan.build_matrix(&mut StdRng::seed_from_u64(7));
//! assert_eq!(matrix.dim(), (15, 1));
//! ```

use ndarray::{Array1, Array2, Axis};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{Result, SequencerError};
use crate::instruction::TimeUnit;

/// Editable form of one swept slot: bounds in display units.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotSettings {
    /// Index of the instruction whose duration is swept.
    pub instruction: usize,
    pub start: f64,
    pub start_unit: TimeUnit,
    pub end: f64,
    pub end_unit: TimeUnit,
}

impl SlotSettings {
    pub fn start_ns(&self) -> f64 {
        self.start * self.start_unit.scale_to_ns()
    }

    pub fn end_ns(&self) -> f64 {
        self.end * self.end_unit.scale_to_ns()
    }
}

/// Editable form of a whole scan: what the scanner panel holds and what the
/// sequence document persists.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSettings {
    pub sample_count: usize,
    pub repetition: usize,
    pub slots: Vec<SlotSettings>,
}

impl ScanSettings {
    /// Normalizes to a validated [`ScanPlan`].
    pub fn to_plan(&self) -> Result<ScanPlan> {
        let slots = self
            .slots
            .iter()
            .map(|s| ScanSlot::new(s.instruction, s.start_ns(), s.end_ns()))
            .collect();
        ScanPlan::new(slots, self.sample_count, self.repetition)
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            sample_count: 1,
            repetition: 1,
            slots: Vec::new(),
        }
    }
}

/// One swept slot, bounds normalized to nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanSlot {
    pub instruction_index: usize,
    pub start_ns: f64,
    pub end_ns: f64,
}

impl ScanSlot {
    pub fn new(instruction_index: usize, start_ns: f64, end_ns: f64) -> Self {
        Self {
            instruction_index,
            start_ns,
            end_ns,
        }
    }
}

/// A validated scan plan: slots, sample count, repetition.
///
/// Construction checks the counts and the slot bounds; the one check that
/// needs external knowledge (that each slot targets an existing instruction)
/// is [`validate`](ScanPlan::validate), called by the controller against the
/// live table before anything else happens.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPlan {
    slots: Vec<ScanSlot>,
    sample_count: usize,
    repetition: usize,
}

impl ScanPlan {
    /// Builds a plan.
    ///
    /// Fails when the plan is structurally unusable (no slots, zero samples
    /// or repetitions) or when a slot bound would sweep a duration to a
    /// non-positive value; a swept instruction must stay executable at every
    /// point of its range.
    pub fn new(slots: Vec<ScanSlot>, sample_count: usize, repetition: usize) -> Result<Self> {
        if slots.is_empty() {
            return Err(SequencerError::range("plan contains no scan slots"));
        }
        if sample_count < 1 {
            return Err(SequencerError::range("sample count must be at least 1"));
        }
        if repetition < 1 {
            return Err(SequencerError::range("repetition must be at least 1"));
        }
        for (i, slot) in slots.iter().enumerate() {
            for (field, bound) in [("start", slot.start_ns), ("end", slot.end_ns)] {
                if !bound.is_finite() || bound <= 0.0 {
                    return Err(SequencerError::slot_format(
                        i,
                        field,
                        format!("must be a positive duration in ns (got {bound})"),
                    ));
                }
            }
        }
        Ok(Self {
            slots,
            sample_count,
            repetition,
        })
    }

    pub fn slots(&self) -> &[ScanSlot] {
        &self.slots
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    pub fn repetition(&self) -> usize {
        self.repetition
    }

    /// Number of rows the built matrix will have.
    pub fn row_count(&self) -> usize {
        self.sample_count * self.repetition
    }

    /// Checks every slot against the table length. Called before any board or
    /// table mutation; a failure here must leave everything untouched.
    pub fn validate(&self, table_len: usize) -> Result<()> {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.instruction_index >= table_len {
                return Err(SequencerError::range(format!(
                    "slot {} targets instruction {}, but the table holds {} instructions",
                    i, slot.instruction_index, table_len
                )));
            }
        }
        Ok(())
    }

    /// Step 1: the un-expanded sample grid, `(sample_count, slot_count)`.
    /// Column `j` runs from `slots[j].start_ns` to `slots[j].end_ns`
    /// inclusive; a single sample collapses to the start bound.
    pub fn sample_grid(&self) -> Array2<f64> {
        let mut grid = Array2::zeros((self.sample_count, self.slot_count()));
        for (j, slot) in self.slots.iter().enumerate() {
            let column = Array1::linspace(slot.start_ns, slot.end_ns, self.sample_count);
            grid.column_mut(j).assign(&column);
        }
        grid
    }

    /// Step 2: every grid row duplicated `repetition` times, contiguously.
    pub fn expanded_grid(&self) -> Array2<f64> {
        let grid = self.sample_grid();
        let mut expanded = Array2::zeros((self.row_count(), self.slot_count()));
        for (i, row) in grid.outer_iter().enumerate() {
            for r in 0..self.repetition {
                expanded.row_mut(i * self.repetition + r).assign(&row);
            }
        }
        expanded
    }

    /// Step 3: the full matrix, rows shuffled by one uniform permutation
    /// drawn from `rng`.
    pub fn build_matrix<R: Rng + ?Sized>(&self, rng: &mut R) -> Array2<f64> {
        let expanded = self.expanded_grid();
        let mut order: Vec<usize> = (0..expanded.nrows()).collect();
        order.shuffle(rng);
        expanded.select(Axis(0), &order)
    }
}
