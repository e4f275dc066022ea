//! The instruction table: the ordered, editable source of truth for a pulse
//! program.
//!
//! The table owns the fixed channel count of the target board and a free-text
//! device label per channel (what is physically wired to each output). Rows
//! are [`Instruction`]s; their position in the table is their execution index.
//!
//! Edits are cheap and unvalidated except for structural constraints the rest
//! of the backend relies on: channel masks must fit the channel count, and
//! indexed accessors panic on out-of-range rows the same way slice indexing
//! does. Value-level validation (positive durations) happens at compile time.

use std::fmt;

use crate::instruction::{Instruction, TimeUnit};

/// Output count of the PulseBlasterUSB boards this backend targets.
pub const DEFAULT_CHANNEL_COUNT: usize = 24;

/// Ordered, mutable collection of instructions plus per-channel metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct InstructionTable {
    channel_count: usize,
    channel_labels: Vec<String>,
    instrs: Vec<Instruction>,
}

impl InstructionTable {
    /// An empty table for a board with `channel_count` digital outputs.
    ///
    /// # Panics
    ///
    /// Panics unless `1 <= channel_count <= 32`.
    pub fn new(channel_count: usize) -> Self {
        assert!(
            (1..=32).contains(&channel_count),
            "Channel count {} outside the supported range 1..=32",
            channel_count
        );
        Self {
            channel_count,
            channel_labels: vec![String::new(); channel_count],
            instrs: Vec::new(),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Mask with every available channel bit set.
    pub fn full_mask(&self) -> u32 {
        if self.channel_count == 32 {
            u32::MAX
        } else {
            (1u32 << self.channel_count) - 1
        }
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// Appends an instruction at the end of the program.
    ///
    /// # Panics
    ///
    /// Panics if the instruction drives a channel the board does not have.
    pub fn push(&mut self, instr: Instruction) {
        self.check_mask(&instr);
        self.instrs.push(instr);
    }

    /// Inserts an instruction at `index`, shifting later rows down.
    ///
    /// # Panics
    ///
    /// Panics if `index > len()` or on a mask wider than the channel count.
    pub fn insert(&mut self, index: usize, instr: Instruction) {
        self.check_mask(&instr);
        self.instrs.insert(index, instr);
    }

    /// Removes and returns the instruction at `index`, shifting later rows up.
    ///
    /// Jump operands in remaining instructions are positional and are *not*
    /// rewritten; keeping them coherent is the editor's concern.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn remove(&mut self, index: usize) -> Instruction {
        self.instrs.remove(index)
    }

    pub fn get(&self, index: usize) -> Option<&Instruction> {
        self.instrs.get(index)
    }

    /// Mutable access to one row.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn instr_(&mut self, index: usize) -> &mut Instruction {
        &mut self.instrs[index]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instruction> {
        self.instrs.iter()
    }

    pub fn instrs(&self) -> &[Instruction] {
        &self.instrs
    }

    /// Rewrites one row's duration, expressed in `unit`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn set_duration(&mut self, index: usize, duration: f64, unit: TimeUnit) {
        let instr = &mut self.instrs[index];
        instr.duration = duration;
        instr.unit = unit;
    }

    /// Rewrites one row's duration from a nanosecond value, re-expressed in
    /// that row's current display unit. This is the write path the scan
    /// controller uses between repetitions.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn write_duration_ns(&mut self, index: usize, duration_ns: f64) {
        let instr = &mut self.instrs[index];
        instr.duration = duration_ns / instr.unit.scale_to_ns();
    }

    /// Sets or clears one channel bit of one row.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()` or `channel >= channel_count()`.
    pub fn set_channel(&mut self, index: usize, channel: usize, high: bool) {
        assert!(
            channel < self.channel_count,
            "Channel {} does not exist on a {}-channel board",
            channel,
            self.channel_count
        );
        self.instrs[index].set_channel(channel, high);
    }

    pub fn channel_label(&self, channel: usize) -> &str {
        &self.channel_labels[channel]
    }

    pub fn channel_labels(&self) -> &[String] {
        &self.channel_labels
    }

    /// # Panics
    ///
    /// Panics if `channel >= channel_count()`.
    pub fn set_channel_label(&mut self, channel: usize, label: impl Into<String>) {
        self.channel_labels[channel] = label.into();
    }

    fn check_mask(&self, instr: &Instruction) {
        assert!(
            instr.channel_mask & !self.full_mask() == 0,
            "Instruction mask {:#x} drives channels beyond the {}-channel board",
            instr.channel_mask,
            self.channel_count
        );
    }
}

impl Default for InstructionTable {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_COUNT)
    }
}

impl fmt::Display for InstructionTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "InstructionTable ({} channels, {} instructions)",
            self.channel_count,
            self.instrs.len()
        )?;
        for (i, instr) in self.instrs.iter().enumerate() {
            writeln!(f, "  {:>3}: {}", i, instr)?;
        }
        Ok(())
    }
}
