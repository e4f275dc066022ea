//! Provides definitions and implementations for the symbolic instruction model.
//!
//! ## Main Structures and Enumerations:
//!
//! - `Opcode`: An enumeration of the sequencing opcodes understood by the pulse
//!   program engine (`CONTINUE`, `STOP`, `LOOP`, `END_LOOP`, `JSR`, `RTS`,
//!   `BRANCH`, `LONG_DELAY`, `WAIT`). The set is closed: there is no escape
//!   hatch for dispatching on opcode names at runtime.
//!
//! - `TimeUnit`: Display unit of an instruction duration (`ms`, `us`, `ns`).
//!   Durations are edited and persisted in their display unit and normalized
//!   to nanoseconds only at compile time.
//!
//! - `Instruction`: One row of the sequence table: a free-text note, a
//!   channel bitmask, an opcode with its operand, and a duration with its
//!   display unit. The operand is opcode-dependent (loop count for
//!   `LOOP`/`LONG_DELAY`, target instruction index for
//!   `END_LOOP`/`JSR`/`BRANCH`, unused otherwise) and is carried through
//!   uninterpreted.
//!
//! - `CompiledInstruction`: The hardware-ready form, a bitmask, opcode,
//!   operand, and duration normalized to nanoseconds.
//!
//! ## Features:
//!
//! - Convenience constructors (`continue_for`, `loop_start`, `branch_to`, ...)
//!   for the common opcodes.
//! - Canonical opcode and unit names (`Opcode::name`, `TimeUnit::name`) as
//!   written into sequence documents, with matching `from_name` parsers.

use std::fmt;

/// Sequencing opcodes of the pulse program engine.
///
/// The operand of an instruction is interpreted by the hardware according to
/// its opcode; the compiler passes it through untouched. In particular, jump
/// targets (`END_LOOP`, `JSR`, `BRANCH`) are positional instruction indices
/// and are *not* range-checked against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continue,
    Stop,
    Loop,
    EndLoop,
    Jsr,
    Rts,
    Branch,
    LongDelay,
    Wait,
}

impl Opcode {
    /// Every opcode, in the order the hardware documents them.
    pub const ALL: [Opcode; 9] = [
        Opcode::Continue,
        Opcode::Stop,
        Opcode::Loop,
        Opcode::EndLoop,
        Opcode::Jsr,
        Opcode::Rts,
        Opcode::Branch,
        Opcode::LongDelay,
        Opcode::Wait,
    ];

    /// Canonical name as written into sequence documents.
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Continue => "CONTINUE",
            Opcode::Stop => "STOP",
            Opcode::Loop => "LOOP",
            Opcode::EndLoop => "END_LOOP",
            Opcode::Jsr => "JSR",
            Opcode::Rts => "RTS",
            Opcode::Branch => "BRANCH",
            Opcode::LongDelay => "LONG_DELAY",
            Opcode::Wait => "WAIT",
        }
    }

    /// Parses a canonical opcode name. Returns `None` for anything else.
    pub fn from_name(name: &str) -> Option<Self> {
        Opcode::ALL.iter().copied().find(|op| op.name() == name)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Display unit of an instruction duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Ms,
    Us,
    Ns,
}

impl TimeUnit {
    /// Multiplier taking a raw duration value in this unit to nanoseconds.
    pub fn scale_to_ns(&self) -> f64 {
        match self {
            TimeUnit::Ms => 1e6,
            TimeUnit::Us => 1e3,
            TimeUnit::Ns => 1.0,
        }
    }

    /// Canonical name as written into sequence documents.
    pub fn name(&self) -> &'static str {
        match self {
            TimeUnit::Ms => "ms",
            TimeUnit::Us => "us",
            TimeUnit::Ns => "ns",
        }
    }

    /// Parses a canonical unit name. Returns `None` for anything else.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ms" => Some(TimeUnit::Ms),
            "us" => Some(TimeUnit::Us),
            "ns" => Some(TimeUnit::Ns),
            _ => None,
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One row of the sequence table.
///
/// The execution position of an instruction is its index in the owning
/// [`InstructionTable`](crate::table::InstructionTable), not a field here;
/// reordering the table reorders the program.
///
/// Fields are public: the table is an editing surface and validation is
/// deferred to compile time (see [`compile`](crate::compiler::compile)), with
/// one exception: the channel-mask width is enforced by the table when an
/// instruction is inserted.
///
/// # Examples
///
/// ```
/// use pbcompiler_backend::instruction::*;
///
/// let instr = Instruction::continue_for(10.0, TimeUnit::Ms).with_channels(&[0, 3]);
/// assert_eq!(instr.channel_mask, 0b1001);
/// assert_eq!(instr.duration_ns(), 10_000_000.0);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Free-text label with no semantic effect.
    pub note: String,
    /// Bit `i` set drives channel `i` high for the duration of this instruction.
    pub channel_mask: u32,
    pub opcode: Opcode,
    /// Opcode-dependent integer, passed through to the hardware uninterpreted.
    pub operand: u32,
    /// Raw duration value in the display unit `unit`.
    pub duration: f64,
    pub unit: TimeUnit,
}

impl Instruction {
    /// Constructs an instruction with no channels driven and an empty note.
    pub fn new(opcode: Opcode, operand: u32, duration: f64, unit: TimeUnit) -> Self {
        Self {
            note: String::new(),
            channel_mask: 0,
            opcode,
            operand,
            duration,
            unit,
        }
    }

    /// A `CONTINUE` instruction of the given duration.
    pub fn continue_for(duration: f64, unit: TimeUnit) -> Self {
        Self::new(Opcode::Continue, 0, duration, unit)
    }

    /// A `STOP` instruction. The duration is still emitted to the hardware.
    pub fn stop(duration: f64, unit: TimeUnit) -> Self {
        Self::new(Opcode::Stop, 0, duration, unit)
    }

    /// A `LOOP` head repeating `count` times.
    pub fn loop_start(count: u32, duration: f64, unit: TimeUnit) -> Self {
        Self::new(Opcode::Loop, count, duration, unit)
    }

    /// An `END_LOOP` closing the loop headed at instruction `target`.
    pub fn end_loop(target: u32, duration: f64, unit: TimeUnit) -> Self {
        Self::new(Opcode::EndLoop, target, duration, unit)
    }

    /// A `BRANCH` jumping to instruction `target`.
    pub fn branch_to(target: u32, duration: f64, unit: TimeUnit) -> Self {
        Self::new(Opcode::Branch, target, duration, unit)
    }

    /// A `WAIT` instruction: the board pauses until the next hardware trigger.
    pub fn wait(duration: f64, unit: TimeUnit) -> Self {
        Self::new(Opcode::Wait, 0, duration, unit)
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    /// Drives each listed channel high.
    ///
    /// # Panics
    ///
    /// Panics if any channel index is 32 or above (masks are 32-bit wide; the
    /// board-specific channel count is enforced by the table).
    pub fn with_channels(mut self, channels: &[usize]) -> Self {
        for &ch in channels {
            self.set_channel(ch, true);
        }
        self
    }

    /// Sets or clears a single bit of the channel mask.
    ///
    /// # Panics
    ///
    /// Panics if `channel >= 32`.
    pub fn set_channel(&mut self, channel: usize, high: bool) {
        assert!(
            channel < 32,
            "Channel index {} exceeds the 32-bit mask width",
            channel
        );
        if high {
            self.channel_mask |= 1 << channel;
        } else {
            self.channel_mask &= !(1 << channel);
        }
    }

    /// True when bit `channel` of the mask is set.
    pub fn channel(&self, channel: usize) -> bool {
        channel < 32 && (self.channel_mask >> channel) & 1 == 1
    }

    /// Duration normalized to nanoseconds.
    pub fn duration_ns(&self) -> f64 {
        self.duration * self.unit.scale_to_ns()
    }
}

impl Default for Instruction {
    /// The row the editing surface inserts on "add": `CONTINUE` for 1 ms,
    /// no channels driven.
    fn default() -> Self {
        Self::new(Opcode::Continue, 0, 1.0, TimeUnit::Ms)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}({}) mask={:#08x} {}{}",
            self.opcode, self.operand, self.channel_mask, self.duration, self.unit
        )?;
        if !self.note.is_empty() {
            write!(f, " ; {}", self.note)?;
        }
        Ok(())
    }
}

/// Hardware-ready form of an instruction: same mask, opcode, and operand,
/// duration normalized to nanoseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledInstruction {
    pub channel_mask: u32,
    pub opcode: Opcode,
    pub operand: u32,
    pub duration_ns: f64,
}

impl fmt::Display for CompiledInstruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}({}) mask={:#08x} {}ns",
            self.opcode, self.operand, self.channel_mask, self.duration_ns
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn opcode_names_round_trip() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_name(op.name()), Some(op));
        }
        assert_eq!(Opcode::from_name("NOP"), None);
        assert_eq!(Opcode::from_name("continue"), None);
    }

    #[test]
    fn unit_scales() {
        assert_eq!(TimeUnit::Ms.scale_to_ns(), 1e6);
        assert_eq!(TimeUnit::Us.scale_to_ns(), 1e3);
        assert_eq!(TimeUnit::Ns.scale_to_ns(), 1.0);
    }

    #[test]
    fn unit_names_round_trip() {
        for unit in [TimeUnit::Ms, TimeUnit::Us, TimeUnit::Ns] {
            assert_eq!(TimeUnit::from_name(unit.name()), Some(unit));
        }
        assert_eq!(TimeUnit::from_name("s"), None);
    }

    #[test]
    fn channel_bits() {
        let mut instr = Instruction::continue_for(1.0, TimeUnit::Ms).with_channels(&[0, 3, 23]);
        assert_eq!(instr.channel_mask, (1 << 0) | (1 << 3) | (1 << 23));
        assert!(instr.channel(3));
        assert!(!instr.channel(4));
        instr.set_channel(3, false);
        assert_eq!(instr.channel_mask, (1 << 0) | (1 << 23));
    }

    #[test]
    #[should_panic(expected = "exceeds the 32-bit mask width")]
    fn channel_out_of_mask() {
        Instruction::continue_for(1.0, TimeUnit::Ms).with_channels(&[32]);
    }

    #[test]
    fn duration_normalization() {
        assert_eq!(
            Instruction::continue_for(10.0, TimeUnit::Ms).duration_ns(),
            10_000_000.0
        );
        assert_eq!(
            Instruction::continue_for(10.0, TimeUnit::Us).duration_ns(),
            10_000.0
        );
        assert_eq!(
            Instruction::continue_for(10.0, TimeUnit::Ns).duration_ns(),
            10.0
        );
    }
}
