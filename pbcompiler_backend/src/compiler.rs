//! The instruction compiler: a straight, order-preserving transform from the
//! symbolic table to the hardware-ready program, plus the side-effecting load
//! onto a board.
//!
//! Compilation normalizes each duration to nanoseconds
//! (`raw_value × scale(unit)`) and copies mask, opcode, and operand through
//! untouched. There is no reordering, no optimization, and no validation of
//! jump targets: operands mean whatever the hardware says they mean.
//!
//! Loading drives the board through the strict bracketed protocol:
//! `begin_programming()`, one `emit(..)` per instruction in table order,
//! `end_programming()`. The whole table is compiled (and therefore validated)
//! before the first board call, so a bad row never leaves a half-programmed
//! device.
//!
//! # Examples
//!
//! ```
//! use pbcompiler_backend::board::SoftwareBoard;
//! use pbcompiler_backend::compiler;
//! use pbcompiler_backend::instruction::{Instruction, TimeUnit};
//! use pbcompiler_backend::table::InstructionTable;
//!
//! let mut table = InstructionTable::new(24);
//! table.push(Instruction::continue_for(10.0, TimeUnit::Ms).with_channels(&[0, 3]));
//! table.push(Instruction::stop(10.0, TimeUnit::Ns));
//!
//! let mut board = SoftwareBoard::new();
//! let program = compiler::load_program(&mut board, &table).unwrap();
//! assert_eq!(program.len(), 2);
//! assert_eq!(board.program()[0].duration_ns, 10_000_000.0);
//! ```

use log::debug;

use crate::board::BoardInterface;
use crate::error::{Result, SequencerError};
use crate::instruction::{CompiledInstruction, Instruction};
use crate::table::InstructionTable;

/// Compiles one instruction. `index` is the instruction's position in the
/// table and is used only for error reporting.
///
/// Fails with a format error naming the instruction and field when the
/// duration does not normalize to a positive, finite nanosecond count.
pub fn compile(index: usize, instr: &Instruction) -> Result<CompiledInstruction> {
    let duration_ns = instr.duration_ns();
    if !duration_ns.is_finite() {
        return Err(SequencerError::instr_format(
            index,
            "duration",
            format!("does not normalize to a finite value (got {duration_ns})"),
        ));
    }
    if duration_ns <= 0.0 {
        return Err(SequencerError::instr_format(
            index,
            "duration",
            format!("must be positive (got {}{})", instr.duration, instr.unit),
        ));
    }
    Ok(CompiledInstruction {
        channel_mask: instr.channel_mask,
        opcode: instr.opcode,
        operand: instr.operand,
        duration_ns,
    })
}

/// Compiles the whole table in order. Fails on the first bad row.
pub fn compile_table(table: &InstructionTable) -> Result<Vec<CompiledInstruction>> {
    table
        .iter()
        .enumerate()
        .map(|(index, instr)| compile(index, instr))
        .collect()
}

/// Compiles the table and programs it onto the board.
///
/// All rows compile before any board call, so validation failures leave the
/// board untouched. Returns the compiled program that was loaded.
pub fn load_program<B: BoardInterface>(
    board: &mut B,
    table: &InstructionTable,
) -> Result<Vec<CompiledInstruction>> {
    let program = compile_table(table)?;
    board.begin_programming();
    for instr in &program {
        board.emit(
            instr.channel_mask,
            instr.opcode,
            instr.operand,
            instr.duration_ns,
        );
    }
    board.end_programming();
    debug!("loaded program of {} instructions", program.len());
    Ok(program)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::board::SoftwareBoard;
    use crate::instruction::{Opcode, TimeUnit};

    fn table_with(instrs: Vec<Instruction>) -> InstructionTable {
        let mut table = InstructionTable::new(24);
        for instr in instrs {
            table.push(instr);
        }
        table
    }

    #[test]
    fn mask_passes_through() {
        let instr = Instruction::continue_for(1.0, TimeUnit::Ms).with_channels(&[0, 3, 23]);
        let compiled = compile(0, &instr).unwrap();
        assert_eq!(compiled.channel_mask, (1 << 0) | (1 << 3) | (1 << 23));
    }

    #[test]
    fn durations_normalize_to_ns() {
        for (unit, expected) in [
            (TimeUnit::Ms, 10_000_000.0),
            (TimeUnit::Us, 10_000.0),
            (TimeUnit::Ns, 10.0),
        ] {
            let compiled = compile(0, &Instruction::continue_for(10.0, unit)).unwrap();
            assert_eq!(compiled.duration_ns, expected);
        }
    }

    #[test]
    fn operand_is_uninterpreted() {
        // A dangling branch target compiles fine; targets are a hardware
        // concern.
        let instr = Instruction::branch_to(999, 1.0, TimeUnit::Us);
        let compiled = compile(0, &instr).unwrap();
        assert_eq!(compiled.opcode, Opcode::Branch);
        assert_eq!(compiled.operand, 999);
    }

    #[test]
    fn nonpositive_duration_is_named() {
        let err = compile(4, &Instruction::continue_for(0.0, TimeUnit::Ms)).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("instruction 4"), "got: {msg}");
        assert!(msg.contains("duration"), "got: {msg}");

        let err = compile(0, &Instruction::continue_for(-2.0, TimeUnit::Ns)).unwrap_err();
        assert!(matches!(err, SequencerError::Format { .. }));
    }

    #[test]
    fn nonfinite_duration_is_rejected() {
        let err = compile(1, &Instruction::continue_for(f64::NAN, TimeUnit::Ms)).unwrap_err();
        assert!(matches!(err, SequencerError::Format { .. }));
        let err = compile(1, &Instruction::continue_for(f64::INFINITY, TimeUnit::Ms)).unwrap_err();
        assert!(err.to_string().contains("instruction 1"));
    }

    #[test]
    fn compile_table_reports_first_bad_row() {
        let table = table_with(vec![
            Instruction::continue_for(1.0, TimeUnit::Ms),
            Instruction::continue_for(0.0, TimeUnit::Ms),
            Instruction::continue_for(-1.0, TimeUnit::Ms),
        ]);
        let err = compile_table(&table).unwrap_err();
        assert!(err.to_string().contains("instruction 1"));
    }

    #[test]
    fn load_preserves_table_order() {
        let table = table_with(vec![
            Instruction::loop_start(5, 1.0, TimeUnit::Ms).with_channels(&[0]),
            Instruction::continue_for(2.0, TimeUnit::Us).with_channels(&[1]),
            Instruction::end_loop(0, 3.0, TimeUnit::Ns),
            Instruction::stop(10.0, TimeUnit::Ns),
        ]);
        let mut board = SoftwareBoard::new();
        let program = load_program(&mut board, &table).unwrap();

        assert_eq!(board.load_count(), 1);
        assert_eq!(board.program(), &program[..]);
        let opcodes: Vec<_> = board.program().iter().map(|i| i.opcode).collect();
        assert_eq!(
            opcodes,
            [Opcode::Loop, Opcode::Continue, Opcode::EndLoop, Opcode::Stop]
        );
        assert_eq!(board.program()[0].operand, 5);
        assert_eq!(board.program()[2].operand, 0);
    }

    #[test]
    fn bad_row_means_zero_board_calls() {
        let table = table_with(vec![
            Instruction::continue_for(1.0, TimeUnit::Ms),
            Instruction::continue_for(0.0, TimeUnit::Ms),
        ]);
        let mut board = SoftwareBoard::new();
        assert!(load_program(&mut board, &table).is_err());
        assert_eq!(board.call_count(), 0);
        assert_eq!(board.load_count(), 0);
    }
}
