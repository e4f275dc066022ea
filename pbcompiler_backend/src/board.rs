//! The pulse-generator board command surface.
//!
//! [`BoardInterface`] is the seam between the backend and the physical
//! sequencer: everything the compiler and the scan controller ever ask of the
//! hardware goes through it. The hardware crate implements it over the vendor
//! C library; [`SoftwareBoard`] implements it in memory for tests, demos, and
//! dry runs.
//!
//! Programming follows a strict bracketed protocol: one
//! `begin_programming()`, then one `emit(..)` per instruction in execution
//! order, then one `end_programming()`. `SoftwareBoard` enforces the brackets
//! and panics on violations, so a mis-sequenced caller fails loudly in tests
//! long before it reaches a real board.

use log::debug;

use crate::instruction::{CompiledInstruction, Opcode};

/// Explicit board configuration, passed in at construction rather than read
/// from ambient state.
#[derive(Debug, Clone, PartialEq)]
pub struct BoardConfig {
    /// Which board to drive when several are installed.
    pub board_id: u32,
    /// Core clock of the board in MHz.
    pub core_clock_mhz: f64,
    /// Number of digital output channels.
    pub channel_count: usize,
}

impl Default for BoardConfig {
    /// A single PulseBlasterUSB: board 0, 100 MHz core clock, 24 outputs.
    fn default() -> Self {
        Self {
            board_id: 0,
            core_clock_mhz: 100.0,
            channel_count: crate::table::DEFAULT_CHANNEL_COUNT,
        }
    }
}

/// Hardware command surface of the pulse-generator board.
///
/// Per-call failures on a real board are driver-level faults and panic inside
/// the implementation; only opening the device reports a recoverable error
/// (fatal to startup, but reportable).
pub trait BoardInterface {
    /// Selects the active board when several are installed.
    fn select(&mut self, board_id: u32);
    /// Sets the core clock frequency in MHz.
    fn set_clock(&mut self, freq_mhz: f64);
    /// Opens a programming session. Must be balanced by `end_programming`.
    fn begin_programming(&mut self);
    /// Emits one instruction into the open programming session.
    fn emit(&mut self, channel_mask: u32, opcode: Opcode, operand: u32, duration_ns: f64);
    /// Commits the open programming session.
    fn end_programming(&mut self);
    /// Starts execution of the loaded program.
    fn start(&mut self);
    /// Halts execution.
    fn stop(&mut self);
    /// Rewinds execution to the first instruction.
    fn reset(&mut self);
    /// Driver/firmware version string.
    fn query_version(&self) -> String;
    /// Number of boards the driver can see.
    fn query_board_count(&self) -> u32;
}

/// In-memory stand-in for a pulse-generator board.
///
/// Records every committed program, tracks the run state, and counts calls so
/// tests can assert on hardware traffic (including its absence).
///
/// # Panics
///
/// Panics when the programming protocol is violated: `emit` or
/// `end_programming` outside a session, or `begin_programming` inside one.
#[derive(Debug, Default)]
pub struct SoftwareBoard {
    session: Option<Vec<CompiledInstruction>>,
    program: Vec<CompiledInstruction>,
    running: bool,
    selected: Option<u32>,
    clock_mhz: Option<f64>,
    calls: usize,
    load_count: usize,
    start_count: usize,
    stop_count: usize,
    reset_count: usize,
}

impl SoftwareBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last committed program.
    pub fn program(&self) -> &[CompiledInstruction] {
        &self.program
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Total number of trait calls received, across all methods.
    pub fn call_count(&self) -> usize {
        self.calls
    }

    /// Number of committed programming sessions.
    pub fn load_count(&self) -> usize {
        self.load_count
    }

    pub fn start_count(&self) -> usize {
        self.start_count
    }

    pub fn stop_count(&self) -> usize {
        self.stop_count
    }

    pub fn reset_count(&self) -> usize {
        self.reset_count
    }

    pub fn selected(&self) -> Option<u32> {
        self.selected
    }

    pub fn clock_mhz(&self) -> Option<f64> {
        self.clock_mhz
    }
}

impl BoardInterface for SoftwareBoard {
    fn select(&mut self, board_id: u32) {
        self.calls += 1;
        self.selected = Some(board_id);
    }

    fn set_clock(&mut self, freq_mhz: f64) {
        self.calls += 1;
        self.clock_mhz = Some(freq_mhz);
    }

    fn begin_programming(&mut self) {
        self.calls += 1;
        assert!(
            self.session.is_none(),
            "begin_programming while a programming session is already open"
        );
        self.session = Some(Vec::new());
    }

    fn emit(&mut self, channel_mask: u32, opcode: Opcode, operand: u32, duration_ns: f64) {
        self.calls += 1;
        match self.session.as_mut() {
            Some(session) => session.push(CompiledInstruction {
                channel_mask,
                opcode,
                operand,
                duration_ns,
            }),
            None => panic!("emit outside a programming session"),
        }
    }

    fn end_programming(&mut self) {
        self.calls += 1;
        match self.session.take() {
            Some(session) => {
                debug!("software board: committed {} instructions", session.len());
                self.program = session;
                self.load_count += 1;
            }
            None => panic!("end_programming without begin_programming"),
        }
    }

    fn start(&mut self) {
        self.calls += 1;
        self.running = true;
        self.start_count += 1;
    }

    fn stop(&mut self) {
        self.calls += 1;
        self.running = false;
        self.stop_count += 1;
    }

    fn reset(&mut self) {
        self.calls += 1;
        self.reset_count += 1;
    }

    fn query_version(&self) -> String {
        "software-board".to_string()
    }

    fn query_board_count(&self) -> u32 {
        1
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::instruction::Opcode;

    #[test]
    fn records_committed_program() {
        let mut board = SoftwareBoard::new();
        board.begin_programming();
        board.emit(0b101, Opcode::Continue, 0, 1e6);
        board.emit(0, Opcode::Stop, 0, 10.0);
        board.end_programming();

        assert_eq!(board.load_count(), 1);
        assert_eq!(board.program().len(), 2);
        assert_eq!(board.program()[0].channel_mask, 0b101);
        assert_eq!(board.program()[1].opcode, Opcode::Stop);
    }

    #[test]
    fn run_state_follows_start_stop() {
        let mut board = SoftwareBoard::new();
        assert!(!board.is_running());
        board.start();
        assert!(board.is_running());
        board.stop();
        board.reset();
        assert!(!board.is_running());
        assert_eq!(board.start_count(), 1);
        assert_eq!(board.stop_count(), 1);
        assert_eq!(board.reset_count(), 1);
    }

    #[test]
    #[should_panic(expected = "emit outside a programming session")]
    fn emit_requires_open_session() {
        let mut board = SoftwareBoard::new();
        board.emit(0, Opcode::Continue, 0, 1.0);
    }

    #[test]
    #[should_panic(expected = "already open")]
    fn begin_twice_is_rejected() {
        let mut board = SoftwareBoard::new();
        board.begin_programming();
        board.begin_programming();
    }

    #[test]
    #[should_panic(expected = "without begin_programming")]
    fn end_requires_open_session() {
        let mut board = SoftwareBoard::new();
        board.end_programming();
    }

    #[test]
    fn configuration_calls_are_recorded() {
        let mut board = SoftwareBoard::new();
        assert_eq!(board.selected(), None);
        board.select(3);
        board.set_clock(100.0);
        assert_eq!(board.selected(), Some(3));
        assert_eq!(board.clock_mhz(), Some(100.0));
        assert_eq!(board.query_board_count(), 1);
        assert_eq!(board.query_version(), "software-board");
        assert_eq!(board.call_count(), 2);
    }

    #[test]
    fn recommit_replaces_program() {
        let mut board = SoftwareBoard::new();
        board.begin_programming();
        board.emit(1, Opcode::Continue, 0, 1.0);
        board.end_programming();
        board.begin_programming();
        board.emit(2, Opcode::Branch, 0, 2.0);
        board.end_programming();

        assert_eq!(board.load_count(), 2);
        assert_eq!(board.program().len(), 1);
        assert_eq!(board.program()[0].channel_mask, 2);
    }
}
