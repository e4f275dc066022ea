//! Provides a minimal rust wrapper for parts of the SpinCore SpinAPI C
//! library.
//!
//! ## Overview
//!
//! The core of this module is the [`SpinBoard`] struct which represents one
//! opened PulseBlasterUSB board. [`SpinBoard::open`] walks the SpinAPI
//! bring-up sequence (count, select, init, core clock) and returns a
//! recoverable error if the board is absent or the driver refuses it; from
//! then on the struct implements
//! [`BoardInterface`], so the
//! hardware-free controller drives the real board through exactly the calls
//! it makes against the software substitute.
//!
//! ## Safety and Error Handling
//!
//! Every SpinAPI function returns a negative code on failure. The
//! [`spin_call`] wrapper checks the code, retrieves the driver's error text,
//! appends it to a `spinapi_error.logs` file in the directory of the calling
//! shell, and panics with the same message. Only [`SpinBoard::open`] reports
//! failures as recoverable errors; driver trouble after bring-up is fatal.
//!
//! ## Constants and Types
//!
//! Type aliases (`CInt32`, `CFloat64`, ...) mirror the C signatures, and
//! [`opcode_code`] maps the backend's [`Opcode`] to the raw instruction
//! codes the driver expects. Durations are handed over in nanoseconds as
//! `double`, exactly as `pb_inst_pbonly` takes them.

use std::ffi::CStr;
use std::fs::OpenOptions;
use std::io::Write;

use log::{debug, info};

use pbcompiler_backend::board::{BoardConfig, BoardInterface};
use pbcompiler_backend::error::{Result, SequencerError};
use pbcompiler_backend::instruction::Opcode;

type CConstStr = *const libc::c_char;
type CInt32 = libc::c_int;
type CUint32 = libc::c_uint;
type CFloat64 = libc::c_double;

/// Target of `pb_start_programming` for pulse program memory.
pub const PB_PULSE_PROGRAM: CInt32 = 0;

/// Raw instruction code of `op` in the driver's opcode enumeration.
pub fn opcode_code(op: Opcode) -> CInt32 {
    match op {
        Opcode::Continue => 0,
        Opcode::Stop => 1,
        Opcode::Loop => 2,
        Opcode::EndLoop => 3,
        Opcode::Jsr => 4,
        Opcode::Rts => 5,
        Opcode::Branch => 6,
        Opcode::LongDelay => 7,
        Opcode::Wait => 8,
    }
}

#[link(name = "spinapi")]
extern "C" {
    fn pb_count_boards() -> CInt32;
    fn pb_select_board(board_num: CInt32) -> CInt32;
    fn pb_init() -> CInt32;
    fn pb_close() -> CInt32;
    fn pb_core_clock(clock_freq: CFloat64);

    fn pb_start_programming(device: CInt32) -> CInt32;
    fn pb_inst_pbonly(
        flags: CUint32,
        inst: CInt32,
        inst_data: CInt32,
        length: CFloat64,
    ) -> CInt32;
    fn pb_stop_programming() -> CInt32;

    fn pb_start() -> CInt32;
    fn pb_stop() -> CInt32;
    fn pb_reset() -> CInt32;

    fn pb_get_version() -> CConstStr;
    fn pb_get_error() -> CConstStr;
}

/// Calls a SpinAPI function and handles potential errors.
///
/// A negative return code means failure; the driver's error text is fetched
/// with `pb_get_error`, appended to `spinapi_error.logs`, and turned into a
/// panic. Non-negative codes (for `pb_inst_pbonly`, the created instruction
/// index) are passed through.
///
/// # Panics
///
/// Panics if the wrapped call returns a negative code, or if the log file
/// cannot be written.
pub fn spin_call<F: FnOnce() -> CInt32>(func: F) -> CInt32 {
    let code = func();
    if code < 0 {
        let error_string = last_error();
        let mut file = OpenOptions::new()
            .write(true)
            .append(true)
            .create(true)
            .open("./spinapi_error.logs")
            .expect("Failed to open spinapi_error.logs");
        writeln!(file, "SpinAPI Error: {}", error_string)
            .expect("Failed to write error to spinapi_error.logs");
        panic!("SpinAPI Error: {}", error_string);
    }
    code
}

fn last_error() -> String {
    unsafe { CStr::from_ptr(pb_get_error()) }
        .to_string_lossy()
        .into_owned()
}

fn driver_version() -> String {
    unsafe { CStr::from_ptr(pb_get_version()) }
        .to_string_lossy()
        .into_owned()
}

/// One opened PulseBlaster board. Closes the driver handle on drop.
pub struct SpinBoard {
    board_id: u32,
}

impl SpinBoard {
    /// Brings up the board described by `cfg`: count the boards on the bus,
    /// select and initialize the requested one, and set its core clock.
    ///
    /// Unlike later driver calls, failures here are returned as
    /// [`SequencerError::HardwareInit`]: an absent or unresponsive board at
    /// startup is a condition the caller reports, not a crash.
    pub fn open(cfg: &BoardConfig) -> Result<Self> {
        let count = unsafe { pb_count_boards() };
        if count < 0 {
            return Err(SequencerError::HardwareInit(last_error()));
        }
        if cfg.board_id >= count as u32 {
            return Err(SequencerError::HardwareInit(format!(
                "board {} not present ({} detected)",
                cfg.board_id, count
            )));
        }
        if unsafe { pb_select_board(cfg.board_id as CInt32) } < 0 {
            return Err(SequencerError::HardwareInit(last_error()));
        }
        if unsafe { pb_init() } < 0 {
            return Err(SequencerError::HardwareInit(last_error()));
        }
        unsafe { pb_core_clock(cfg.core_clock_mhz as CFloat64) };
        info!(
            "SpinAPI {}: board {} of {} ready, core clock {} MHz",
            driver_version(),
            cfg.board_id,
            count,
            cfg.core_clock_mhz
        );
        Ok(Self {
            board_id: cfg.board_id,
        })
    }

    pub fn board_id(&self) -> u32 {
        self.board_id
    }
}

impl BoardInterface for SpinBoard {
    fn select(&mut self, board_id: u32) {
        spin_call(|| unsafe { pb_select_board(board_id as CInt32) });
        self.board_id = board_id;
    }

    fn set_clock(&mut self, freq_mhz: f64) {
        unsafe { pb_core_clock(freq_mhz as CFloat64) };
    }

    fn begin_programming(&mut self) {
        spin_call(|| unsafe { pb_start_programming(PB_PULSE_PROGRAM) });
    }

    fn emit(&mut self, channel_mask: u32, opcode: Opcode, operand: u32, duration_ns: f64) {
        let index = spin_call(|| unsafe {
            pb_inst_pbonly(
                channel_mask as CUint32,
                opcode_code(opcode),
                operand as CInt32,
                duration_ns as CFloat64,
            )
        });
        debug!("pb_inst_pbonly -> instruction {}", index);
    }

    fn end_programming(&mut self) {
        spin_call(|| unsafe { pb_stop_programming() });
    }

    fn start(&mut self) {
        spin_call(|| unsafe { pb_start() });
    }

    fn stop(&mut self) {
        spin_call(|| unsafe { pb_stop() });
    }

    fn reset(&mut self) {
        spin_call(|| unsafe { pb_reset() });
    }

    fn query_version(&self) -> String {
        driver_version()
    }

    fn query_board_count(&self) -> u32 {
        let count = unsafe { pb_count_boards() };
        count.max(0) as u32
    }
}

// Release the driver handle with the board. Errors here are logged and
// swallowed: panicking in drop would abort.
impl Drop for SpinBoard {
    fn drop(&mut self) {
        let code = unsafe { pb_close() };
        if code < 0 {
            debug!("pb_close failed for board {}: {}", self.board_id, last_error());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // Codes from the SpinAPI instruction set; the board rejects a program
    // whose opcodes disagree with these.
    #[test]
    fn opcode_codes_match_the_driver_enumeration() {
        let expected = [
            (Opcode::Continue, 0),
            (Opcode::Stop, 1),
            (Opcode::Loop, 2),
            (Opcode::EndLoop, 3),
            (Opcode::Jsr, 4),
            (Opcode::Rts, 5),
            (Opcode::Branch, 6),
            (Opcode::LongDelay, 7),
            (Opcode::Wait, 8),
        ];
        for (op, code) in expected {
            assert_eq!(opcode_code(op), code);
        }
    }
}
