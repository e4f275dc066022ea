//! The scan runner: a dedicated control thread that owns a
//! [`ScanController`] and serializes everything that touches it.
//!
//! Driver edge callbacks arrive on driver threads and only ever enqueue
//! events; commands from the operator-facing side arrive on a command
//! channel. The runner thread `select!`s over both, so board programming,
//! scan advancement, and stop requests are handled one at a time with no
//! locking inside the controller itself. A [`ScanStatus`] snapshot behind a
//! mutex is the one piece of shared state, refreshed after every handled
//! message.
//!
//! ```
//! use pbcompiler_backend::board::SoftwareBoard;
//! use pbcompiler_backend::controller::ScanController;
//! use pbcompiler_backend::edge::{ManualEdgeSource, TriggerConfig};
//! use pbcompiler_backend::instruction::{Instruction, TimeUnit};
//! use pbcompiler_backend::scan::{ScanPlan, ScanSlot};
//! use pbcompiler_backend::table::InstructionTable;
//! use pbexpctrl_backend::runner::ScanRunner;
//!
//! let mut table = InstructionTable::default();
//! table.push(Instruction::continue_for(1.0, TimeUnit::Ms));
//!
//! let ctrl = ScanController::new(
//!     TriggerConfig::default(),
//!     table,
//!     SoftwareBoard::new(),
//!     ManualEdgeSource::new(),
//! );
//! let notifier = ctrl.notifier();
//! let mut runner = ScanRunner::spawn(ctrl);
//!
//! let plan = ScanPlan::new(vec![ScanSlot::new(0, 1_000.0, 2_000.0)], 2, 1).unwrap();
//! runner.start(plan).unwrap();
//! notifier.notify(); // rows: 0 -> 1
//! notifier.notify(); // terminating edge
//! for _ in 0..400 {
//!     if !runner.status().running {
//!         break;
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(2));
//! }
//! assert!(!runner.status().running);
//! runner.shutdown();
//! ```

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use crossbeam::select;
use log::{error, warn};
use parking_lot::Mutex;

use pbcompiler_backend::board::BoardInterface;
use pbcompiler_backend::controller::ScanController;
use pbcompiler_backend::edge::EdgeSource;
use pbcompiler_backend::error::{Result, SequencerError};
use pbcompiler_backend::scan::ScanPlan;
use pbcompiler_backend::table::InstructionTable;

use crate::utils::TickTimer;

/// Everything the runner thread can be asked to do.
pub enum ScanCmd {
    Start(ScanPlan, Sender<Result<()>>),
    Stop,
    /// Compile and program the current table outside of a scan; the reply
    /// carries the instruction count.
    Load(Sender<Result<usize>>),
    /// Swap in a new table. Refused (with a log line) while a scan runs.
    ReplaceTable(InstructionTable),
    Snapshot(Sender<InstructionTable>),
    Shutdown,
}

/// Last published view of the controller, safe to read from any thread.
///
/// `last_row`/`row_count` describe the most recent scan and stay readable
/// after it finishes, so a poller that misses the final tick still sees how
/// far the scan got.
#[derive(Debug, Clone, Default)]
pub struct ScanStatus {
    pub running: bool,
    pub last_row: usize,
    pub row_count: usize,
}

/// Handle to the control thread. Dropping it shuts the thread down.
pub struct ScanRunner {
    cmd_tx: Sender<ScanCmd>,
    status: Arc<Mutex<ScanStatus>>,
    handle: Option<JoinHandle<()>>,
}

impl ScanRunner {
    /// Moves `ctrl` onto a fresh control thread and returns the handle used
    /// to talk to it. Clone the controller's notifier *before* spawning if
    /// the caller wants to inject edges itself.
    pub fn spawn<B, E>(mut ctrl: ScanController<B, E>) -> Self
    where
        B: BoardInterface + Send + 'static,
        E: EdgeSource + Send + 'static,
        E::Handle: Send,
    {
        let (cmd_tx, cmd_rx) = unbounded();
        let status = Arc::new(Mutex::new(ScanStatus::default()));
        let thread_status = Arc::clone(&status);
        let handle = thread::spawn(move || run_loop(&mut ctrl, cmd_rx, &thread_status));
        Self {
            cmd_tx,
            status,
            handle: Some(handle),
        }
    }

    pub fn status(&self) -> ScanStatus {
        self.status.lock().clone()
    }

    /// Starts a scan and waits for the controller's verdict, so plan
    /// validation errors surface here synchronously.
    pub fn start(&self, plan: ScanPlan) -> Result<()> {
        let (reply_tx, reply_rx) = unbounded();
        self.send(ScanCmd::Start(plan, reply_tx))?;
        reply_rx.recv().map_err(|_| disconnected())?
    }

    pub fn stop(&self) -> Result<()> {
        self.send(ScanCmd::Stop)
    }

    /// Programs the current table onto the board, outside of any scan.
    pub fn load_program(&self) -> Result<usize> {
        let (reply_tx, reply_rx) = unbounded();
        self.send(ScanCmd::Load(reply_tx))?;
        reply_rx.recv().map_err(|_| disconnected())?
    }

    pub fn replace_table(&self, table: InstructionTable) -> Result<()> {
        self.send(ScanCmd::ReplaceTable(table))
    }

    pub fn table_snapshot(&self) -> Result<InstructionTable> {
        let (reply_tx, reply_rx) = unbounded();
        self.send(ScanCmd::Snapshot(reply_tx))?;
        reply_rx.recv().map_err(|_| disconnected())
    }

    /// Asks the thread to stop any scan and exit, then joins it. Safe to
    /// call more than once.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.cmd_tx.send(ScanCmd::Shutdown);
            if handle.join().is_err() {
                error!("scan runner thread panicked");
            }
        }
    }

    fn send(&self, cmd: ScanCmd) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| disconnected())
    }
}

impl Drop for ScanRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn disconnected() -> SequencerError {
    SequencerError::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "scan runner thread is gone",
    ))
}

fn run_loop<B: BoardInterface, E: EdgeSource>(
    ctrl: &mut ScanController<B, E>,
    cmd_rx: Receiver<ScanCmd>,
    status: &Mutex<ScanStatus>,
) {
    let edge_rx = ctrl.events();
    let mut timer = TickTimer::new();
    loop {
        select! {
            recv(cmd_rx) -> cmd => match cmd {
                Ok(ScanCmd::Start(plan, reply)) => {
                    let _ = reply.send(ctrl.start(plan));
                }
                Ok(ScanCmd::Stop) => ctrl.stop(),
                Ok(ScanCmd::Load(reply)) => {
                    let _ = reply.send(ctrl.load_program().map(|program| program.len()));
                }
                Ok(ScanCmd::ReplaceTable(table)) => {
                    if ctrl.is_running() {
                        warn!("table replacement refused while a scan is running");
                    } else {
                        *ctrl.table_() = table;
                    }
                }
                Ok(ScanCmd::Snapshot(reply)) => {
                    let _ = reply.send(ctrl.table().clone());
                }
                Ok(ScanCmd::Shutdown) | Err(_) => break,
            },
            recv(edge_rx) -> event => {
                if event.is_ok() {
                    timer.tick();
                    ctrl.on_edge();
                    timer.tick_log("edge handled in");
                }
            }
        }
        publish(status, ctrl);
    }
    ctrl.stop();
    publish(status, ctrl);
}

fn publish<B: BoardInterface, E: EdgeSource>(
    status: &Mutex<ScanStatus>,
    ctrl: &ScanController<B, E>,
) {
    let mut snapshot = status.lock();
    match ctrl.progress() {
        Some((row, rows)) => {
            snapshot.running = true;
            snapshot.last_row = row;
            snapshot.row_count = rows;
        }
        None => snapshot.running = false,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pbcompiler_backend::board::SoftwareBoard;
    use pbcompiler_backend::edge::{EdgeNotifier, ManualEdgeSource, TriggerConfig};
    use pbcompiler_backend::instruction::{Instruction, TimeUnit};
    use pbcompiler_backend::scan::ScanSlot;
    use std::time::Duration;

    fn spawn_sim(n_instr: usize) -> (ScanRunner, EdgeNotifier) {
        let mut table = InstructionTable::default();
        for i in 0..n_instr {
            table.push(Instruction::continue_for((i + 1) as f64, TimeUnit::Ms));
        }
        let ctrl = ScanController::new(
            TriggerConfig::default(),
            table,
            SoftwareBoard::new(),
            ManualEdgeSource::new(),
        );
        let notifier = ctrl.notifier();
        (ScanRunner::spawn(ctrl), notifier)
    }

    fn wait_until(runner: &ScanRunner, pred: impl Fn(&ScanStatus) -> bool) -> ScanStatus {
        for _ in 0..400 {
            let status = runner.status();
            if pred(&status) {
                return status;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("runner never reached expected state: {:?}", runner.status());
    }

    #[test]
    fn scan_runs_to_completion_on_injected_edges() {
        let (mut runner, notifier) = spawn_sim(2);
        let plan = ScanPlan::new(vec![ScanSlot::new(0, 1_000.0, 3_000.0)], 3, 2).unwrap();
        runner.start(plan).unwrap();
        wait_until(&runner, |s| s.running && s.row_count == 6);

        for _ in 0..5 {
            notifier.notify();
        }
        wait_until(&runner, |s| s.last_row == 5);

        notifier.notify(); // terminating edge
        let done = wait_until(&runner, |s| !s.running);
        assert_eq!(done.last_row, 5);
        assert_eq!(done.row_count, 6);
        runner.shutdown();
    }

    #[test]
    fn plan_rejection_is_synchronous() {
        let (mut runner, _notifier) = spawn_sim(2);
        let plan = ScanPlan::new(vec![ScanSlot::new(7, 1_000.0, 2_000.0)], 2, 1).unwrap();
        let err = runner.start(plan).unwrap_err();
        assert!(matches!(err, SequencerError::InstructionRange { .. }));
        assert!(!runner.status().running);
        runner.shutdown();
    }

    #[test]
    fn table_swap_waits_for_idle() {
        let (mut runner, notifier) = spawn_sim(3);
        let plan = ScanPlan::new(vec![ScanSlot::new(0, 1_000.0, 1_000.0)], 2, 1).unwrap();
        runner.start(plan).unwrap();
        wait_until(&runner, |s| s.running);

        let replacement = InstructionTable::default();
        runner.replace_table(replacement.clone()).unwrap();
        // Still the 3-instruction table: the swap was refused mid-scan.
        assert_eq!(runner.table_snapshot().unwrap().len(), 3);

        notifier.notify();
        notifier.notify();
        wait_until(&runner, |s| !s.running);

        runner.replace_table(replacement).unwrap();
        assert_eq!(runner.table_snapshot().unwrap().len(), 0);
        runner.shutdown();
    }

    #[test]
    fn load_outside_scan_reports_instruction_count() {
        let (mut runner, _notifier) = spawn_sim(4);
        assert_eq!(runner.load_program().unwrap(), 4);
        runner.shutdown();
    }

    #[test]
    fn commands_after_shutdown_fail_cleanly() {
        let (mut runner, _notifier) = spawn_sim(1);
        runner.shutdown();
        let plan = ScanPlan::new(vec![ScanSlot::new(0, 1_000.0, 2_000.0)], 2, 1).unwrap();
        assert!(runner.start(plan).is_err());
        assert!(runner.table_snapshot().is_err());
        // A second shutdown (and the eventual drop) are no-ops.
        runner.shutdown();
    }
}
