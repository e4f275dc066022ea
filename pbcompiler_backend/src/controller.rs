//! The scan controller: lifecycle orchestration for an edge-synchronized
//! randomized sweep.
//!
//! ## Lifecycle
//!
//! The controller has exactly two states, `Idle` and `Running`.
//!
//! - [`start`](ScanController::start) validates the plan against the table
//!   (any failure returns before a single hardware call), builds the
//!   randomized matrix, stops and resets the board, applies matrix row 0 to
//!   the table, loads the program, starts the board, and subscribes to the
//!   edge source. From then on the scan is driven entirely by edges.
//! - [`on_edge`](ScanController::on_edge) advances to the next row: rewrite
//!   the swept durations, reload the program, report progress. The edge that
//!   arrives after the last row has been applied terminates the scan.
//! - [`stop`](ScanController::stop) unsubscribes (best-effort), halts and
//!   resets the board, and discards the scan state. It is idempotent and
//!   callable at any time.
//!
//! ## Concurrency
//!
//! Drivers deliver edge callbacks from their own threads, so the callback
//! given out at subscription is an [`EdgeNotifier`]: it enqueues an
//! [`EdgeEvent`] and returns, never blocking and never touching controller
//! state. Whoever owns the controller (a dedicated control thread in the
//! hardware crate, or the current thread via [`pump`](ScanController::pump))
//! drains the queue and calls `on_edge` at its own pace. An event drained
//! after `stop()` hits the idle guard and dies as a no-op; nothing tears.
//!
//! ## Example
//!
//! ```
//! use pbcompiler_backend::board::SoftwareBoard;
//! use pbcompiler_backend::controller::ScanController;
//! use pbcompiler_backend::edge::{ManualEdgeSource, TriggerConfig};
//! use pbcompiler_backend::instruction::{Instruction, TimeUnit};
//! use pbcompiler_backend::scan::{ScanPlan, ScanSlot};
//! use pbcompiler_backend::table::InstructionTable;
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//!
//! let mut table = InstructionTable::new(24);
//! table.push(Instruction::continue_for(1.0, TimeUnit::Ms).with_channels(&[0]));
//! table.push(Instruction::stop(10.0, TimeUnit::Ns));
//!
//! let mut ctrl = ScanController::new(
//!     TriggerConfig::default(),
//!     table,
//!     SoftwareBoard::new(),
//!     ManualEdgeSource::new(),
//! );
//! let plan = ScanPlan::new(vec![ScanSlot::new(0, 1_000.0, 3_000.0)], 3, 1).unwrap();
//! ctrl.start_with_rng(plan, &mut StdRng::seed_from_u64(0)).unwrap();
//! assert!(ctrl.is_running());
//!
//! // Three rows: two advancing edges, then the terminating edge.
//! ctrl.on_edge();
//! ctrl.on_edge();
//! assert_eq!(ctrl.progress(), Some((2, 3)));
//! ctrl.on_edge();
//! assert!(!ctrl.is_running());
//! ```

use crossbeam::channel::Receiver;
use log::{debug, error, info, warn};
use ndarray::Array2;
use rand::Rng;

use crate::board::BoardInterface;
use crate::compiler;
use crate::edge::{edge_channel, EdgeEvent, EdgeNotifier, EdgeSource, TriggerConfig};
use crate::error::Result;
use crate::instruction::CompiledInstruction;
use crate::scan::ScanPlan;
use crate::table::InstructionTable;

/// State of one scan in flight. Exists only between `start` and `stop`.
struct ActiveScan<H> {
    plan: ScanPlan,
    matrix: Array2<f64>,
    /// Index of the most recently applied row.
    counter: usize,
    subscription: Option<H>,
}

/// Orchestrates the scan lifecycle over a board and an edge source.
///
/// The controller owns the instruction table. Between scans the table is
/// freely editable through [`table_`](ScanController::table_); during a scan
/// the controller rewrites the swept durations itself and outside edits are
/// the editor's own hazard, exactly as with a human retyping fields mid-run.
pub struct ScanController<B: BoardInterface, E: EdgeSource> {
    trigger: TriggerConfig,
    table: InstructionTable,
    board: B,
    edges: E,
    edge_tx: EdgeNotifier,
    edge_rx: Receiver<EdgeEvent>,
    scan: Option<ActiveScan<E::Handle>>,
}

impl<B: BoardInterface, E: EdgeSource> ScanController<B, E> {
    pub fn new(trigger: TriggerConfig, table: InstructionTable, board: B, edges: E) -> Self {
        let (edge_tx, edge_rx) = edge_channel();
        Self {
            trigger,
            table,
            board,
            edges,
            edge_tx,
            edge_rx,
            scan: None,
        }
    }

    /// The notifier that feeds this controller's edge queue. This is what
    /// gets handed to the driver at subscription; clones are cheap and all
    /// feed the same queue.
    pub fn notifier(&self) -> EdgeNotifier {
        self.edge_tx.clone()
    }

    /// Receiving end of the edge queue, for an external control loop that
    /// wants to `select!` over it. Each event should be answered with one
    /// [`on_edge`](ScanController::on_edge) call.
    pub fn events(&self) -> Receiver<EdgeEvent> {
        self.edge_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.scan.is_some()
    }

    /// `(last applied row, total rows)` of the scan in flight.
    pub fn progress(&self) -> Option<(usize, usize)> {
        self.scan
            .as_ref()
            .map(|scan| (scan.counter, scan.matrix.nrows()))
    }

    pub fn table(&self) -> &InstructionTable {
        &self.table
    }

    /// Mutable access to the table, for edits between scans.
    pub fn table_(&mut self) -> &mut InstructionTable {
        &mut self.table
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn board_(&mut self) -> &mut B {
        &mut self.board
    }

    pub fn edges_(&mut self) -> &mut E {
        &mut self.edges
    }

    /// Compiles the current table and programs it onto the board, outside of
    /// any scan. This is the "program board" button.
    pub fn load_program(&mut self) -> Result<Vec<CompiledInstruction>> {
        compiler::load_program(&mut self.board, &self.table)
    }

    /// Starts a scan with a permutation drawn from the thread-local
    /// generator. See [`start_with_rng`](ScanController::start_with_rng).
    pub fn start(&mut self, plan: ScanPlan) -> Result<()> {
        self.start_with_rng(plan, &mut rand::thread_rng())
    }

    /// Starts a scan, drawing the row permutation from `rng`.
    ///
    /// Validation comes first and a failure returns with nothing touched: no
    /// board call, no table write, and any scan already in flight keeps
    /// running. On success a running scan is stopped before the new one is
    /// primed.
    ///
    /// Priming order: board `stop`, `reset`; apply matrix row 0 to the table
    /// and load the program; board `start`; subscribe and arm the edge
    /// source. Subscription trouble is logged and leaves the scan running but
    /// stalled; the edge source is non-fatal, and `stop()` always recovers.
    pub fn start_with_rng<R: Rng + ?Sized>(&mut self, plan: ScanPlan, rng: &mut R) -> Result<()> {
        plan.validate(self.table.len())?;
        let matrix = plan.build_matrix(rng);

        self.stop();
        self.board.stop();
        self.board.reset();

        let mut scan = ActiveScan {
            plan,
            matrix,
            counter: 0,
            subscription: None,
        };
        Self::apply_and_load(&mut self.table, &mut self.board, &scan, 0)?;
        self.board.start();

        match self
            .edges
            .subscribe(&self.trigger.line, self.trigger.polarity, self.notifier())
        {
            Ok(handle) => {
                scan.subscription = Some(handle);
                if let Err(err) = self.edges.start() {
                    warn!("edge source failed to arm: {err}; scan will stall until stopped");
                }
            }
            Err(err) => {
                warn!("edge subscription failed: {err}; scan will stall until stopped");
            }
        }

        info!(
            "scan started: {} rows ({} samples x {} repetitions, {} slots), trigger {} {:?}",
            scan.matrix.nrows(),
            scan.plan.sample_count(),
            scan.plan.repetition(),
            scan.plan.slot_count(),
            self.trigger.line,
            self.trigger.polarity,
        );
        self.scan = Some(scan);
        Ok(())
    }

    /// Handles one qualifying edge.
    ///
    /// Idle controllers ignore edges; this is the guard that makes a
    /// callback racing a concurrent `stop()` harmless. While rows remain, an
    /// edge advances the counter, rewrites the swept durations from the next
    /// matrix row, and reloads the program. The edge after the final row
    /// terminates the scan.
    pub fn on_edge(&mut self) {
        let (next, rows) = match self.scan.as_ref() {
            Some(scan) => (scan.counter + 1, scan.matrix.nrows()),
            None => {
                debug!("edge ignored: no scan running");
                return;
            }
        };

        if next >= rows {
            info!("scan complete: all {rows} rows applied");
            self.stop();
            return;
        }

        let scan = match self.scan.as_mut() {
            Some(scan) => scan,
            None => return,
        };
        scan.counter = next;
        match Self::apply_and_load(&mut self.table, &mut self.board, scan, next) {
            Ok(_) => info!("scan progress: {next}/{rows}"),
            Err(err) => {
                error!("scan aborted: failed to load row {next}: {err}");
                self.stop();
            }
        }
    }

    /// Drains queued edge events, answering each with one `on_edge`. Returns
    /// the number of events handled. This is the single-threaded alternative
    /// to an external control loop.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        while self.edge_rx.try_recv().is_ok() {
            self.on_edge();
            handled += 1;
        }
        handled
    }

    /// Ends the scan: unsubscribes from the edge source (failures logged,
    /// never propagated), halts and resets the board, and discards the
    /// matrix and counter. A stop with no scan in flight does nothing.
    pub fn stop(&mut self) {
        let Some(mut scan) = self.scan.take() else {
            debug!("stop requested while idle");
            return;
        };
        if let Some(handle) = scan.subscription.take() {
            if let Err(err) = self.edges.unsubscribe(handle) {
                warn!("edge unsubscribe failed (ignored): {err}");
            }
        }
        self.board.stop();
        self.board.reset();
        info!(
            "scan stopped at row {} of {}",
            scan.counter,
            scan.matrix.nrows()
        );
    }

    /// Writes row `row` of the matrix into the swept instructions (each value
    /// re-expressed in that instruction's current display unit) and reloads
    /// the program.
    fn apply_and_load(
        table: &mut InstructionTable,
        board: &mut B,
        scan: &ActiveScan<E::Handle>,
        row: usize,
    ) -> Result<Vec<CompiledInstruction>> {
        for (j, slot) in scan.plan.slots().iter().enumerate() {
            table.write_duration_ns(slot.instruction_index, scan.matrix[[row, j]]);
        }
        compiler::load_program(board, table)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::board::SoftwareBoard;
    use crate::edge::ManualEdgeSource;
    use crate::instruction::{Instruction, TimeUnit};
    use crate::scan::ScanSlot;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type TestController = ScanController<SoftwareBoard, ManualEdgeSource>;

    fn controller(rows: usize) -> TestController {
        let mut table = InstructionTable::new(24);
        for i in 0..rows {
            table.push(
                Instruction::continue_for((i + 1) as f64, TimeUnit::Ms).with_channels(&[i % 24]),
            );
        }
        ScanController::new(
            TriggerConfig::default(),
            table,
            SoftwareBoard::new(),
            ManualEdgeSource::new(),
        )
    }

    fn fixed_plan(instruction: usize, value_ns: f64, samples: usize, reps: usize) -> ScanPlan {
        // start == end: every matrix row carries the same value, so
        // assertions do not depend on the shuffle.
        ScanPlan::new(vec![ScanSlot::new(instruction, value_ns, value_ns)], samples, reps).unwrap()
    }

    #[test]
    fn invalid_plan_means_zero_hardware_calls() {
        let mut ctrl = controller(6);
        let plan = ScanPlan::new(vec![ScanSlot::new(6, 1_000.0, 2_000.0)], 2, 2).unwrap();

        let err = ctrl.start(plan).unwrap_err();
        assert!(matches!(
            err,
            crate::error::SequencerError::InstructionRange { .. }
        ));
        assert!(!ctrl.is_running());
        assert_eq!(ctrl.board().call_count(), 0);
        assert!(!ctrl.edges_().is_subscribed());
    }

    #[test]
    fn start_primes_board_and_subscribes() {
        let mut ctrl = controller(3);
        ctrl.start(fixed_plan(1, 5_000.0, 2, 2)).unwrap();

        assert!(ctrl.is_running());
        assert_eq!(ctrl.progress(), Some((0, 4)));

        let board = ctrl.board();
        assert_eq!(board.stop_count(), 1);
        assert_eq!(board.reset_count(), 1);
        assert_eq!(board.load_count(), 1);
        assert_eq!(board.start_count(), 1);
        assert!(board.is_running());
        // Row 0 is applied before the program is loaded.
        assert_eq!(board.program()[1].duration_ns, 5_000.0);

        assert!(ctrl.edges_().is_subscribed());
        assert!(ctrl.edges_().is_armed());
        assert_eq!(ctrl.edges_().line(), Some("Dev1/port0/line0"));
    }

    #[test]
    fn rows_follow_the_seeded_permutation() {
        let mut ctrl = controller(2);
        ctrl.table_().set_duration(0, 1.0, TimeUnit::Us);

        let plan = ScanPlan::new(vec![ScanSlot::new(0, 1_000.0, 4_000.0)], 4, 1).unwrap();
        let expected = plan.build_matrix(&mut StdRng::seed_from_u64(7));

        ctrl.start_with_rng(plan, &mut StdRng::seed_from_u64(7)).unwrap();
        for row in 0..4 {
            let instr = ctrl.table().get(0).unwrap();
            assert_eq!(instr.duration_ns(), expected[[row, 0]]);
            // Display unit survives the rewrite.
            assert_eq!(instr.unit, TimeUnit::Us);
            assert_eq!(instr.duration, expected[[row, 0]] / 1e3);
            ctrl.on_edge();
        }
        assert!(!ctrl.is_running());
    }

    #[test]
    fn terminating_edge_stops_exactly_once() {
        let mut ctrl = controller(3);
        ctrl.start(fixed_plan(0, 2_000.0, 3, 2)).unwrap();

        // Rows 1..=5 are applied by the first five edges.
        for expected in 1..6 {
            ctrl.on_edge();
            assert_eq!(ctrl.progress(), Some((expected, 6)));
        }
        assert_eq!(ctrl.board().load_count(), 6);

        // Terminating edge.
        ctrl.on_edge();
        assert!(!ctrl.is_running());
        assert_eq!(ctrl.progress(), None);
        assert_eq!(ctrl.board().stop_count(), 2); // priming stop + final stop
        assert_eq!(ctrl.board().reset_count(), 2);
        assert!(!ctrl.board().is_running());
        assert!(!ctrl.edges_().is_subscribed());

        // Late edges are no-ops.
        let loads = ctrl.board().load_count();
        let table_before = ctrl.table().clone();
        ctrl.on_edge();
        ctrl.on_edge();
        assert_eq!(ctrl.board().load_count(), loads);
        assert_eq!(ctrl.table(), &table_before);
        assert_eq!(ctrl.board().stop_count(), 2);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut ctrl = controller(2);
        ctrl.stop();
        assert_eq!(ctrl.board().call_count(), 0);

        ctrl.start(fixed_plan(0, 1_500.0, 2, 1)).unwrap();
        ctrl.stop();
        assert!(!ctrl.is_running());
        let calls = ctrl.board().call_count();
        ctrl.stop();
        ctrl.stop();
        assert_eq!(ctrl.board().call_count(), calls);
    }

    #[test]
    fn events_flow_through_the_queue() {
        let mut ctrl = controller(2);
        ctrl.start(fixed_plan(0, 1_000.0, 3, 1)).unwrap();

        // Fire through the subscribed notifier, then drain.
        assert!(ctrl.edges_().fire());
        assert!(ctrl.edges_().fire());
        assert_eq!(ctrl.pump(), 2);
        assert_eq!(ctrl.progress(), Some((2, 3)));

        assert!(ctrl.edges_().fire());
        assert_eq!(ctrl.pump(), 1);
        assert!(!ctrl.is_running());

        // An event that arrives after the stop is drained as a no-op.
        ctrl.notifier().notify();
        assert_eq!(ctrl.pump(), 1);
        assert!(!ctrl.is_running());
    }

    #[test]
    fn restart_replaces_running_scan() {
        let mut ctrl = controller(4);
        ctrl.start(fixed_plan(0, 1_000.0, 4, 1)).unwrap();
        ctrl.on_edge();
        assert_eq!(ctrl.progress(), Some((1, 4)));

        ctrl.start(fixed_plan(1, 2_000.0, 2, 1)).unwrap();
        assert_eq!(ctrl.progress(), Some((0, 2)));
        assert!(ctrl.edges_().is_subscribed());
        // Old scan was stopped on the way: stop+reset from the replacement
        // plus the priming stop+reset of both starts.
        assert_eq!(ctrl.board().stop_count(), 3);
        assert_eq!(ctrl.board().reset_count(), 3);
    }

    #[test]
    fn invalid_restart_leaves_scan_running() {
        let mut ctrl = controller(3);
        ctrl.start(fixed_plan(0, 1_000.0, 3, 1)).unwrap();
        ctrl.on_edge();

        let bad = ScanPlan::new(vec![ScanSlot::new(9, 1.0, 2.0)], 2, 1).unwrap();
        assert!(ctrl.start(bad).is_err());
        assert!(ctrl.is_running());
        assert_eq!(ctrl.progress(), Some((1, 3)));
    }

    #[test]
    fn load_failure_mid_scan_stops() {
        let mut ctrl = controller(3);
        ctrl.start(fixed_plan(0, 1_000.0, 3, 1)).unwrap();

        // Corrupt a non-swept row; the next reload must fail and stop the
        // scan instead of leaving the board half-programmed.
        ctrl.table_().set_duration(2, 0.0, TimeUnit::Ms);
        ctrl.on_edge();
        assert!(!ctrl.is_running());
        assert!(!ctrl.board().is_running());
        assert!(!ctrl.edges_().is_subscribed());
    }
}
