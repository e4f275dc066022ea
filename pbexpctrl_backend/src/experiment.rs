//! # Sequencer Control with the `experiment` Module
//!
//! This module ties the pieces of a running experiment together: the
//! [`pbcompiler_backend::controller::ScanController`] living on its control
//! thread (via [`ScanRunner`]), the scan settings being edited, and the
//! sequence file store. The [`Experiment`] struct is the single object an
//! operator-facing surface (GUI, script, REPL) needs to hold.
//!
//! ## Key Features:
//!
//! - **Scan control:** [`Experiment::start_scan`] normalizes the current
//!   settings into a plan and hands it to the control thread; validation
//!   errors come back synchronously. [`Experiment::stop_scan`] and
//!   [`Experiment::status`] complete the lifecycle.
//!
//! - **Board programming:** [`Experiment::program_board`] compiles the
//!   current table and programs it outside of any scan.
//!
//! - **Persistence:** [`Experiment::save`] and [`Experiment::load`] move the
//!   table and scan settings through the sequence document format, including
//!   the always-refreshed shared export copy.
//!
//! ## Relationship with `pbcompiler_backend`:
//!
//! Everything semantic (compilation, scan matrices, edge handling) lives in
//! `pbcompiler_backend` and is exercised identically under software
//! substitutes and real hardware. This module adds thread ownership and file
//! plumbing; with the `hardware` feature it also knows how to open the real
//! SpinCore board and NI-DAQmx edge source
//! ([`Experiment::open_hardware`](Experiment::open_hardware)).

use std::path::Path;

use pbcompiler_backend::board::BoardInterface;
use pbcompiler_backend::controller::ScanController;
use pbcompiler_backend::edge::{EdgeNotifier, EdgeSource};
use pbcompiler_backend::error::Result;
use pbcompiler_backend::scan::ScanSettings;
use pbcompiler_backend::store::SequenceStore;
use pbcompiler_backend::table::InstructionTable;

use crate::runner::{ScanRunner, ScanStatus};

#[cfg(feature = "hardware")]
use pbcompiler_backend::board::BoardConfig;
#[cfg(feature = "hardware")]
use pbcompiler_backend::edge::TriggerConfig;

/// Owner of one experiment: the control thread, the editable scan settings,
/// and the sequence store.
pub struct Experiment {
    runner: ScanRunner,
    notifier: EdgeNotifier,
    store: SequenceStore,
    scan: ScanSettings,
}

impl Experiment {
    /// Moves `ctrl` onto its control thread and wraps it. The controller's
    /// table comes along as the experiment's editable sequence.
    pub fn new<B, E>(ctrl: ScanController<B, E>, store: SequenceStore) -> Self
    where
        B: BoardInterface + Send + 'static,
        E: EdgeSource + Send + 'static,
        E::Handle: Send,
    {
        let notifier = ctrl.notifier();
        Self {
            runner: ScanRunner::spawn(ctrl),
            notifier,
            store,
            scan: ScanSettings::default(),
        }
    }

    /// Opens the real hardware pair: a SpinCore board over SpinAPI and an
    /// NI-DAQmx change-detection edge source.
    #[cfg(feature = "hardware")]
    pub fn open_hardware(
        board: &BoardConfig,
        trigger: TriggerConfig,
        table: InstructionTable,
        store: SequenceStore,
    ) -> Result<Self> {
        let board = crate::spinapi::SpinBoard::open(board)?;
        let edges = crate::nidaqmx::DaqmxEdgeSource::new();
        Ok(Self::new(
            ScanController::new(trigger, table, board, edges),
            store,
        ))
    }

    pub fn scan_settings(&self) -> &ScanSettings {
        &self.scan
    }

    pub fn scan_settings_mut(&mut self) -> &mut ScanSettings {
        &mut self.scan
    }

    /// Starts a scan from the current settings. Fails without touching the
    /// board if the settings do not normalize to a valid plan for the
    /// current table.
    pub fn start_scan(&self) -> Result<()> {
        self.runner.start(self.scan.to_plan()?)
    }

    pub fn stop_scan(&self) -> Result<()> {
        self.runner.stop()
    }

    /// Compiles and programs the current table outside of a scan; returns
    /// the instruction count.
    pub fn program_board(&self) -> Result<usize> {
        self.runner.load_program()
    }

    pub fn status(&self) -> ScanStatus {
        self.runner.status()
    }

    pub fn table_snapshot(&self) -> Result<InstructionTable> {
        self.runner.table_snapshot()
    }

    /// Swaps in a new table. The control thread refuses the swap (with a log
    /// line) while a scan is running.
    pub fn replace_table(&self, table: InstructionTable) -> Result<()> {
        self.runner.replace_table(table)
    }

    /// Saves the current table and scan settings to `path` (plus the shared
    /// export copy). Refuses to replace an existing file unless `overwrite`.
    pub fn save(&self, path: &Path, overwrite: bool) -> Result<()> {
        let table = self.runner.table_snapshot()?;
        self.store.save(path, &table, &self.scan, overwrite)
    }

    /// Loads a sequence file, replacing the table and scan settings.
    ///
    /// # Panics
    ///
    /// Panics if a scan is running; stop it first. Callers driving a UI
    /// should have the load action disabled during a scan.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        assert!(
            !self.status().running,
            "Cannot load a sequence while a scan is running"
        );
        let (table, scan) = self.store.load(path)?;
        self.runner.replace_table(table)?;
        self.scan = scan;
        Ok(())
    }

    /// Feeds one edge event into the controller's queue, exactly as a driver
    /// callback would. This is how simulated rigs drive scans.
    pub fn inject_edge(&self) {
        self.notifier.notify();
    }

    /// Stops the control thread. Also happens on drop.
    pub fn shutdown(&mut self) {
        self.runner.shutdown();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pbcompiler_backend::board::SoftwareBoard;
    use pbcompiler_backend::edge::{ManualEdgeSource, TriggerConfig};
    use pbcompiler_backend::instruction::{Instruction, TimeUnit};
    use pbcompiler_backend::scan::SlotSettings;
    use std::time::Duration;

    fn sim_experiment() -> Experiment {
        let mut table = InstructionTable::default();
        table.push(
            Instruction::continue_for(2.0, TimeUnit::Ms)
                .with_note("probe")
                .with_channels(&[4]),
        );
        table.push(Instruction::stop(10.0, TimeUnit::Ns));
        let shared = std::env::temp_dir().join(format!(
            "pbexp_shared_{}_{:?}.json",
            std::process::id(),
            std::thread::current().id()
        ));
        Experiment::new(
            ScanController::new(
                TriggerConfig::default(),
                table,
                SoftwareBoard::new(),
                ManualEdgeSource::new(),
            ),
            SequenceStore::new(shared),
        )
    }

    fn wait_idle(exp: &Experiment) -> ScanStatus {
        for _ in 0..400 {
            let status = exp.status();
            if !status.running {
                return status;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("scan never finished: {:?}", exp.status());
    }

    #[test]
    fn settings_drive_a_full_scan() {
        let mut exp = sim_experiment();
        *exp.scan_settings_mut() = ScanSettings {
            sample_count: 3,
            repetition: 1,
            slots: vec![SlotSettings {
                instruction: 0,
                start: 1.0,
                start_unit: TimeUnit::Ms,
                end: 3.0,
                end_unit: TimeUnit::Ms,
            }],
        };

        exp.start_scan().unwrap();
        for _ in 0..3 {
            exp.inject_edge();
        }
        let done = wait_idle(&exp);
        assert_eq!(done.row_count, 3);
        assert_eq!(done.last_row, 2);
        exp.shutdown();
    }

    #[test]
    fn empty_slot_list_is_rejected_before_the_board() {
        let exp = sim_experiment();
        // Default settings carry no slots.
        assert!(exp.start_scan().is_err());
        assert!(!exp.status().running);
    }

    #[test]
    fn save_load_round_trip_through_the_facade() {
        let mut exp = sim_experiment();
        exp.scan_settings_mut().sample_count = 5;
        exp.scan_settings_mut().slots.push(SlotSettings {
            instruction: 1,
            start: 10.0,
            start_unit: TimeUnit::Ns,
            end: 90.0,
            end_unit: TimeUnit::Ns,
        });

        let path = std::env::temp_dir().join(format!(
            "pbexp_seq_{}_{:?}.json",
            std::process::id(),
            std::thread::current().id()
        ));
        exp.save(&path, true).unwrap();

        // Wipe local state, then restore from the file.
        *exp.scan_settings_mut() = ScanSettings::default();
        exp.replace_table(InstructionTable::default()).unwrap();
        exp.load(&path).unwrap();

        assert_eq!(exp.scan_settings().sample_count, 5);
        assert_eq!(exp.scan_settings().slots.len(), 1);
        let table = exp.table_snapshot().unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(0).map(|i| i.note.as_str()), Some("probe"));

        let _ = std::fs::remove_file(&path);
        exp.shutdown();
    }

    #[test]
    fn program_board_counts_instructions() {
        let mut exp = sim_experiment();
        assert_eq!(exp.program_board().unwrap(), 2);
        exp.shutdown();
    }
}
