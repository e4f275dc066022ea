use std::time::Duration;

use pbcompiler_backend::board::SoftwareBoard;
use pbcompiler_backend::controller::ScanController;
use pbcompiler_backend::edge::{ManualEdgeSource, TriggerConfig};
use pbcompiler_backend::instruction::{Instruction, TimeUnit};
use pbcompiler_backend::scan::{ScanSettings, SlotSettings};
use pbcompiler_backend::store::SequenceStore;
use pbcompiler_backend::table::InstructionTable;
use pbexpctrl_backend::Experiment;

fn main() {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let mut table = InstructionTable::default();
    table.push(
        Instruction::continue_for(5.0, TimeUnit::Ms)
            .with_note("MOT load")
            .with_channels(&[0, 1]),
    );
    table.push(
        Instruction::continue_for(800.0, TimeUnit::Us)
            .with_note("imaging pulse")
            .with_channels(&[5]),
    );
    table.push(Instruction::branch_to(0, 1.0, TimeUnit::Us));

    let mut exp = Experiment::new(
        ScanController::new(
            TriggerConfig::default(),
            table,
            SoftwareBoard::new(),
            ManualEdgeSource::new(),
        ),
        SequenceStore::default(),
    );

    *exp.scan_settings_mut() = ScanSettings {
        sample_count: 4,
        repetition: 2,
        slots: vec![SlotSettings {
            instruction: 1,
            start: 100.0,
            start_unit: TimeUnit::Us,
            end: 1.0,
            end_unit: TimeUnit::Ms,
        }],
    };

    exp.start_scan().unwrap();
    while exp.status().running {
        // Stand in for the hardware sync line.
        exp.inject_edge();
        std::thread::sleep(Duration::from_millis(1));
    }

    let status = exp.status();
    println!(
        "scan finished: {} rows applied (last row {})",
        status.row_count, status.last_row
    );
    println!("{}", exp.table_snapshot().unwrap());
    exp.shutdown();
}
