use pbcompiler_backend::board::SoftwareBoard;
use pbcompiler_backend::controller::ScanController;
use pbcompiler_backend::edge::{ManualEdgeSource, TriggerConfig};
use pbcompiler_backend::instruction::{Instruction, TimeUnit};
use pbcompiler_backend::scan::{ScanPlan, ScanSlot};
use pbcompiler_backend::table::InstructionTable;

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

    let mut ctrl = ScanController::new(
        TriggerConfig::default(),
        table,
        SoftwareBoard::new(),
        ManualEdgeSource::new(),
    );

    // Sweep the imaging pulse from 100 us to 1 ms over 5 samples, 2 shots
    // each, and walk all 10 rows by simulated edges.
    let plan = match ScanPlan::new(vec![ScanSlot::new(1, 100_000.0, 1_000_000.0)], 5, 2) {
        Ok(plan) => plan,
        Err(err) => {
            eprintln!("scan rejected: {err}");
            return;
        }
    };
    if let Err(err) = ctrl.start(plan) {
        eprintln!("scan rejected: {err}");
        return;
    }

    while ctrl.is_running() {
        ctrl.edges_().fire();
        ctrl.pump();
    }
    println!("{}", ctrl.table());
    println!(
        "board saw {} loads, {} starts",
        ctrl.board().load_count(),
        ctrl.board().start_count()
    );
}
