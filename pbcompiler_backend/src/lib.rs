//! Hardware-free backend for a SpinCore PulseBlasterUSB digital pulse
//! sequencer: an editable [instruction table](table), a [compiler](compiler)
//! that turns it into the exact board programming call sequence, and an
//! edge-triggered randomized [scan controller](controller). Everything here
//! runs against software substitutes ([`SoftwareBoard`](board::SoftwareBoard),
//! [`ManualEdgeSource`](edge::ManualEdgeSource)); the real SpinAPI and
//! NI-DAQmx bindings live in the `pbexpctrl_backend` extension crate.

pub mod board;
pub mod compiler;
pub mod controller;
pub mod edge;
pub mod error;
pub mod instruction;
pub mod scan;
pub mod store;
pub mod table;

pub use board::*;
pub use compiler::*;
pub use controller::*;
pub use edge::*;
pub use error::*;
pub use instruction::*;
pub use scan::*;
pub use store::*;
pub use table::*;
