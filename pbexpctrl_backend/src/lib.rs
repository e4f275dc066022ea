//! Hardware extension for `pbcompiler_backend`: the control thread that
//! owns a running scan ([`runner`]), the operator-facing [`Experiment`]
//! facade, and (behind the `hardware` feature) the SpinAPI board and
//! NI-DAQmx edge source bindings.

pub mod experiment;
pub mod runner;
pub mod utils;

#[cfg(feature = "hardware")]
pub mod nidaqmx;
#[cfg(feature = "hardware")]
pub mod spinapi;

pub use crate::experiment::Experiment;
pub use crate::runner::{ScanCmd, ScanRunner, ScanStatus};
pub use crate::utils::TickTimer;

#[cfg(feature = "hardware")]
pub use crate::nidaqmx::DaqmxEdgeSource;
#[cfg(feature = "hardware")]
pub use crate::spinapi::SpinBoard;
