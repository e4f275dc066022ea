//! Provides a minimal rust wrapper for parts of the NI-DAQmx C library:
//! just enough to watch one digital line for transitions and turn each one
//! into an [`EdgeEvent`].
//!
//! ## Overview
//!
//! [`DaqmxEdgeSource`] implements
//! [`EdgeSource`] on top of a DAQmx
//! change-detection task. `subscribe` builds the task (digital input channel
//! on the trigger line, change-detection timing on the requested polarity,
//! signal-event callback registration) and `start` arms it. From then on the
//! driver invokes the registered callback from its own thread once per
//! qualifying transition; the callback does nothing but
//! [`EdgeNotifier::notify`], so no controller state is ever touched from a
//! driver thread.
//!
//! ## Safety and Error Handling
//!
//! DAQmx functions return a negative code on failure. Unlike board
//! programming trouble, edge-source trouble is recoverable:
//! the [`daqmx_try`] wrapper fetches the extended error text with
//! `DAQmxGetExtendedErrorInfo`, appends it to a `nidaqmx_error.logs` file in
//! the directory of the calling shell, and returns it as an `Err` for the
//! caller to log or propagate. A scan with a dead trigger stalls; it does
//! not crash.
//!
//! ## Callback Data Lifetime
//!
//! The registered callback receives a raw pointer to a heap-allocated
//! [`EdgeNotifier`]. The box is released in `unsubscribe` only after
//! `DAQmxClearTask` returns; the driver guarantees no callback runs past
//! task clearing, so the pointer never dangles.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::Write;

use log::info;

use pbcompiler_backend::edge::{EdgeNotifier, EdgePolarity, EdgeSource};
use pbcompiler_backend::error::{Result, SequencerError};

type CConstStr = *const libc::c_char;
type CCharBuf = *mut libc::c_char;
type CUint32 = libc::c_uint;
type CUint64 = libc::c_ulonglong;
type CInt32 = libc::c_int;
pub type TaskHandle = *mut libc::c_void;

pub const DAQMX_VAL_CHANFORALLLINES: CInt32 = 1;
pub const DAQMX_VAL_CONTSAMPS: CInt32 = 10123;
pub const DAQMX_VAL_CHANGEDETECTIONEVENT: CInt32 = 12522;

type SignalEventCallback =
    extern "C" fn(task: TaskHandle, signal_id: CInt32, data: *mut libc::c_void) -> CInt32;

#[link(name = "NIDAQmx")]
extern "C" {
    fn DAQmxGetExtendedErrorInfo(errorString: CCharBuf, bufferSize: CUint32) -> CInt32;

    fn DAQmxCreateTask(taskName: CConstStr, taskHandle_ptr: &mut TaskHandle) -> CInt32;
    fn DAQmxStartTask(handle: TaskHandle) -> CInt32;
    fn DAQmxStopTask(handle: TaskHandle) -> CInt32;
    fn DAQmxClearTask(handle: TaskHandle) -> CInt32;

    fn DAQmxCreateDIChan(
        handle: TaskHandle,
        lines: CConstStr,
        name: CConstStr,
        lineGrouping: CInt32,
    ) -> CInt32;
    fn DAQmxCfgChangeDetectionTiming(
        handle: TaskHandle,
        risingEdgeChan: CConstStr,
        fallingEdgeChan: CConstStr,
        sampleMode: CInt32,
        sampsPerChan: CUint64,
    ) -> CInt32;
    fn DAQmxRegisterSignalEvent(
        handle: TaskHandle,
        signalID: CInt32,
        options: CUint32,
        callbackFunction: SignalEventCallback,
        callbackData: *mut libc::c_void,
    ) -> CInt32;
}

/// Calls a DAQmx function; on a negative code, fetches the extended error
/// text, appends it to `nidaqmx_error.logs` (best effort), and returns it.
pub fn daqmx_try<F: FnOnce() -> CInt32>(func: F) -> std::result::Result<(), String> {
    let err_code = func();
    if err_code < 0 {
        let mut err_buff = [0i8; 2048];
        unsafe {
            DAQmxGetExtendedErrorInfo(err_buff.as_mut_ptr(), 2048 as CUint32);
        }
        let error_string = unsafe { std::ffi::CStr::from_ptr(err_buff.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        if let Ok(mut file) = OpenOptions::new()
            .write(true)
            .append(true)
            .create(true)
            .open("./nidaqmx_error.logs")
        {
            let _ = writeln!(file, "DAQmx Error: {}", error_string);
        }
        return Err(format!("DAQmx Error: {}", error_string));
    }
    Ok(())
}

// Runs on a DAQmx driver thread. Only enqueues; never touches shared state.
extern "C" fn change_event_trampoline(
    _task: TaskHandle,
    _signal_id: CInt32,
    data: *mut libc::c_void,
) -> CInt32 {
    let notifier = unsafe { &*(data as *const EdgeNotifier) };
    notifier.notify();
    0
}

struct ActiveTask {
    handle: TaskHandle,
    notifier: *mut EdgeNotifier,
    id: u64,
}

/// Edge source backed by a DAQmx change-detection task on one digital line.
pub struct DaqmxEdgeSource {
    task: Option<ActiveTask>,
    next_handle: u64,
}

// The task handle and notifier pointer are only touched from the thread
// that owns the source (the scan runner); the driver calls back through its
// own thread-safe machinery.
unsafe impl Send for DaqmxEdgeSource {}

impl DaqmxEdgeSource {
    pub fn new() -> Self {
        Self {
            task: None,
            next_handle: 0,
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.task.is_some()
    }
}

impl Default for DaqmxEdgeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EdgeSource for DaqmxEdgeSource {
    type Handle = u64;

    fn subscribe(
        &mut self,
        line: &str,
        polarity: EdgePolarity,
        notifier: EdgeNotifier,
    ) -> Result<u64> {
        if self.task.is_some() {
            return Err(SequencerError::EdgeSource(
                "already subscribed to a trigger line; unsubscribe first".to_string(),
            ));
        }

        let line_cstr = CString::new(line).map_err(|_| {
            SequencerError::EdgeSource(format!("trigger line {line:?} contains a NUL byte"))
        })?;
        let empty = CString::new("").expect("Failed to convert task name to CString");

        let mut handle: TaskHandle = std::ptr::null_mut();
        daqmx_try(|| unsafe { DAQmxCreateTask(empty.as_ptr(), &mut handle) })
            .map_err(SequencerError::EdgeSource)?;

        // From here on the task must be cleared if any step fails.
        let build = (|| {
            daqmx_try(|| unsafe {
                DAQmxCreateDIChan(
                    handle,
                    line_cstr.as_ptr(),
                    empty.as_ptr(),
                    DAQMX_VAL_CHANFORALLLINES,
                )
            })?;
            let (rising, falling) = match polarity {
                EdgePolarity::Rising => (line_cstr.as_ptr(), empty.as_ptr()),
                EdgePolarity::Falling => (empty.as_ptr(), line_cstr.as_ptr()),
            };
            daqmx_try(|| unsafe {
                DAQmxCfgChangeDetectionTiming(handle, rising, falling, DAQMX_VAL_CONTSAMPS, 1)
            })
        })();
        if let Err(msg) = build {
            unsafe { DAQmxClearTask(handle) };
            return Err(SequencerError::EdgeSource(msg));
        }

        let notifier_ptr = Box::into_raw(Box::new(notifier));
        if let Err(msg) = daqmx_try(|| unsafe {
            DAQmxRegisterSignalEvent(
                handle,
                DAQMX_VAL_CHANGEDETECTIONEVENT,
                0,
                change_event_trampoline,
                notifier_ptr as *mut libc::c_void,
            )
        }) {
            unsafe { DAQmxClearTask(handle) };
            drop(unsafe { Box::from_raw(notifier_ptr) });
            return Err(SequencerError::EdgeSource(msg));
        }

        let id = self.next_handle;
        self.next_handle += 1;
        self.task = Some(ActiveTask {
            handle,
            notifier: notifier_ptr,
            id,
        });
        info!("change detection registered on {} ({:?})", line, polarity);
        Ok(id)
    }

    fn unsubscribe(&mut self, handle: u64) -> Result<()> {
        let active = match self.task.take() {
            Some(active) if active.id == handle => active,
            other => {
                self.task = other;
                return Err(SequencerError::EdgeSource(format!(
                    "no active subscription with handle {handle}"
                )));
            }
        };

        let stopped = daqmx_try(|| unsafe { DAQmxStopTask(active.handle) });
        let cleared = daqmx_try(|| unsafe { DAQmxClearTask(active.handle) });
        // No callback survives DAQmxClearTask, so the notifier box is ours
        // again regardless of the return codes.
        drop(unsafe { Box::from_raw(active.notifier) });
        stopped.and(cleared).map_err(SequencerError::EdgeSource)
    }

    fn start(&mut self) -> Result<()> {
        let active = self.task.as_ref().ok_or_else(|| {
            SequencerError::EdgeSource("no trigger subscription to arm".to_string())
        })?;
        daqmx_try(|| unsafe { DAQmxStartTask(active.handle) }).map_err(SequencerError::EdgeSource)
    }
}

impl Drop for DaqmxEdgeSource {
    fn drop(&mut self) {
        if let Some(active) = self.task.take() {
            let _ = daqmx_try(|| unsafe { DAQmxStopTask(active.handle) });
            let _ = daqmx_try(|| unsafe { DAQmxClearTask(active.handle) });
            drop(unsafe { Box::from_raw(active.notifier) });
        }
    }
}
