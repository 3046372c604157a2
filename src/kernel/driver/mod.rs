// src/kernel/driver/mod.rs
//! Debug output abstraction
//!
//! The VM subsystem logs through `write_debug`, which forwards to a sink
//! registered by the host kernel (typically the serial console). Until a
//! sink is registered, debug output is discarded. Host tests register a
//! stderr-backed sink.

use core::fmt;

use spin::Mutex;

/// Debug sink: receives one formatted line fragment at a time
pub type DebugSink = fn(&str);

static DEBUG_SINK: Mutex<Option<DebugSink>> = Mutex::new(None);

/// Register the debug output sink.
///
/// Later registrations replace earlier ones; passing the serial writer
/// here routes all `debug_println!` output to the serial port.
pub fn set_debug_sink(sink: DebugSink) {
    *DEBUG_SINK.lock() = Some(sink);
}

/// Write formatted debug output to the registered sink.
///
/// Called by the `debug_print!`/`debug_println!` macros; not meant to be
/// used directly.
pub fn write_debug(args: fmt::Arguments<'_>) {
    let sink = *DEBUG_SINK.lock();
    if let Some(sink) = sink {
        use alloc::string::ToString;
        sink(&args.to_string());
    }
}
