// =============================================================================
// MinimalOS NextGen — Kernel Logger
// =============================================================================
//
// Wires the standard `log` crate to `khal::serial`. A framebuffer console
// sink can be layered on top of this later, but for now every log record
// goes out over COM1, matching what QEMU's `-serial stdio` (and a physical
// serial cable) can see from the first instruction of kmain() onward.
//
// `log::set_logger()` only needs a `&'static dyn Log` — no heap allocation
// required, so this can be installed before the kernel heap is up.
// =============================================================================

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Forwards every enabled record to the serial port, one line per record.
struct SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // `log_ok` equivalent: the original ports upstream of this one had a
        // distinct "OK" severity for successful init steps. We fold that into
        // Info with a bracketed tag rather than carrying a fifth log level.
        let tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };

        khal::serial::write_fmt(format_args!(
            "[{:>5}] {}: {}\n",
            tag,
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Installs the serial-backed logger as the global `log` sink.
///
/// Must be called exactly once, early in boot, before any `log::info!` et
/// al. call. Safe to call before the heap is initialized.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(LevelFilter::Trace))
        .expect("logger: init called more than once");
}
