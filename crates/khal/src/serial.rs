//! 16550 UART driver for COM1 — this is the transport `util::logger`
//! writes every log line through, and the only I/O channel that exists
//! before the framebuffer/console are ever touched.

use core::fmt;
use spin::Mutex;

use crate::port::{inb, outb};

const COM1_PORT: u16 = 0x3F8;

/// Register offsets from `COM1_PORT`, named instead of inlined at each
/// `outb` call.
mod reg {
    pub const DATA: u16 = 0;
    pub const IER: u16 = 1;
    pub const FCR: u16 = 2;
    pub const LCR: u16 = 3;
    pub const MCR: u16 = 4;
    pub const LSR: u16 = 5;
}

const LSR_THRE: u8 = 0x20; // transmit holding register empty

pub struct Serial {
    initialized: bool,
}

impl Serial {
    const fn new() -> Self {
        Self {
            initialized: false,
        }
    }

    /// Programs the UART for 115200 8N1, then round-trips a byte through
    /// loopback mode to confirm a real 16550 answers before committing to
    /// normal operation.
    pub fn init(&mut self) {
        unsafe {
            outb(COM1_PORT + reg::IER, 0x00); // mask all UART interrupts, we poll

            outb(COM1_PORT + reg::LCR, 0x80); // DLAB=1: next two writes set the divisor
            outb(COM1_PORT + reg::DATA, 0x01); // divisor low byte -> 115200 baud
            outb(COM1_PORT + reg::IER, 0x00); // divisor high byte
            outb(COM1_PORT + reg::LCR, 0x03); // DLAB=0, 8 data bits, no parity, 1 stop bit

            outb(COM1_PORT + reg::FCR, 0xC7); // enable + flush FIFOs, 14-byte trigger

            outb(COM1_PORT + reg::MCR, 0x03); // RTS/DSR asserted, OUT2 still clear
            outb(COM1_PORT + reg::MCR, 0x1E); // loopback mode for the self-test below

            outb(COM1_PORT + reg::DATA, 0xAE);
            if inb(COM1_PORT + reg::DATA) != 0xAE {
                // No UART answered the loopback test. Could be running under
                // an emulator with COM1 unwired, or real hardware without
                // one. Either way, mark initialized and let every write
                // silently fall on the floor rather than block boot on it.
                self.initialized = true;
                return;
            }

            outb(COM1_PORT + reg::MCR, 0x0F); // normal operation: OUT1, OUT2, RTS, DTR
            outb(COM1_PORT + reg::IER, 0x00); // still polling, not interrupt-driven

            self.initialized = true;
        }
    }

    fn is_transmit_empty() -> bool {
        unsafe { inb(COM1_PORT + reg::LSR) & LSR_THRE != 0 }
    }

    pub fn write_byte(&self, byte: u8) {
        if !self.initialized {
            return;
        }

        while !Self::is_transmit_empty() {
            core::hint::spin_loop();
        }

        unsafe {
            outb(COM1_PORT + reg::DATA, byte);
        }
    }

    pub fn write_str(&self, s: &str) {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
    }
}

impl fmt::Write for Serial {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
        Ok(())
    }
}

static SERIAL: Mutex<Serial> = Mutex::new(Serial::new());

pub fn init() {
    SERIAL.lock().init();
    SERIAL.lock().write_str("Serial port initialized\n");
}

pub fn write_str(s: &str) {
    SERIAL.lock().write_str(s);
}

pub fn write_fmt(args: fmt::Arguments) {
    use fmt::Write;
    SERIAL.lock().write_fmt(args).unwrap();
}
