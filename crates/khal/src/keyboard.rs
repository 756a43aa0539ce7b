//! PS/2 keyboard contract.
//!
//! Full keyboard handling (layouts, modifier state, the interactive shell)
//! is out of scope for the kernel core — this module exists only so the
//! core's IDT can route IRQ1 somewhere and so external collaborators have a
//! stable `KeyEvent`/`getchar`-shaped contract to build against.

use crate::port::{inb, outb};

/// Data port — read scancodes, write commands to device.
const PS2_DATA: u16 = 0x60;

/// PIC1 data port, used to unmask/EOI IRQ1.
const PIC1_DATA: u16 = 0x21;
const PIC1_COMMAND: u16 = 0x20;
const PIC_EOI: u8 = 0x20;

/// IRQ vector for the keyboard (PIC1 base 32 + IRQ1).
pub const KEYBOARD_VECTOR: u8 = 33;

/// Whether a key was pressed or released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Pressed,
    Released,
}

/// A decoded key: either a printable character or a named control key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Char(char),
    ArrowUp,
    ArrowDown,
    ArrowLeft,
    ArrowRight,
    Enter,
    Backspace,
    Unknown(u8),
}

/// A structured keyboard event carrying press/release state, the decoded
/// key, and the originating scancode byte.
#[derive(Debug, Clone, Copy)]
pub struct KeyEvent {
    pub state: KeyState,
    pub key: KeyKind,
    pub scancode: u8,
}

/// Scancode Set 1, unshifted, row-major US layout for the printable range.
/// Index is the scancode with the release bit (0x80) masked off.
const SET1_UNSHIFTED: [u8; 58] = [
    0, 0, b'1', b'2', b'3', b'4', b'5', b'6', b'7', b'8', b'9', b'0', b'-', b'=', 8, b'\t', b'q',
    b'w', b'e', b'r', b't', b'y', b'u', b'i', b'o', b'p', b'[', b']', b'\n', 0, b'a', b's', b'd',
    b'f', b'g', b'h', b'j', b'k', b'l', b';', b'\'', b'`', 0, b'\\', b'z', b'x', b'c', b'v', b'b',
    b'n', b'm', b',', b'.', b'/', 0, b'*', 0, b' ',
];

/// Decode one scancode-set-1 byte into a structured event.
///
/// Does not track Shift/CapsLock/extended-prefix state across calls — a
/// real shell-facing keyboard driver (out of scope here) would wrap this
/// with that state machine. Extended (`0xE0`-prefixed) arrow-key codes are
/// recognized directly since the caller passes the *second* byte of the
/// two-byte sequence with the high bit already indicating press/release.
pub fn decode(scancode: u8) -> KeyEvent {
    let released = scancode & 0x80 != 0;
    let code = scancode & 0x7f;
    let state = if released {
        KeyState::Released
    } else {
        KeyState::Pressed
    };

    let key = match code {
        0x48 => KeyKind::ArrowUp,
        0x50 => KeyKind::ArrowDown,
        0x4b => KeyKind::ArrowLeft,
        0x4d => KeyKind::ArrowRight,
        0x1c => KeyKind::Enter,
        0x0e => KeyKind::Backspace,
        c if (c as usize) < SET1_UNSHIFTED.len() && SET1_UNSHIFTED[c as usize] != 0 => {
            KeyKind::Char(SET1_UNSHIFTED[c as usize] as char)
        }
        other => KeyKind::Unknown(other),
    };

    KeyEvent {
        state,
        key,
        scancode,
    }
}

/// Read the next raw scancode byte from the PS/2 data port.
pub fn read_scancode() -> u8 {
    unsafe { inb(PS2_DATA) }
}

/// Unmask IRQ1 on the master PIC.
pub fn enable_irq() {
    unsafe {
        let mask = inb(PIC1_DATA);
        outb(PIC1_DATA, mask & !0x02);
    }
}

/// Acknowledge the keyboard IRQ on the master PIC.
pub fn send_eoi() {
    unsafe {
        outb(PIC1_COMMAND, PIC_EOI);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_printable_press() {
        let ev = decode(0x1e); // 'a' key, scancode set 1
        assert_eq!(ev.state, KeyState::Pressed);
        assert_eq!(ev.key, KeyKind::Char('a'));
    }

    #[test]
    fn decodes_release_bit() {
        let ev = decode(0x1e | 0x80);
        assert_eq!(ev.state, KeyState::Released);
    }

    #[test]
    fn decodes_named_arrow() {
        let ev = decode(0x48);
        assert_eq!(ev.key, KeyKind::ArrowUp);
    }
}
