//! Key sequence recognizer
//!
//! Classifies the cursor and editing keys a remote terminal sends as escape
//! sequences. This is the decoding direction of what a terminal's key mapper
//! produces: `ESC [ <final>` for arrows and Home/End and `ESC [ <n> ~` for
//! the tilde keys. Any other introducer, including application cursor mode
//! (`ESC O <final>`), is unknown.

/// Escape introducer
pub const ESC: u8 = 0x1B;

/// A recognized key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Up,
    Down,
    Right,
    Left,
    Home,
    End,
    Insert,
    Delete,
    PageUp,
    PageDown,
}

impl Key {
    /// Keys the line editor consumes without any effect
    pub fn is_ignored(self) -> bool {
        matches!(
            self,
            Key::Up | Key::Down | Key::Insert | Key::PageUp | Key::PageDown
        )
    }

    fn from_final(byte: u8) -> Option<Key> {
        match byte {
            b'A' => Some(Key::Up),
            b'B' => Some(Key::Down),
            b'C' => Some(Key::Right),
            b'D' => Some(Key::Left),
            b'H' => Some(Key::Home),
            b'F' => Some(Key::End),
            _ => None,
        }
    }

    fn from_tilde(code: u8) -> Option<Key> {
        match code {
            b'2' => Some(Key::Insert),
            b'3' => Some(Key::Delete),
            b'5' => Some(Key::PageUp),
            b'6' => Some(Key::PageDown),
            _ => None,
        }
    }
}

/// A key together with the number of input bytes it occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sequence {
    pub key: Key,
    pub len: usize,
}

/// Classify the sequence at the start of `window`.
///
/// `window` must begin with [`ESC`]. At most three bytes after it are
/// inspected. Returns `None` for anything unknown, including a sequence
/// that is cut off by the end of `window`.
pub fn recognize(window: &[u8]) -> Option<Sequence> {
    if window.first() != Some(&ESC) {
        return None;
    }

    match (window.get(1), window.get(2)) {
        (Some(&b'['), Some(&b)) => {
            if let Some(key) = Key::from_final(b) {
                return Some(Sequence { key, len: 3 });
            }
            let key = Key::from_tilde(b)?;
            (window.get(3) == Some(&b'~')).then_some(Sequence { key, len: 4 })
        }
        _ => None,
    }
}
