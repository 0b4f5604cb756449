//! Line editor
//!
//! Turns raw terminal input into an input line plus the echo bytes that keep
//! the remote terminal's display in step with it. One byte is one column;
//! the cursor column and the buffer index are the same number.

use crossterm::cursor::{MoveLeft, MoveRight};
use crossterm::terminal::{Clear, ClearType};
use crossterm::Command;
use unicode_width::UnicodeWidthStr;

use super::keys::{self, Key, ESC};

const BACKSPACE: u8 = 0x08;
const DEL: u8 = 0x7F;
const CR: u8 = b'\r';

/// Outcome of feeding the front of an input slice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// Input bytes used up by this step
    pub consumed: usize,
    /// A carriage return completed the line
    pub command: bool,
}

/// Line editing state for one connection
#[derive(Debug)]
pub struct LineEditor {
    /// Usable columns (display width minus the prompt)
    cols: usize,
    /// Cursor column, also the index into `buf`
    cur: usize,
    /// Input line in progress
    buf: Vec<u8>,
    /// Echo accumulated since the last flush
    echo: Vec<u8>,
    /// Sticky until the next flush
    redraw: bool,
}

impl LineEditor {
    pub fn new(cols: usize) -> Self {
        Self {
            cols: cols.max(1),
            cur: 0,
            buf: Vec::with_capacity(cols),
            echo: Vec::new(),
            redraw: false,
        }
    }

    #[allow(dead_code)]
    pub fn cursor(&self) -> usize {
        self.cur
    }

    /// Current input line, including a trailing `\r\n` once entered
    pub fn line(&self) -> &[u8] {
        &self.buf
    }

    #[allow(dead_code)]
    pub fn needs_redraw(&self) -> bool {
        self.redraw
    }

    /// Drop the input line after it was dispatched.
    ///
    /// Echo and redraw state are kept; the cursor is only clamped so it
    /// never points past the now empty buffer.
    pub fn clear_line(&mut self) {
        self.buf.clear();
        self.cur = self.cur.min(self.buf.len());
    }

    /// Feed every byte of `input`; true if any of them completed a line
    pub fn feed_all(&mut self, input: &[u8]) -> bool {
        let mut rest = input;
        let mut command = false;
        while !rest.is_empty() {
            let step = self.feed(rest);
            command |= step.command;
            rest = &rest[step.consumed.max(1)..];
        }
        command
    }

    /// Process the byte at the front of `pending`.
    ///
    /// An escape introducer may consume a whole key sequence; lookahead is
    /// limited to `pending`, so a sequence split across calls degrades to
    /// an unknown one.
    pub fn feed(&mut self, pending: &[u8]) -> Step {
        let Some(&byte) = pending.first() else {
            return Step { consumed: 0, command: false };
        };

        match byte {
            ESC => match keys::recognize(pending) {
                Some(seq) => {
                    self.apply_key(seq.key);
                    Step { consumed: seq.len, command: false }
                }
                None => {
                    // Unknown sequence: the ESC becomes a space
                    self.insert(b' ');
                    Step { consumed: 1, command: false }
                }
            },
            BACKSPACE | DEL => {
                self.backspace();
                Step { consumed: 1, command: false }
            }
            CR => {
                self.enter();
                Step { consumed: 1, command: true }
            }
            other => {
                self.insert(other);
                Step { consumed: 1, command: false }
            }
        }
    }

    fn apply_key(&mut self, key: Key) {
        match key {
            Key::Left => self.back(),
            Key::Right => self.forward(),
            Key::Home => self.home(),
            Key::End => self.end(),
            Key::Delete => self.delete(),
            ignored => debug_assert!(ignored.is_ignored()),
        }
    }

    fn enter(&mut self) {
        self.buf.extend_from_slice(b"\r\n");
        self.echo.extend_from_slice(b"\r\n");
        self.cur = 0;
    }

    /// Move the cursor one column right
    pub fn forward(&mut self) {
        if self.cur >= self.buf.len() || self.cur + 1 >= self.cols {
            return;
        }
        self.cur += 1;
        push_ansi(&mut self.echo, MoveRight(1));
    }

    /// Move the cursor one column left
    pub fn back(&mut self) {
        if self.cur == 0 {
            return;
        }
        self.cur -= 1;
        push_ansi(&mut self.echo, MoveLeft(1));
    }

    /// Insert `c` at the cursor. Returns false if the line is full.
    pub fn insert(&mut self, c: u8) -> bool {
        if self.cur + 1 >= self.cols || self.buf.len() >= self.cols {
            return false;
        }

        if self.cur < self.buf.len() {
            self.redraw = true;
            self.buf.insert(self.cur, c);
            self.cur += 1;
        } else {
            self.buf.push(c);
            self.cur += 1;
            self.echo.push(c);
        }
        true
    }

    /// Remove the character left of the cursor
    pub fn backspace(&mut self) {
        if self.cur == 0 {
            return;
        }
        self.buf.remove(self.cur - 1);
        self.cur -= 1;
        self.redraw = true;
    }

    /// Remove the character under the cursor
    pub fn delete(&mut self) {
        self.redraw = true;
        if self.cur < self.buf.len() {
            self.buf.remove(self.cur);
        }
    }

    pub fn home(&mut self) {
        self.cur = 0;
        self.redraw = true;
    }

    pub fn end(&mut self) {
        self.cur = self.buf.len().min(self.cols - 1);
        self.redraw = true;
    }

    /// Take the bytes that bring the remote terminal up to date.
    ///
    /// Without a pending redraw this is the echo collected so far. With one,
    /// the echo is dropped and the whole line is repainted: column 0, clear
    /// line, prompt, buffer, column 0, then forward to the cursor.
    pub fn flush(&mut self, prompt: &str) -> Vec<u8> {
        if !self.redraw {
            return std::mem::take(&mut self.echo);
        }
        self.echo.clear();
        self.redraw = false;

        let mut out = Vec::with_capacity(prompt.len() + self.buf.len() + 16);
        out.push(CR);
        push_ansi(&mut out, Clear(ClearType::CurrentLine));
        out.extend_from_slice(prompt.as_bytes());
        out.extend_from_slice(&self.buf);
        out.push(CR);

        let shift = prompt.width() + self.cur;
        if shift > 0 {
            push_ansi(&mut out, MoveRight(u16::try_from(shift).unwrap_or(u16::MAX)));
        }
        out
    }
}

/// Append the ANSI form of a terminal command
fn push_ansi(out: &mut Vec<u8>, command: impl Command) {
    let mut seq = String::new();
    // Formatting into a String cannot fail
    let _ = command.write_ansi(&mut seq);
    out.extend_from_slice(seq.as_bytes());
}
