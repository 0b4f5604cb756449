//! Terminal-side line discipline
//!
//! - **keys**: recognizer for the escape sequences of cursor and edit keys
//! - **line**: line editor and echo/redraw rendering

pub mod keys;
pub mod line;

pub use line::LineEditor;
