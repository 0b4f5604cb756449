//! Core connection components.
//!
//! This module contains the transport-independent pieces of the bridge:
//!
//! - **outbuf**: per-connection output queue with bounded draining
//! - **term**: key sequence recognizer and line editor
//! - **session**: connection phases and the live-session registry
//!
//! # Architecture
//!
//! ```text
//! SessionRegistry
//! └── ConnectionSession (one per transport connection)
//!     ├── Transport handle
//!     └── Live (only while established)
//!         ├── interactive user
//!         ├── OutputQueue
//!         └── LineEditor
//!             └── keys::recognize
//! ```

pub mod outbuf;
pub mod session;
pub mod term;
