//! Protocol event dispatcher
//!
//! Reacts to the lifecycle events of a line-oriented ("ascii") WebSocket
//! protocol: endpoint init/teardown, connection established, data
//! received, writable and closed. Each connection owns an output queue and
//! a line editor while it is established; completed input lines go to the
//! [`Host`], which also creates and removes the interactive users.
//!
//! Everything here runs on one task. The only deferred work is the
//! post-handshake logon, queued on the dispatcher's own run queue and run
//! by [`Dispatcher::run_deferred`] before the next event is handled.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::session::{ConnId, ConnectionSession, SessionRegistry};
use crate::core::term::LineEditor;

/// Sent back for every binary frame
pub const BINARY_REJECTED: &str = "Error: ascii protocol doesn't allow binary messages, ignored!";

bitflags! {
    /// Per-user input handling chosen by the host
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct InputModes: u8 {
        /// Do not echo typed input
        const NO_ECHO     = 0b0001;
        /// Every received payload completes a command
        const SINGLE_CHAR = 0b0010;
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Endpoint is not initialized")]
    NoEndpoint,

    #[error("Unknown connection {0}")]
    UnknownConnection(ConnId),

    #[error("Connection {0} has no attached session")]
    NoSession(ConnId),

    #[error("Connection {0} is not established")]
    NotEstablished(ConnId),

    #[error("Link for protocol {got:?} used with {expected:?} bridge")]
    WrongProtocol { expected: String, got: String },

    #[error("Failed to resolve peer address: {0}")]
    PeerAddress(#[source] io::Error),

    #[error("Short write: {written} of {requested} bytes")]
    ShortWrite { requested: usize, written: usize },

    #[error("Failed to write to transport: {0}")]
    Write(#[source] io::Error),
}

/// Settings shared by every connection of one endpoint
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Protocol name, also carried by every [`Link`]
    pub protocol: Arc<str>,
    /// Input line width in columns
    pub cols: usize,
    /// Maximum bytes per transport write
    pub max_chunk: usize,
}

impl EndpointConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            protocol: Arc::from(config.server.protocol.as_str()),
            cols: config.terminal.cols(),
            max_chunk: config.output.max_chunk.max(1),
        }
    }
}

/// Handle a host keeps to address one connection of this bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub conn: ConnId,
    pub protocol: Arc<str>,
}

/// One received WebSocket message
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,
    pub binary: bool,
}

impl Frame {
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            binary: false,
        }
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            binary: true,
        }
    }
}

/// Connection lifecycle event
#[derive(Debug)]
pub enum Event<T> {
    /// Handshake finished; carries the transport handle
    Established(T),
    /// A message arrived
    Received(Frame),
    /// A requested writable notification
    Writable,
    /// The connection is gone
    Closed,
}

/// What the dispatcher needs from a connection's transport
pub trait Transport {
    /// Address of the remote peer
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Write `chunk` as one text message and return the bytes taken.
    ///
    /// `io::ErrorKind::WouldBlock` means the transport is applying flow
    /// control; nothing was taken and a later writable notification will
    /// allow another attempt.
    fn write_text(&mut self, chunk: &[u8]) -> io::Result<usize>;

    /// Ask for an [`Event::Writable`] for this connection
    fn request_writable(&mut self);

    /// Close the connection from this side
    fn close(&mut self);
}

/// Output produced by host callbacks, delivered after the callback returns
#[derive(Debug, Default)]
pub struct Outbox {
    pending: Vec<(Link, Vec<u8>)>,
}

impl Outbox {
    /// Queue bytes for the connection behind `link`
    pub fn send(&mut self, link: &Link, bytes: impl AsRef<[u8]>) {
        self.pending.push((link.clone(), bytes.as_ref().to_vec()));
    }

    /// Remove and return everything queued so far
    pub fn take(&mut self) -> Vec<(Link, Vec<u8>)> {
        std::mem::take(&mut self.pending)
    }
}

/// The application side of the bridge
pub trait Host {
    /// Interactive user attached to an established connection
    type User;

    /// Create the user for a connection that just completed its handshake
    fn new_user(&mut self, endpoint: &EndpointConfig, link: Link, addr: SocketAddr) -> Self::User;

    /// Called once, after the handshake event has returned
    fn on_logon(&mut self, user: &mut Self::User, out: &mut Outbox);

    /// A completed input line, still carrying its `\r\n`
    fn on_line(&mut self, user: &mut Self::User, line: &[u8], out: &mut Outbox);

    /// The connection of `user` has closed
    fn remove_interactive(&mut self, user: Self::User, destructive: bool, out: &mut Outbox);

    fn modes(&self, _user: &Self::User) -> InputModes {
        InputModes::empty()
    }

    /// Prompt shown in front of the input line on a full redraw
    fn prompt<'a>(&'a self, user: &'a Self::User) -> &'a str;
}

enum Deferred {
    Logon(ConnId),
}

struct Endpoint<U, T> {
    config: EndpointConfig,
    sessions: SessionRegistry<U, T>,
}

/// Per-endpoint protocol state machine
pub struct Dispatcher<H: Host, T> {
    host: H,
    endpoint: Option<Endpoint<H::User, T>>,
    run_queue: VecDeque<Deferred>,
    outbox: Outbox,
}

impl<H: Host, T: Transport> Dispatcher<H, T> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            endpoint: None,
            run_queue: VecDeque::new(),
            outbox: Outbox::default(),
        }
    }

    #[allow(dead_code)]
    pub fn host(&self) -> &H {
        &self.host
    }

    /// Connection registry, for diagnostics
    #[allow(dead_code)]
    pub fn sessions(&self) -> Option<&SessionRegistry<H::User, T>> {
        self.endpoint.as_ref().map(|e| &e.sessions)
    }

    /// Create the endpoint state
    pub fn init_endpoint(&mut self, config: EndpointConfig) {
        info!(
            "Endpoint init: protocol {}, {} columns, {} byte chunks",
            config.protocol, config.cols, config.max_chunk
        );
        self.endpoint = Some(Endpoint {
            config,
            sessions: SessionRegistry::new(),
        });
    }

    /// Close every connection and release the endpoint state
    pub fn teardown_endpoint(&mut self) {
        let Some(endpoint) = self.endpoint.as_ref() else {
            return;
        };
        let ids = endpoint.sessions.ids();
        info!(
            "Endpoint teardown: closing {} connection(s), {} established",
            ids.len(),
            endpoint.sessions.established()
        );
        for id in ids {
            self.fail(id);
        }
        self.run_queue.clear();
        self.endpoint = None;
    }

    /// React to one lifecycle event.
    ///
    /// An error means the connection must not continue; the caller closes
    /// it with [`Dispatcher::fail`].
    pub fn handle(&mut self, conn: ConnId, event: Event<T>) -> Result<(), BridgeError> {
        let result = match event {
            Event::Established(transport) => self.on_established(conn, transport),
            Event::Received(frame) => self.on_received(conn, frame),
            Event::Writable => self.on_writable(conn),
            Event::Closed => {
                self.on_closed(conn);
                Ok(())
            }
        };
        self.flush_outbox();
        result
    }

    /// Run the work deferred by earlier events
    pub fn run_deferred(&mut self) {
        while let Some(task) = self.run_queue.pop_front() {
            match task {
                Deferred::Logon(conn) => self.logon(conn),
            }
        }
        self.flush_outbox();
    }

    /// Force-close a connection after an error
    pub fn fail(&mut self, conn: ConnId) {
        let Some(endpoint) = self.endpoint.as_mut() else {
            return;
        };
        let Some(mut session) = endpoint.sessions.remove(conn) else {
            return;
        };
        warn!("Connection {}: closing", session.id);
        if let Some(live) = session.close() {
            self.host.remove_interactive(live.user, false, &mut self.outbox);
        }
        session.transport.close();
        self.flush_outbox();
    }

    /// Queue bytes for the connection behind `link`.
    ///
    /// Only valid while that connection is established on this bridge.
    pub fn send(&mut self, link: &Link, bytes: &[u8]) -> Result<(), BridgeError> {
        let endpoint = self.endpoint.as_mut().ok_or(BridgeError::NoEndpoint)?;
        if link.protocol != endpoint.config.protocol {
            return Err(BridgeError::WrongProtocol {
                expected: endpoint.config.protocol.to_string(),
                got: link.protocol.to_string(),
            });
        }
        let session = endpoint
            .sessions
            .get_mut(link.conn)
            .ok_or(BridgeError::NotEstablished(link.conn))?;
        let (live, _) = session
            .live_mut()
            .ok_or(BridgeError::NotEstablished(link.conn))?;
        live.queue.enqueue(bytes);
        want_writable(session);
        Ok(())
    }

    fn on_established(&mut self, conn: ConnId, transport: T) -> Result<(), BridgeError> {
        let endpoint = self.endpoint.as_mut().ok_or(BridgeError::NoEndpoint)?;
        let session = endpoint.sessions.insert(conn, transport);

        let addr = session.transport.peer_addr().map_err(|e| {
            warn!("Connection {}: peer address unavailable: {}", conn, e);
            BridgeError::PeerAddress(e)
        })?;
        let link = Link {
            conn,
            protocol: endpoint.config.protocol.clone(),
        };
        let user = self.host.new_user(&endpoint.config, link, addr);
        session.establish(user, LineEditor::new(endpoint.config.cols));
        info!(
            "Connection {} established from {} ({} live)",
            conn,
            addr,
            endpoint.sessions.established()
        );

        self.run_queue.push_back(Deferred::Logon(conn));
        Ok(())
    }

    fn logon(&mut self, conn: ConnId) {
        let Some(session) = self
            .endpoint
            .as_mut()
            .and_then(|e| e.sessions.get_mut(conn))
        else {
            debug!("Connection {}: gone before logon", conn);
            return;
        };
        let Some((live, _)) = session.live_mut() else {
            return;
        };

        // Back to column 0 without a line feed
        live.queue.enqueue(b"\r");
        self.host.on_logon(&mut live.user, &mut self.outbox);
        want_writable(session);
    }

    fn on_received(&mut self, conn: ConnId, frame: Frame) -> Result<(), BridgeError> {
        debug!(
            "Connection {}: received {} bytes (binary {})",
            conn,
            frame.data.len(),
            frame.binary
        );
        if frame.data.is_empty() {
            return Ok(());
        }

        let endpoint = self.endpoint.as_mut().ok_or(BridgeError::NoEndpoint)?;
        let session = endpoint
            .sessions
            .get_mut(conn)
            .ok_or(BridgeError::UnknownConnection(conn))?;
        let (live, _) = session.live_mut().ok_or(BridgeError::NoSession(conn))?;

        if frame.binary {
            warn!("Connection {}: binary message ignored", conn);
            live.queue.enqueue(BINARY_REJECTED.as_bytes());
            want_writable(session);
            return Ok(());
        }

        let modes = self.host.modes(&live.user);
        let mut command = modes.contains(InputModes::SINGLE_CHAR);
        command |= live.editor.feed_all(&frame.data);

        let echo = live.editor.flush(self.host.prompt(&live.user));
        let echoed = !echo.is_empty() && !modes.contains(InputModes::NO_ECHO);
        if echoed {
            live.queue.enqueue(&echo);
        }

        if command {
            self.host
                .on_line(&mut live.user, live.editor.line(), &mut self.outbox);
            live.editor.clear_line();
        }

        if echoed {
            want_writable(session);
        }
        Ok(())
    }

    fn on_writable(&mut self, conn: ConnId) -> Result<(), BridgeError> {
        let endpoint = self.endpoint.as_mut().ok_or(BridgeError::NoEndpoint)?;
        let max_chunk = endpoint.config.max_chunk;
        let Some(session) = endpoint.sessions.get_mut(conn) else {
            return Ok(());
        };
        session.writable_delivered();
        let Some((live, transport)) = session.live_mut() else {
            return Ok(());
        };

        match live
            .queue
            .drain_with(max_chunk, |chunk| transport.write_text(chunk))
        {
            Ok(drain) if drain.is_short() => {
                error!(
                    "Connection {}: wrote {} of {} bytes",
                    conn, drain.written, drain.requested
                );
                Err(BridgeError::ShortWrite {
                    requested: drain.requested,
                    written: drain.written,
                })
            }
            Ok(drain) => {
                debug!("Connection {}: wrote {} bytes", conn, drain.written);
                if !live.queue.is_empty() {
                    want_writable(session);
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("Connection {}: transport busy, {} bytes pending", conn, live.queue.len());
                want_writable(session);
                Ok(())
            }
            Err(e) => {
                error!("Connection {}: write failed: {}", conn, e);
                Err(BridgeError::Write(e))
            }
        }
    }

    fn on_closed(&mut self, conn: ConnId) {
        let Some(endpoint) = self.endpoint.as_mut() else {
            return;
        };
        let Some(mut session) = endpoint.sessions.remove(conn) else {
            return;
        };
        let remaining = endpoint.sessions.established();
        let Some(live) = session.close() else {
            debug!("Connection {}: closed before handshake", conn);
            return;
        };
        info!("Connection {} closed ({} live)", conn, remaining);
        self.host.remove_interactive(live.user, false, &mut self.outbox);
    }

    fn flush_outbox(&mut self) {
        for (link, bytes) in self.outbox.take() {
            if let Err(e) = self.send(&link, &bytes) {
                error!("Dropped {} bytes for connection {}: {}", bytes.len(), link.conn, e);
            }
        }
    }
}

/// Request a writable notification unless one is outstanding
fn want_writable<U, T: Transport>(session: &mut ConnectionSession<U, T>) {
    if session.arm_writable() {
        session.transport.request_writable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// What a mock transport saw
    #[derive(Default)]
    struct Wire {
        frames: Vec<Vec<u8>>,
        writable: usize,
        closed: bool,
        busy: bool,
        accept_at_most: Option<usize>,
    }

    impl Wire {
        fn text(&self) -> Vec<u8> {
            self.frames.concat()
        }
    }

    struct MockTransport {
        wire: Rc<RefCell<Wire>>,
        peer: Option<SocketAddr>,
    }

    impl Transport for MockTransport {
        fn peer_addr(&self) -> io::Result<SocketAddr> {
            self.peer
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no peer"))
        }

        fn write_text(&mut self, chunk: &[u8]) -> io::Result<usize> {
            let mut wire = self.wire.borrow_mut();
            if wire.busy {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = wire.accept_at_most.map_or(chunk.len(), |max| max.min(chunk.len()));
            wire.frames.push(chunk[..n].to_vec());
            Ok(n)
        }

        fn request_writable(&mut self) {
            self.wire.borrow_mut().writable += 1;
        }

        fn close(&mut self) {
            self.wire.borrow_mut().closed = true;
        }
    }

    #[derive(Default)]
    struct RecordingHost {
        logons: Vec<ConnId>,
        lines: Vec<(ConnId, Vec<u8>)>,
        removed: Vec<(ConnId, bool)>,
        modes: InputModes,
        greeting: Option<&'static str>,
    }

    impl Host for RecordingHost {
        type User = Link;

        fn new_user(&mut self, _endpoint: &EndpointConfig, link: Link, _addr: SocketAddr) -> Link {
            link
        }

        fn on_logon(&mut self, user: &mut Link, out: &mut Outbox) {
            self.logons.push(user.conn);
            if let Some(greeting) = self.greeting {
                out.send(user, greeting);
            }
        }

        fn on_line(&mut self, user: &mut Link, line: &[u8], _out: &mut Outbox) {
            self.lines.push((user.conn, line.to_vec()));
        }

        fn remove_interactive(&mut self, user: Link, destructive: bool, _out: &mut Outbox) {
            self.removed.push((user.conn, destructive));
        }

        fn modes(&self, _user: &Link) -> InputModes {
            self.modes
        }

        fn prompt<'a>(&'a self, _user: &'a Link) -> &'a str {
            "> "
        }
    }

    type TestDispatcher = Dispatcher<RecordingHost, MockTransport>;

    fn endpoint(max_chunk: usize) -> EndpointConfig {
        EndpointConfig {
            protocol: Arc::from("ascii"),
            cols: 78,
            max_chunk,
        }
    }

    fn dispatcher(host: RecordingHost, max_chunk: usize) -> TestDispatcher {
        let mut d = Dispatcher::new(host);
        d.init_endpoint(endpoint(max_chunk));
        d
    }

    fn connect(d: &mut TestDispatcher, conn: ConnId) -> Rc<RefCell<Wire>> {
        let wire = Rc::new(RefCell::new(Wire::default()));
        let transport = MockTransport {
            wire: wire.clone(),
            peer: Some("127.0.0.1:5000".parse().unwrap()),
        };
        d.handle(conn, Event::Established(transport)).unwrap();
        d.run_deferred();
        wire
    }

    /// Deliver pending writable notifications until none are left
    fn pump(d: &mut TestDispatcher, conn: ConnId, wire: &Rc<RefCell<Wire>>) -> usize {
        let mut events = 0;
        loop {
            {
                let mut w = wire.borrow_mut();
                if w.writable == 0 {
                    break;
                }
                w.writable -= 1;
            }
            d.handle(conn, Event::Writable).unwrap();
            events += 1;
        }
        events
    }

    fn link(conn: ConnId) -> Link {
        Link {
            conn,
            protocol: Arc::from("ascii"),
        }
    }

    #[test]
    fn test_logon_is_deferred() {
        let host = RecordingHost {
            greeting: Some("Welcome\r\n"),
            ..Default::default()
        };
        let mut d = dispatcher(host, 2048);

        let wire = Rc::new(RefCell::new(Wire::default()));
        let transport = MockTransport {
            wire: wire.clone(),
            peer: Some("10.0.0.1:1234".parse().unwrap()),
        };
        d.handle(1, Event::Established(transport)).unwrap();
        assert!(d.host().logons.is_empty());

        d.run_deferred();
        assert_eq!(d.host().logons, vec![1]);

        pump(&mut d, 1, &wire);
        assert_eq!(wire.borrow().text(), b"\rWelcome\r\n");
    }

    #[test]
    fn test_peer_address_failure_refuses_connection() {
        let mut d = dispatcher(RecordingHost::default(), 2048);
        let wire = Rc::new(RefCell::new(Wire::default()));
        let transport = MockTransport {
            wire: wire.clone(),
            peer: None,
        };

        let err = d.handle(1, Event::Established(transport)).unwrap_err();
        assert!(matches!(err, BridgeError::PeerAddress(_)));
        d.fail(1);
        d.run_deferred();

        assert!(wire.borrow().closed);
        assert!(d.host().logons.is_empty());
        assert!(d.host().removed.is_empty());
        assert_eq!(d.sessions().map(|s| s.count()), Some(0));
    }

    #[test]
    fn test_registry_tracks_live_connections() {
        let mut d = dispatcher(RecordingHost::default(), 2048);
        connect(&mut d, 1);
        connect(&mut d, 2);
        assert_eq!(d.sessions().map(|s| s.established()), Some(2));

        d.handle(1, Event::Closed).unwrap();
        assert_eq!(d.sessions().map(|s| s.established()), Some(1));
        assert_eq!(d.sessions().map(|s| s.ids()), Some(vec![2]));

        d.fail(2);
        assert_eq!(d.sessions().map(|s| s.count()), Some(0));
    }

    #[test]
    fn test_line_round_trip() {
        let mut d = dispatcher(RecordingHost::default(), 2048);
        let wire = connect(&mut d, 1);
        pump(&mut d, 1, &wire);
        wire.borrow_mut().frames.clear();

        d.handle(1, Event::Received(Frame::text("hello\r"))).unwrap();
        pump(&mut d, 1, &wire);

        assert_eq!(d.host().lines, vec![(1, b"hello\r\n".to_vec())]);
        assert_eq!(wire.borrow().text(), b"hello\r\n");

        // The line buffer was cleared after dispatch
        d.handle(1, Event::Received(Frame::text("x\r"))).unwrap();
        assert_eq!(d.host().lines[1], (1, b"x\r\n".to_vec()));
    }

    #[test]
    fn test_line_split_across_messages() {
        let mut d = dispatcher(RecordingHost::default(), 2048);
        let _wire = connect(&mut d, 1);

        d.handle(1, Event::Received(Frame::text("he"))).unwrap();
        d.handle(1, Event::Received(Frame::text("llo"))).unwrap();
        assert!(d.host().lines.is_empty());
        d.handle(1, Event::Received(Frame::text("\r"))).unwrap();
        assert_eq!(d.host().lines, vec![(1, b"hello\r\n".to_vec())]);
    }

    #[test]
    fn test_arrow_up_sends_nothing() {
        let mut d = dispatcher(RecordingHost::default(), 2048);
        let wire = connect(&mut d, 1);
        pump(&mut d, 1, &wire);
        wire.borrow_mut().frames.clear();

        d.handle(1, Event::Received(Frame::text("\x1b[A"))).unwrap();
        assert_eq!(pump(&mut d, 1, &wire), 0);
        assert!(wire.borrow().frames.is_empty());
    }

    #[test]
    fn test_binary_frame_rejected_but_connection_stays() {
        let mut d = dispatcher(RecordingHost::default(), 2048);
        let wire = connect(&mut d, 1);
        pump(&mut d, 1, &wire);
        wire.borrow_mut().frames.clear();

        d.handle(1, Event::Received(Frame::binary(vec![1u8, 2, 3])))
            .unwrap();
        pump(&mut d, 1, &wire);

        assert_eq!(wire.borrow().text(), BINARY_REJECTED.as_bytes());
        assert!(!wire.borrow().closed);
        assert!(d.host().lines.is_empty());
        assert!(d.sessions().and_then(|s| s.get(1)).is_some_and(|s| s.is_established()));
    }

    #[test]
    fn test_empty_payload_ignored() {
        let mut d = dispatcher(RecordingHost::default(), 2048);
        let wire = connect(&mut d, 1);
        pump(&mut d, 1, &wire);

        d.handle(1, Event::Received(Frame::text(""))).unwrap();
        d.handle(1, Event::Received(Frame::binary(Vec::<u8>::new())))
            .unwrap();
        assert_eq!(wire.borrow().writable, 0);
    }

    #[test]
    fn test_data_without_session_is_fatal() {
        let mut d = dispatcher(RecordingHost::default(), 2048);
        let err = d.handle(9, Event::Received(Frame::text("hi"))).unwrap_err();
        assert!(matches!(err, BridgeError::UnknownConnection(9)));

        // Handshake never completed
        let transport = MockTransport {
            wire: Rc::new(RefCell::new(Wire::default())),
            peer: None,
        };
        assert!(d.handle(2, Event::Established(transport)).is_err());
        let err = d.handle(2, Event::Received(Frame::text("hi"))).unwrap_err();
        assert!(matches!(err, BridgeError::NoSession(2)));
    }

    #[test]
    fn test_drain_takes_several_writable_events() {
        let mut d = dispatcher(RecordingHost::default(), 8);
        let wire = connect(&mut d, 1);
        pump(&mut d, 1, &wire);
        wire.borrow_mut().frames.clear();

        d.send(&link(1), b"0123456789abcdefghij").unwrap();
        let events = pump(&mut d, 1, &wire);

        assert_eq!(events, 3);
        let wire = wire.borrow();
        assert!(wire.frames.iter().all(|f| f.len() <= 8));
        assert_eq!(wire.text(), b"0123456789abcdefghij");
    }

    #[test]
    fn test_writable_requests_are_coalesced() {
        let mut d = dispatcher(RecordingHost::default(), 2048);
        let wire = connect(&mut d, 1);
        // Logon already asked once
        assert_eq!(wire.borrow().writable, 1);

        d.send(&link(1), b"a").unwrap();
        d.send(&link(1), b"b").unwrap();
        assert_eq!(wire.borrow().writable, 1);

        assert_eq!(pump(&mut d, 1, &wire), 1);
        assert_eq!(wire.borrow().text(), b"\rab");
    }

    #[test]
    fn test_short_write_is_fatal() {
        let mut d = dispatcher(RecordingHost::default(), 2048);
        let wire = connect(&mut d, 1);
        wire.borrow_mut().accept_at_most = Some(0);

        let err = d.handle(1, Event::Writable).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ShortWrite {
                requested: 1,
                written: 0
            }
        ));
        d.fail(1);
        assert!(wire.borrow().closed);
        assert_eq!(d.host().removed, vec![(1, false)]);
    }

    #[test]
    fn test_busy_transport_keeps_output() {
        let mut d = dispatcher(RecordingHost::default(), 2048);
        let wire = connect(&mut d, 1);
        wire.borrow_mut().busy = true;
        wire.borrow_mut().writable = 0;

        d.handle(1, Event::Writable).unwrap();
        assert_eq!(wire.borrow().writable, 1);
        assert!(wire.borrow().frames.is_empty());

        wire.borrow_mut().busy = false;
        pump(&mut d, 1, &wire);
        assert_eq!(wire.borrow().text(), b"\r");
    }

    #[test]
    fn test_closed_removes_user_once() {
        let mut d = dispatcher(RecordingHost::default(), 2048);
        let _wire = connect(&mut d, 1);

        d.handle(1, Event::Closed).unwrap();
        d.handle(1, Event::Closed).unwrap();
        assert_eq!(d.host().removed, vec![(1, false)]);
        assert_eq!(d.sessions().map(|s| s.count()), Some(0));

        // Nothing attached: no-op
        d.handle(42, Event::Closed).unwrap();
        assert_eq!(d.host().removed.len(), 1);
    }

    #[test]
    fn test_close_before_logon_skips_it() {
        let mut d = dispatcher(RecordingHost::default(), 2048);
        let transport = MockTransport {
            wire: Rc::new(RefCell::new(Wire::default())),
            peer: Some("127.0.0.1:1".parse().unwrap()),
        };
        d.handle(1, Event::Established(transport)).unwrap();
        d.handle(1, Event::Closed).unwrap();
        d.run_deferred();

        assert!(d.host().logons.is_empty());
        assert_eq!(d.host().removed, vec![(1, false)]);
    }

    #[test]
    fn test_no_echo_still_dispatches() {
        let host = RecordingHost {
            modes: InputModes::NO_ECHO,
            ..Default::default()
        };
        let mut d = dispatcher(host, 2048);
        let wire = connect(&mut d, 1);
        pump(&mut d, 1, &wire);
        wire.borrow_mut().frames.clear();

        d.handle(1, Event::Received(Frame::text("secret\r"))).unwrap();
        pump(&mut d, 1, &wire);

        assert!(wire.borrow().frames.is_empty());
        assert_eq!(d.host().lines, vec![(1, b"secret\r\n".to_vec())]);
    }

    #[test]
    fn test_single_char_mode_dispatches_every_payload() {
        let host = RecordingHost {
            modes: InputModes::SINGLE_CHAR,
            ..Default::default()
        };
        let mut d = dispatcher(host, 2048);
        let _wire = connect(&mut d, 1);

        d.handle(1, Event::Received(Frame::text("y"))).unwrap();
        d.handle(1, Event::Received(Frame::text("n"))).unwrap();
        assert_eq!(
            d.host().lines,
            vec![(1, b"y".to_vec()), (1, b"n".to_vec())]
        );
    }

    #[test]
    fn test_send_is_checked() {
        let mut d = dispatcher(RecordingHost::default(), 2048);
        assert!(matches!(
            d.send(&link(5), b"x"),
            Err(BridgeError::NotEstablished(5))
        ));

        let _wire = connect(&mut d, 1);
        let foreign = Link {
            conn: 1,
            protocol: Arc::from("binary"),
        };
        assert!(matches!(
            d.send(&foreign, b"x"),
            Err(BridgeError::WrongProtocol { .. })
        ));
        assert!(d.send(&link(1), b"x").is_ok());
    }

    #[test]
    fn test_events_before_init() {
        let mut d: TestDispatcher = Dispatcher::new(RecordingHost::default());
        let transport = MockTransport {
            wire: Rc::new(RefCell::new(Wire::default())),
            peer: Some("127.0.0.1:1".parse().unwrap()),
        };
        assert!(matches!(
            d.handle(1, Event::Established(transport)),
            Err(BridgeError::NoEndpoint)
        ));
        assert!(d.handle(1, Event::Closed).is_ok());
    }

    #[test]
    fn test_teardown_closes_everything() {
        let mut d = dispatcher(RecordingHost::default(), 2048);
        let a = connect(&mut d, 1);
        let b = connect(&mut d, 2);

        d.teardown_endpoint();
        assert!(a.borrow().closed && b.borrow().closed);
        let mut removed = d.host().removed.clone();
        removed.sort_unstable();
        assert_eq!(removed, vec![(1, false), (2, false)]);
        assert!(d.sessions().is_none());
    }
}
