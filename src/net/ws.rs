//! WebSocket transport
//!
//! Accepts connections with tokio-tungstenite and turns socket activity
//! into dispatcher events. Every connection gets a reader (this task) and a
//! writer task fed through a bounded frame channel; the dispatcher itself
//! stays on the single task that runs [`Server::run`].

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::bridge::{Dispatcher, EndpointConfig, Event, Frame, Host, Transport};
use crate::config::Config;
use crate::core::session::ConnId;

const SUBPROTOCOL: &str = "Sec-WebSocket-Protocol";

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type LoopEvent = (ConnId, Event<WsTransport>);

/// Transport handle for one WebSocket connection
pub struct WsTransport {
    id: ConnId,
    peer: Option<SocketAddr>,
    frames: mpsc::Sender<Message>,
    events: mpsc::UnboundedSender<LoopEvent>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Transport for WsTransport {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.peer
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "peer address unavailable"))
    }

    fn write_text(&mut self, chunk: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(chunk).into_owned();
        match self.frames.try_send(Message::text(text)) {
            Ok(()) => Ok(chunk.len()),
            Err(TrySendError::Full(_)) => Err(io::ErrorKind::WouldBlock.into()),
            Err(TrySendError::Closed(_)) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection writer has stopped",
            )),
        }
    }

    fn request_writable(&mut self) {
        let id = self.id;
        let events = self.events.clone();
        if self.frames.capacity() > 0 {
            let _ = events.send((id, Event::Writable));
            return;
        }

        // Wait for the writer to make room
        let frames = self.frames.clone();
        tokio::spawn(async move {
            if frames.reserve().await.is_ok() {
                let _ = events.send((id, Event::Writable));
            }
        });
    }

    fn close(&mut self) {
        let _ = self.frames.try_send(Message::Close(None));
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Listening endpoint
pub struct Server {
    listener: TcpListener,
    config: Config,
}

impl Server {
    /// Bind the configured listen address
    pub async fn bind(config: Config) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(&config.server.listen)
            .await
            .with_context(|| format!("Failed to listen on {}", config.server.listen))?;
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve connections with `host` until `shutdown` completes
    pub async fn run<H, S>(self, host: H, shutdown: S) -> anyhow::Result<()>
    where
        H: Host,
        S: Future<Output = ()>,
    {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<LoopEvent>();
        let mut dispatcher: Dispatcher<H, WsTransport> = Dispatcher::new(host);
        dispatcher.init_endpoint(EndpointConfig::from_config(&self.config));

        let protocol: Arc<str> = Arc::from(self.config.server.protocol.as_str());
        let accept = tokio::spawn(accept_loop(
            self.listener,
            protocol,
            self.config.output.send_queue.max(1),
            events_tx,
        ));

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down");
                    break;
                }
                event = events_rx.recv() => {
                    let Some((conn, event)) = event else {
                        break;
                    };
                    if let Err(e) = dispatcher.handle(conn, event) {
                        warn!("Connection {}: {}", conn, e);
                        dispatcher.fail(conn);
                    }
                    dispatcher.run_deferred();
                }
            }
        }

        accept.abort();
        dispatcher.teardown_endpoint();
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    protocol: Arc<str>,
    send_queue: usize,
    events: mpsc::UnboundedSender<LoopEvent>,
) {
    let mut next_id: ConnId = 1;
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let id = next_id;
                next_id += 1;
                debug!("Accepted {} as connection {}", addr, id);
                tokio::spawn(serve_connection(
                    id,
                    stream,
                    protocol.clone(),
                    send_queue,
                    events.clone(),
                ));
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn serve_connection(
    id: ConnId,
    stream: TcpStream,
    protocol: Arc<str>,
    send_queue: usize,
    events: mpsc::UnboundedSender<LoopEvent>,
) {
    let peer = stream.peer_addr().ok();
    let ws = match accept_hdr_async(stream, |request: &Request, response: Response| {
        negotiate(&protocol, request, response)
    })
    .await
    {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Connection {}: handshake failed: {}", id, e);
            return;
        }
    };

    let (mut sink, mut source) = ws.split();
    let (frames_tx, mut frames_rx) = mpsc::channel::<Message>(send_queue);
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    tokio::spawn(async move {
        while let Some(message) = frames_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = sink.send(message).await {
                debug!("Connection {}: send failed: {}", id, e);
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let transport = WsTransport {
        id,
        peer,
        frames: frames_tx,
        events: events.clone(),
        shutdown: Some(shutdown_tx),
    };
    if events.send((id, Event::Established(transport))).is_err() {
        return;
    }

    loop {
        let message = tokio::select! {
            _ = &mut shutdown_rx => {
                // Closed by the bridge, which already ran its close path
                debug!("Connection {}: reader stopped", id);
                return;
            }
            message = source.next() => message,
        };

        let frame = match message {
            Some(Ok(Message::Text(text))) => Frame::text(Bytes::copy_from_slice(text.as_str().as_bytes())),
            Some(Ok(Message::Binary(data))) => Frame::binary(data),
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                warn!("Connection {}: receive error: {}", id, e);
                break;
            }
        };
        if events.send((id, Event::Received(frame))).is_err() {
            return;
        }
    }

    let _ = events.send((id, Event::Closed));
}

/// Select our sub-protocol if the client asked for one.
///
/// A client that offers no sub-protocol is accepted as is; one that offers
/// only others is refused.
fn negotiate(protocol: &str, request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
    let Some(offered) = request.headers().get(SUBPROTOCOL) else {
        return Ok(response);
    };

    let accepted = offered
        .to_str()
        .map(|list| list.split(',').any(|p| p.trim() == protocol))
        .unwrap_or(false);
    let value = HeaderValue::from_str(protocol).ok().filter(|_| accepted);

    match value {
        Some(value) => {
            response.headers_mut().insert(SUBPROTOCOL, value);
            Ok(response)
        }
        None => {
            let mut refusal = ErrorResponse::new(Some(format!(
                "Unsupported sub-protocol, this endpoint speaks {}",
                protocol
            )));
            *refusal.status_mut() = StatusCode::BAD_REQUEST;
            Err(refusal)
        }
    }
}
