//! The central relay.
//!
//! A [`Publisher`] runs on its own OS thread with a current-thread Tokio
//! runtime.  Inside it:
//!
//! - an acceptor on the **fan-in** endpoint spawns one task per producer
//!   connection; each task reassembles [`Envelope`]s and pushes them into a
//!   bounded inbox (`fanin_capacity`), which gives producers backpressure;
//! - an acceptor on the **fan-out** endpoint spawns one forwarding task per
//!   subscriber connection, each holding a receiver of a broadcast channel
//!   (`fanout_capacity`);
//! - the relay loop moves envelopes from the inbox to the broadcast channel
//!   without looking inside them, except to spot the exit sentinel.
//!
//! ```text
//!  Pusher ──┐                                    ┌──► Subscriber
//!  Pusher ──┼──► fan-in ──► inbox ──► relay ──► broadcast ──┼──► Subscriber
//!  Pusher ──┘                                    └──► Subscriber
//! ```
//!
//! The relay stops when it sees `publisher_exit` on the empty topic (after
//! rebroadcasting it) or when the shared [`StopFlag`](crate::StopFlag) is
//! raised.  Subscribers then get up to `grace_period` to drain what is still
//! buffered for them.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use experimentor_types::{ExpError, Payload};
use futures_util::future::join_all;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::codec::{Envelope, FrameAssembler};
use crate::context::RelayContext;
use crate::pusher::{Pusher, send_envelope};

/// Where a running relay actually listens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayAddrs {
    pub fanin: SocketAddr,
    pub fanout: SocketAddr,
}

/// Summary returned when the relay thread ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Messages rebroadcast, the exit sentinel included.
    pub relayed: u64,
}

struct RelayThread {
    thread: thread::JoinHandle<Result<RelayStats, ExpError>>,
    addrs: RelayAddrs,
}

/// Owner handle of the relay thread.
pub struct Publisher {
    ctx: RelayContext,
    running: Option<RelayThread>,
}

impl Publisher {
    pub fn new(ctx: RelayContext) -> Self {
        Self { ctx, running: None }
    }

    /// Bind both endpoints and start relaying.
    ///
    /// Returns once the sockets are bound, with the addresses they are bound
    /// to (useful when the configured ports are 0).  If the fan-out port is
    /// taken, the relay assumes a stale relay holds it: it sends that relay
    /// the exit sentinel, waits `rebind_delay` and tries once more.
    ///
    /// # Errors
    ///
    /// - [`ExpError::AlreadyRunning`] if this publisher is already running.
    /// - [`ExpError::Bind`] if an endpoint cannot be bound.
    pub async fn start(&mut self) -> Result<RelayAddrs, ExpError> {
        if let Some(running) = &self.running {
            if !running.thread.is_finished() {
                return Err(ExpError::AlreadyRunning(format!(
                    "relay on {}",
                    running.addrs.fanout
                )));
            }
        }
        if let Some(stale) = self.running.take() {
            // Previous relay ended on its own; collect its result.
            if let Err(e) = join_relay(stale.thread).await {
                warn!(error = %e, "previous relay ended with an error");
            }
        }
        self.ctx.config.validate()?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let ctx = self.ctx.clone();
        let thread = thread::Builder::new()
            .name("experimentor-relay".to_string())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| ExpError::Transport(format!("relay runtime: {e}")))?;
                runtime.block_on(run_relay(ctx, ready_tx))
            })
            .map_err(|e| ExpError::Transport(format!("spawn relay thread: {e}")))?;

        match ready_rx.await {
            Ok(Ok(addrs)) => {
                self.running = Some(RelayThread { thread, addrs });
                Ok(addrs)
            }
            Ok(Err(e)) => {
                let _ = join_relay(thread).await;
                Err(e)
            }
            // Thread ended before reporting: surface its own error.
            Err(_) => match join_relay(thread).await {
                Err(e) => Err(e),
                Ok(_) => Err(ExpError::Transport(
                    "relay exited before binding".to_string(),
                )),
            },
        }
    }

    /// Send the exit sentinel to this relay and wait for its thread.
    ///
    /// # Errors
    ///
    /// [`ExpError::NotRunning`] if the relay was never started, or the
    /// relay's own error if it failed.
    pub async fn stop(&mut self) -> Result<RelayStats, ExpError> {
        let Some(running) = self.running.take() else {
            return Err(ExpError::NotRunning("relay".to_string()));
        };
        if !running.thread.is_finished() {
            let pusher = Pusher::with_endpoint(self.ctx.clone(), running.addrs.fanin);
            let exit = Payload::text(self.ctx.config.publisher_exit.as_str());
            if let Err(e) = pusher.publish(exit, "").await {
                warn!(addr = %running.addrs.fanin, error = %e, "could not deliver exit sentinel");
            }
            pusher.finish().await;
        }
        let stats = join_relay(running.thread).await?;
        info!(relayed = stats.relayed, "relay stopped");
        Ok(stats)
    }

    /// Wait for the relay to end on its own (sentinel from elsewhere or the
    /// stop flag).
    pub async fn join(&mut self) -> Result<RelayStats, ExpError> {
        let Some(running) = self.running.take() else {
            return Err(ExpError::NotRunning("relay".to_string()));
        };
        join_relay(running.thread).await
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| !r.thread.is_finished())
    }

    pub fn addrs(&self) -> Option<RelayAddrs> {
        self.running.as_ref().map(|r| r.addrs)
    }

    /// Context pointing at the ports this relay actually bound.
    pub fn client_context(&self) -> Option<RelayContext> {
        self.addrs()
            .map(|a| self.ctx.with_ports(a.fanin.port(), a.fanout.port()))
    }

    pub fn context(&self) -> &RelayContext {
        &self.ctx
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("publisher dropped while its relay is still running");
        }
    }
}

async fn join_relay(
    thread: thread::JoinHandle<Result<RelayStats, ExpError>>,
) -> Result<RelayStats, ExpError> {
    match tokio::task::spawn_blocking(move || thread.join()).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(ExpError::Transport("relay thread panicked".to_string())),
        Err(e) => Err(ExpError::Transport(format!("join relay thread: {e}"))),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Relay thread
// ─────────────────────────────────────────────────────────────────────────────

type Forwarders = Arc<Mutex<Vec<JoinHandle<()>>>>;

async fn run_relay(
    ctx: RelayContext,
    ready: oneshot::Sender<Result<RelayAddrs, ExpError>>,
) -> Result<RelayStats, ExpError> {
    let (fanout_listener, fanin_listener) = match bind_endpoints(&ctx).await {
        Ok(listeners) => listeners,
        Err(e) => {
            let _ = ready.send(Err(e.clone()));
            return Err(e);
        }
    };
    let addrs = RelayAddrs {
        fanin: local_addr(&fanin_listener)?,
        fanout: local_addr(&fanout_listener)?,
    };

    let cfg = Arc::clone(&ctx.config);
    let (inbox_tx, mut inbox_rx) = mpsc::channel::<Envelope>(cfg.fanin_capacity);
    let (bus, _) = broadcast::channel::<Arc<Envelope>>(cfg.fanout_capacity);
    let forwarders: Forwarders = Arc::new(Mutex::new(Vec::new()));

    let fanin_task = tokio::spawn(accept_producers(fanin_listener, inbox_tx));
    let fanout_task = tokio::spawn(accept_subscribers(
        fanout_listener,
        bus.clone(),
        Arc::clone(&forwarders),
    ));

    info!(fanin = %addrs.fanin, fanout = %addrs.fanout, "relay listening");
    if ready.send(Ok(addrs)).is_err() {
        debug!("relay owner went away before start completed");
    }

    let mut relayed: u64 = 0;
    let mut ticker = tokio::time::interval(cfg.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            received = inbox_rx.recv() => {
                let Some(envelope) = received else { break };
                let exit = envelope.topic.is_empty()
                    && envelope.carries_sentinel(&cfg.publisher_exit);
                // Err only means nobody is subscribed right now.
                let _ = bus.send(Arc::new(envelope));
                relayed += 1;
                if exit {
                    info!(relayed, "exit sentinel received");
                    break;
                }
            }
            _ = ticker.tick() => {
                if ctx.stop.is_set() {
                    info!(relayed, "stop flag raised");
                    break;
                }
            }
        }
    }

    // Stop accepting, then let forwarders drain what is already buffered.
    fanin_task.abort();
    fanout_task.abort();
    drop(bus);
    let pending = std::mem::take(&mut *forwarders.lock());
    if tokio::time::timeout(cfg.grace_period, join_all(pending))
        .await
        .is_err()
    {
        warn!(grace = ?cfg.grace_period, "subscribers did not drain within the grace period");
    }

    Ok(RelayStats { relayed })
}

fn local_addr(listener: &TcpListener) -> Result<SocketAddr, ExpError> {
    listener
        .local_addr()
        .map_err(|e| ExpError::Transport(format!("local address: {e}")))
}

fn bind_error(addr: &str, e: io::Error) -> ExpError {
    ExpError::Bind {
        addr: addr.to_string(),
        details: e.to_string(),
    }
}

/// Fan-out first, then fan-in.  A taken fan-out port is treated as a stale
/// relay and asked to exit once.
async fn bind_endpoints(ctx: &RelayContext) -> Result<(TcpListener, TcpListener), ExpError> {
    let cfg = &ctx.config;
    let fanout_addr = cfg.fanout_addr();
    let fanout = match TcpListener::bind(&fanout_addr).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            warn!(addr = %fanout_addr, "fan-out address in use, asking the running relay to exit");
            let stale = Pusher::new(ctx.clone());
            if let Err(e) = stale
                .publish(Payload::text(cfg.publisher_exit.as_str()), "")
                .await
            {
                warn!(addr = %cfg.fanin_addr(), error = %e, "could not reach the stale relay");
            }
            stale.finish().await;
            tokio::time::sleep(cfg.rebind_delay).await;
            TcpListener::bind(&fanout_addr)
                .await
                .map_err(|e| bind_error(&fanout_addr, e))?
        }
        Err(e) => return Err(bind_error(&fanout_addr, e)),
    };

    let fanin_addr = cfg.fanin_addr();
    let fanin = TcpListener::bind(&fanin_addr)
        .await
        .map_err(|e| bind_error(&fanin_addr, e))?;
    Ok((fanout, fanin))
}

// ---------------------------------------------------------------------------
// Fan-in
// ---------------------------------------------------------------------------

async fn accept_producers(listener: TcpListener, inbox: mpsc::Sender<Envelope>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let inbox = inbox.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_producer(stream, peer, inbox).await {
                        warn!(peer = %peer, error = %e, "producer connection failed");
                    }
                });
            }
            Err(e) => error!(error = %e, "fan-in accept error"),
        }
    }
}

async fn handle_producer(
    stream: TcpStream,
    peer: SocketAddr,
    inbox: mpsc::Sender<Envelope>,
) -> Result<(), ExpError> {
    let mut ws = accept_async(stream)
        .await
        .map_err(|e| ExpError::Transport(format!("fan-in handshake from {peer}: {e}")))?;
    debug!(peer = %peer, "producer connected");

    let mut assembler = FrameAssembler::new();
    while let Some(frame) = ws.next().await {
        let frame = frame.map_err(|e| ExpError::Transport(e.to_string()))?;
        if frame.is_close() {
            break;
        }
        match assembler.push(frame) {
            Ok(Some(envelope)) => {
                if inbox.send(envelope).await.is_err() {
                    // Relay loop has ended.
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(peer = %peer, error = %e, "dropping malformed message"),
        }
    }
    debug!(peer = %peer, "producer disconnected");
    Ok(())
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

async fn accept_subscribers(
    listener: TcpListener,
    bus: broadcast::Sender<Arc<Envelope>>,
    forwarders: Forwarders,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                // Subscribe before the handshake: once the client sees the
                // connection open, nothing relayed afterwards is missed.
                let rx = bus.subscribe();
                let handle = tokio::spawn(async move {
                    if let Err(e) = forward_to_subscriber(stream, peer, rx).await {
                        debug!(peer = %peer, error = %e, "subscriber connection ended");
                    }
                });
                let mut tracked = forwarders.lock();
                tracked.retain(|h| !h.is_finished());
                tracked.push(handle);
            }
            Err(e) => error!(error = %e, "fan-out accept error"),
        }
    }
}

async fn forward_to_subscriber(
    stream: TcpStream,
    peer: SocketAddr,
    mut rx: broadcast::Receiver<Arc<Envelope>>,
) -> Result<(), ExpError> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| ExpError::Transport(format!("fan-out handshake from {peer}: {e}")))?;
    debug!(peer = %peer, "subscriber connected");
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Ok(envelope) => send_envelope(&mut ws_tx, &envelope).await?,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(peer = %peer, lagged_by = n, "subscriber lagged, oldest messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                _ => {}
            }
        }
    }
    debug!(peer = %peer, "subscriber disconnected");
    Ok(())
}
