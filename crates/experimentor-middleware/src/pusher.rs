//! Fan-in client.
//!
//! A [`Pusher`] owns one WebSocket connection to the relay's fan-in endpoint
//! and sends every message as three frames under a single lock, so messages
//! from one pusher never interleave and arrive in the order they were sent.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use experimentor_types::{ExpError, Payload};
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};

use crate::codec::Envelope;
use crate::context::RelayContext;

pub(crate) type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Pause between connection attempts while the relay comes up.
const RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Connect to `url`, retrying until `warmup` has elapsed.
pub(crate) async fn connect_with_warmup(url: &str, warmup: Duration) -> Result<WsClient, ExpError> {
    let deadline = Instant::now() + warmup;
    loop {
        match connect_async(url).await {
            Ok((ws, _)) => {
                debug!(url = %url, "connected");
                return Ok(ws);
            }
            Err(e) if Instant::now() < deadline => {
                trace!(url = %url, error = %e, "relay not ready, retrying");
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                return Err(ExpError::Transport(format!("connect to {url}: {e}")));
            }
        }
    }
}

/// Producer side of the relay.
///
/// The connection is opened lazily on the first [`publish`](Self::publish)
/// unless the pusher was built with [`Pusher::connect`].  It belongs to the
/// Tokio runtime that opened it; publish from that runtime.
pub struct Pusher {
    ctx: RelayContext,
    url: String,
    conn: Mutex<Option<WsClient>>,
    counters: parking_lot::Mutex<HashMap<String, u64>>,
}

impl Pusher {
    /// A pusher for the configured fan-in endpoint.  Does not touch the
    /// network yet.
    pub fn new(ctx: RelayContext) -> Self {
        let url = ctx.fanin_url();
        Self::build(ctx, url)
    }

    /// A pusher for an explicit `host:port`, e.g. the address a relay
    /// reported after binding.
    pub fn with_endpoint(ctx: RelayContext, addr: impl std::fmt::Display) -> Self {
        Self::build(ctx, format!("ws://{addr}"))
    }

    /// Like [`Pusher::new`] but completes the handshake before returning.
    pub async fn connect(ctx: RelayContext) -> Result<Self, ExpError> {
        let pusher = Self::new(ctx);
        pusher.ensure_connected().await?;
        Ok(pusher)
    }

    fn build(ctx: RelayContext, url: String) -> Self {
        Self {
            ctx,
            url,
            conn: Mutex::new(None),
            counters: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Open the connection now if it is not open yet.
    pub async fn ensure_connected(&self) -> Result<(), ExpError> {
        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            *conn = Some(connect_with_warmup(&self.url, self.ctx.config.connect_warmup).await?);
        }
        Ok(())
    }

    /// Send `payload` on `topic`.
    ///
    /// # Errors
    ///
    /// [`ExpError::Transport`] when the relay cannot be reached within
    /// `connect_warmup` or the connection breaks mid-send.  A broken
    /// connection is dropped; the next publish reconnects.
    pub async fn publish(&self, payload: impl Into<Payload>, topic: &str) -> Result<(), ExpError> {
        let payload = payload.into();
        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            *conn = Some(connect_with_warmup(&self.url, self.ctx.config.connect_warmup).await?);
        }
        let Some(ws) = conn.as_mut() else {
            return Err(ExpError::NotRunning(format!("pusher to {}", self.url)));
        };

        let seq = self.published(topic);
        let envelope = Envelope::encode(topic, &payload, seq)?;
        if let Err(e) = send_envelope(ws, &envelope).await {
            warn!(url = %self.url, topic = %topic, error = %e, "publish failed, dropping connection");
            *conn = None;
            return Err(e);
        }
        *self.counters.lock().entry(topic.to_string()).or_insert(0) += 1;
        trace!(topic = %topic, seq, "published");
        Ok(())
    }

    /// Messages successfully sent on `topic`.
    pub fn published(&self, topic: &str) -> u64 {
        self.counters.lock().get(topic).copied().unwrap_or(0)
    }

    /// Messages successfully sent on all topics.
    pub fn total(&self) -> u64 {
        self.counters.lock().values().sum()
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    pub fn endpoint(&self) -> &str {
        &self.url
    }

    pub fn context(&self) -> &RelayContext {
        &self.ctx
    }

    /// Close the connection.  A later publish opens a new one.
    pub async fn finish(&self) {
        if let Some(mut ws) = self.conn.lock().await.take() {
            if let Err(e) = ws.close(None).await {
                debug!(url = %self.url, error = %e, "close failed");
            }
        }
    }
}

pub(crate) async fn send_envelope<S>(sink: &mut S, envelope: &Envelope) -> Result<(), ExpError>
where
    S: futures_util::Sink<Message, Error = tungstenite::Error> + Unpin,
{
    for frame in envelope.frames() {
        sink.feed(frame)
            .await
            .map_err(|e| ExpError::Transport(e.to_string()))?;
    }
    sink.flush()
        .await
        .map_err(|e| ExpError::Transport(e.to_string()))
}
