//! Fan-out clients.
//!
//! Each [`Subscriber`] owns an OS thread with a current-thread runtime, one
//! connection to the relay's fan-out endpoint and one callback.  Filtering is
//! done here, not in the relay: a subscriber sees messages on its own topic,
//! messages on the broadcast topic `""`, and everything if its own topic is
//! empty.
//!
//! A subscriber ends when
//!
//! - `subscriber_exit` arrives on its topic or on `""`,
//! - the relay closes the connection,
//! - the shared stop flag is raised,
//! - its owner calls [`Subscriber::stop`], or
//! - its callback returns an error or panics.  The error is not swallowed:
//!   it comes back from [`Subscriber::join`] / [`Subscriber::stop`].

use std::sync::Arc;
use std::thread;

use experimentor_types::{ExpError, Payload};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Notify, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::codec::FrameAssembler;
use crate::context::RelayContext;
use crate::pusher::{Pusher, connect_with_warmup};

pub type Callback = Box<dyn FnMut(Payload) -> Result<(), ExpError> + Send + 'static>;
pub type Transform = Box<dyn FnMut(Payload) -> Result<Payload, ExpError> + Send + 'static>;

enum Handler {
    Sink(Callback),
    Republish { f: Transform, out_topic: String },
}

/// Counters reported when a subscriber ends cleanly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    /// Payloads handed to the callback, sentinels excluded.
    pub delivered: u64,
}

type SubscriberThread = thread::JoinHandle<Result<SubscriberStats, ExpError>>;

pub struct Subscriber {
    topic: String,
    stop_signal: Arc<Notify>,
    thread: Option<SubscriberThread>,
}

impl Subscriber {
    /// Connect to the fan-out endpoint and run `callback` for every matching
    /// payload.
    ///
    /// Returns once the relay has accepted the connection: anything published
    /// after this returns reaches the callback.
    pub async fn start<F>(
        ctx: RelayContext,
        topic: impl Into<String>,
        callback: F,
    ) -> Result<Self, ExpError>
    where
        F: FnMut(Payload) -> Result<(), ExpError> + Send + 'static,
    {
        Self::spawn(ctx, topic.into(), Handler::Sink(Box::new(callback))).await
    }

    /// Like [`Subscriber::start`], but whatever `f` returns is published on
    /// `out_topic` through a pusher owned by the subscriber thread.
    pub async fn start_transform<F>(
        ctx: RelayContext,
        topic: impl Into<String>,
        out_topic: impl Into<String>,
        f: F,
    ) -> Result<Self, ExpError>
    where
        F: FnMut(Payload) -> Result<Payload, ExpError> + Send + 'static,
    {
        let handler = Handler::Republish {
            f: Box::new(f),
            out_topic: out_topic.into(),
        };
        Self::spawn(ctx, topic.into(), handler).await
    }

    async fn spawn(ctx: RelayContext, topic: String, handler: Handler) -> Result<Self, ExpError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let stop_signal = Arc::new(Notify::new());
        let thread_stop = Arc::clone(&stop_signal);
        let thread_topic = topic.clone();
        let thread = thread::Builder::new()
            .name(format!("sub:{topic}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| ExpError::Transport(format!("subscriber runtime: {e}")))?;
                runtime.block_on(run_subscriber(ctx, thread_topic, handler, thread_stop, ready_tx))
            })
            .map_err(|e| ExpError::Transport(format!("spawn subscriber thread: {e}")))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                topic,
                stop_signal,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = join_subscriber(thread, &topic).await;
                Err(e)
            }
            Err(_) => match join_subscriber(thread, &topic).await {
                Err(e) => Err(e),
                Ok(_) => Err(ExpError::Transport(format!(
                    "subscriber on '{topic}' exited before connecting"
                ))),
            },
        }
    }

    /// Ask this subscriber, and only this one, to end and wait for it.
    ///
    /// Nothing goes over the relay: other subscribers on the same topic and
    /// the relay itself keep running.  To end every subscriber of a topic,
    /// publish `subscriber_exit` on it instead.
    ///
    /// # Errors
    ///
    /// [`ExpError::NotRunning`] if already joined, [`ExpError::Callback`] if
    /// the callback failed.
    pub async fn stop(&mut self) -> Result<SubscriberStats, ExpError> {
        let Some(thread) = self.thread.take() else {
            return Err(ExpError::NotRunning(format!("subscriber on '{}'", self.topic)));
        };
        // A permit is stored if the thread is not waiting yet.
        self.stop_signal.notify_one();
        join_subscriber(thread, &self.topic).await
    }

    /// Wait for the subscriber to end without asking it to.
    pub async fn join(&mut self) -> Result<SubscriberStats, ExpError> {
        let Some(thread) = self.thread.take() else {
            return Err(ExpError::NotRunning(format!("subscriber on '{}'", self.topic)));
        };
        join_subscriber(thread, &self.topic).await
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

async fn join_subscriber(
    thread: SubscriberThread,
    topic: &str,
) -> Result<SubscriberStats, ExpError> {
    match tokio::task::spawn_blocking(move || thread.join()).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => Err(ExpError::Callback {
            topic: topic.to_string(),
            details: panic_message(panic.as_ref()),
        }),
        Err(e) => Err(ExpError::Transport(format!("join subscriber thread: {e}"))),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

/// Client-side topic filter.
fn accepts(own: &str, incoming: &str) -> bool {
    own.is_empty() || incoming.is_empty() || own == incoming
}

fn callback_error(topic: &str, e: ExpError) -> ExpError {
    ExpError::Callback {
        topic: topic.to_string(),
        details: e.to_string(),
    }
}

async fn run_subscriber(
    ctx: RelayContext,
    topic: String,
    mut handler: Handler,
    stop_signal: Arc<Notify>,
    ready: oneshot::Sender<Result<(), ExpError>>,
) -> Result<SubscriberStats, ExpError> {
    let cfg = Arc::clone(&ctx.config);
    let url = ctx.fanout_url();
    let ws = match connect_with_warmup(&url, cfg.connect_warmup).await {
        Ok(ws) => ws,
        Err(e) => {
            let _ = ready.send(Err(e.clone()));
            return Err(e);
        }
    };
    if ready.send(Ok(())).is_err() {
        debug!(topic = %topic, "owner went away before start completed");
    }
    debug!(topic = %topic, url = %url, "subscribed");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut assembler = FrameAssembler::new();
    let mut republisher: Option<Pusher> = None;
    let mut stats = SubscriberStats::default();
    let mut ticker = tokio::time::interval(cfg.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let envelope = tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Close(_))) | None => {
                    debug!(topic = %topic, "relay closed the connection");
                    break;
                }
                Some(Err(e)) => {
                    warn!(topic = %topic, error = %e, "fan-out connection error");
                    break;
                }
                Some(Ok(frame)) => match assembler.push(frame) {
                    Ok(Some(envelope)) => envelope,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "dropping malformed message");
                        continue;
                    }
                },
            },
            _ = stop_signal.notified() => {
                info!(topic = %topic, delivered = stats.delivered, "stopped by owner");
                tokio::time::sleep(cfg.grace_period).await;
                break;
            }
            _ = ticker.tick() => {
                if ctx.stop.is_set() {
                    info!(topic = %topic, "stop flag raised");
                    break;
                }
                continue;
            }
        };

        if !accepts(&topic, &envelope.topic) {
            continue;
        }
        let payload = match envelope.payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic = %envelope.topic, error = %e, "undecodable payload");
                continue;
            }
        };

        let addressed = envelope.topic == topic || envelope.topic.is_empty();
        if addressed && payload.is_sentinel(&cfg.subscriber_exit) {
            info!(topic = %topic, delivered = stats.delivered, "exit sentinel received");
            tokio::time::sleep(cfg.grace_period).await;
            break;
        }

        match &mut handler {
            Handler::Sink(callback) => {
                callback(payload).map_err(|e| callback_error(&topic, e))?;
            }
            Handler::Republish { f, out_topic } => {
                let result = f(payload).map_err(|e| callback_error(&topic, e))?;
                let pusher = republisher.get_or_insert_with(|| Pusher::new(ctx.clone()));
                pusher.publish(result, out_topic).await?;
            }
        }
        stats.delivered += 1;
    }

    if let Err(e) = ws_tx.close().await {
        debug!(topic = %topic, error = %e, "close failed");
    }
    if let Some(pusher) = republisher {
        pusher.finish().await;
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Envelope;
    use crate::pusher::send_envelope;
    use crate::relay::Publisher;
    use crate::test_support::{test_context, wait_until};
    use bytes::Bytes;
    use experimentor_types::{DType, Metadata, NdArray};
    use ndarray::{Array2, Array3};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    type Inbox = Arc<Mutex<Vec<Payload>>>;

    async fn collecting(ctx: &RelayContext, topic: &str) -> Result<(Subscriber, Inbox), ExpError> {
        let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&inbox);
        let sub = Subscriber::start(ctx.clone(), topic, move |p| {
            sink.lock().push(p);
            Ok(())
        })
        .await?;
        Ok((sub, inbox))
    }

    async fn running_relay() -> Result<(Publisher, RelayContext), ExpError> {
        let mut relay = Publisher::new(test_context());
        let addrs = relay.start().await?;
        let client = relay
            .context()
            .with_ports(addrs.fanin.port(), addrs.fanout.port());
        Ok((relay, client))
    }

    #[test]
    fn filter_rules() {
        assert!(accepts("frame", "frame"));
        assert!(!accepts("frame", "frames"));
        assert!(accepts("frame", ""));
        assert!(accepts("", "anything"));
    }

    #[tokio::test]
    async fn topics_are_isolated() -> Result<(), Box<dyn std::error::Error>> {
        let (mut relay, client) = running_relay().await?;
        let (mut sub_a, got_a) = collecting(&client, "a").await?;
        let (mut sub_b, got_b) = collecting(&client, "b").await?;

        let pusher = Pusher::new(client.clone());
        for i in 0..5 {
            pusher.publish(json!(i), "a").await?;
        }
        for i in 0..3 {
            pusher.publish(json!(100 + i), "b").await?;
        }
        assert_eq!(pusher.published("a"), 5);
        assert_eq!(pusher.total(), 8);

        assert!(wait_until(WAIT, || got_a.lock().len() == 5 && got_b.lock().len() == 3).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(got_a.lock().len(), 5);
        assert_eq!(got_b.lock().len(), 3);
        assert!(got_b.lock().iter().all(|p| p.deserialize::<i64>().unwrap() >= 100));

        assert_eq!(sub_a.stop().await?.delivered, 5);
        assert_eq!(sub_b.stop().await?.delivered, 3);
        relay.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn single_producer_order_is_preserved() -> Result<(), Box<dyn std::error::Error>> {
        const COUNT: u64 = 3000;
        let (mut relay, client) = running_relay().await?;
        let (mut sub, got) = collecting(&client, "counter").await?;

        let pusher = Pusher::connect(client.clone()).await?;
        for i in 0..COUNT {
            pusher.publish(json!(i), "counter").await?;
        }

        assert!(wait_until(Duration::from_secs(20), || got.lock().len() as u64 == COUNT).await);
        let values: Vec<u64> = got
            .lock()
            .iter()
            .map(|p| p.deserialize::<u64>().unwrap())
            .collect();
        assert_eq!(values, (0..COUNT).collect::<Vec<_>>());

        sub.stop().await?;
        relay.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn arrays_keep_dtype_shape_and_values() -> Result<(), Box<dyn std::error::Error>> {
        let (mut relay, client) = running_relay().await?;
        let (mut sub, got) = collecting(&client, "arrays").await?;

        let frame = Array2::<u16>::from_shape_fn((4, 4), |(r, c)| (r * 4 + c) as u16 * 1000);
        let cube = Array3::<f64>::from_shape_fn((2, 3, 4), |(i, j, k)| {
            i as f64 - j as f64 / 3.0 + k as f64 * 1e-9
        });
        let pusher = Pusher::new(client.clone());
        pusher.publish(NdArray::from_ndarray(&frame), "arrays").await?;
        pusher.publish(NdArray::from_ndarray(&cube), "arrays").await?;

        assert!(wait_until(WAIT, || got.lock().len() == 2).await);
        let received = got.lock().clone();

        let first = received[0].as_array().ok_or("expected an array")?;
        assert_eq!(first.dtype(), DType::Uint16);
        assert_eq!(first.shape(), &[4, 4]);
        assert_eq!(first.to_ndarray::<u16>()?.into_dimensionality::<ndarray::Ix2>()?, frame);

        let second = received[1].as_array().ok_or("expected an array")?;
        assert_eq!(second.dtype(), DType::Float64);
        assert_eq!(second.shape(), &[2, 3, 4]);
        assert_eq!(second.to_ndarray::<f64>()?.into_dimensionality::<ndarray::Ix3>()?, cube);

        sub.stop().await?;
        relay.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn subscriber_sentinel_stops_only_that_topic() -> Result<(), Box<dyn std::error::Error>> {
        let (mut relay, client) = running_relay().await?;
        let (mut sub_a, _) = collecting(&client, "a").await?;
        let (mut sub_b, got_b) = collecting(&client, "b").await?;

        let pusher = Pusher::new(client.clone());
        pusher.publish("stop", "a").await?;
        assert!(wait_until(WAIT, || sub_a.is_finished()).await);
        assert_eq!(sub_a.join().await?.delivered, 0);

        // Relay and the other subscriber are unaffected.
        assert!(relay.is_running());
        pusher.publish("still here", "b").await?;
        assert!(wait_until(WAIT, || got_b.lock().len() == 1).await);
        assert!(!sub_b.is_finished());

        // Relay exit on "" is also seen by b, whose sentinel is the same word.
        pusher.finish().await;
        let stats = relay.stop().await?;
        assert_eq!(stats.relayed, 3);
        assert!(wait_until(WAIT, || sub_b.is_finished()).await);
        assert_eq!(sub_b.join().await?.delivered, 1);
        Ok(())
    }

    #[tokio::test]
    async fn empty_topic_subscriber_sees_everything() -> Result<(), Box<dyn std::error::Error>> {
        let (mut relay, client) = running_relay().await?;
        let (mut all, got) = collecting(&client, "").await?;

        let pusher = Pusher::new(client.clone());
        pusher.publish(json!(1), "x").await?;
        pusher.publish(json!(2), "y").await?;
        // Someone else's sentinel does not end a catch-all subscriber.
        pusher.publish("stop", "x").await?;
        pusher.publish(json!(3), "z").await?;

        assert!(wait_until(WAIT, || got.lock().len() == 4).await);
        assert!(!all.is_finished());

        relay.stop().await?;
        assert!(wait_until(WAIT, || all.is_finished()).await);
        assert_eq!(all.join().await?.delivered, 4);
        Ok(())
    }

    #[tokio::test]
    async fn callback_error_terminates_subscriber() -> Result<(), Box<dyn std::error::Error>> {
        let (mut relay, client) = running_relay().await?;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut sub = Subscriber::start(client.clone(), "jobs", move |p| {
            let n: i64 = p.deserialize()?;
            if n == 2 {
                return Err(ExpError::HardwareFault {
                    component: "shutter".to_string(),
                    details: "jammed".to_string(),
                });
            }
            sink.lock().push(n);
            Ok(())
        })
        .await?;

        let pusher = Pusher::new(client.clone());
        for n in 1..=3 {
            pusher.publish(json!(n), "jobs").await?;
        }

        assert!(wait_until(WAIT, || sub.is_finished()).await);
        match sub.join().await {
            Err(ExpError::Callback { topic, details }) => {
                assert_eq!(topic, "jobs");
                assert!(details.contains("jammed"));
            }
            other => panic!("expected a callback error, got {other:?}"),
        }
        assert_eq!(*seen.lock(), vec![1]);

        relay.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn callback_panic_surfaces_as_error() -> Result<(), Box<dyn std::error::Error>> {
        let (mut relay, client) = running_relay().await?;
        let mut sub =
            Subscriber::start(client.clone(), "fragile", |_| panic!("sensor on fire")).await?;

        Pusher::new(client.clone()).publish(json!(null), "fragile").await?;
        assert!(wait_until(WAIT, || sub.is_finished()).await);
        match sub.stop().await {
            Err(ExpError::Callback { details, .. }) => assert!(details.contains("sensor on fire")),
            other => panic!("expected a callback error, got {other:?}"),
        }

        relay.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn transform_republishes_results() -> Result<(), Box<dyn std::error::Error>> {
        let (mut relay, client) = running_relay().await?;
        let (mut doubled, got) = collecting(&client, "doubled").await?;
        let mut doubler = Subscriber::start_transform(client.clone(), "raw", "doubled", |p| {
            let v: f64 = p.deserialize()?;
            Ok(Payload::Object(json!(v * 2.0)))
        })
        .await?;

        let pusher = Pusher::new(client.clone());
        pusher.publish(json!(1.5), "raw").await?;
        pusher.publish(json!(-4.0), "raw").await?;

        assert!(wait_until(WAIT, || got.lock().len() == 2).await);
        assert_eq!(*got.lock(), vec![Payload::Object(json!(3.0)), Payload::Object(json!(-8.0))]);

        assert_eq!(doubler.stop().await?.delivered, 2);
        doubled.stop().await?;
        relay.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn stop_flag_ends_subscriber() -> Result<(), Box<dyn std::error::Error>> {
        let (mut relay, client) = running_relay().await?;
        let (mut sub, _) = collecting(&client, "idle").await?;

        client.stop.set();
        assert!(wait_until(WAIT, || sub.is_finished()).await);
        sub.join().await?;
        // The relay shares the flag and ends too.
        assert!(wait_until(WAIT, || !relay.is_running()).await);
        relay.join().await?;
        Ok(())
    }

    #[tokio::test]
    async fn catch_all_stop_keeps_others_running() -> Result<(), Box<dyn std::error::Error>> {
        let (mut relay, client) = running_relay().await?;
        let (mut all, _) = collecting(&client, "").await?;
        let (mut frames, got) = collecting(&client, "frame").await?;

        assert_eq!(all.stop().await?.delivered, 0);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(relay.is_running());
        assert!(!frames.is_finished());

        let pusher = Pusher::new(client.clone());
        pusher.publish(json!(7), "frame").await?;
        assert!(wait_until(WAIT, || got.lock().len() == 1).await);
        assert!(matches!(all.stop().await, Err(ExpError::NotRunning(_))));

        pusher.finish().await;
        assert_eq!(frames.stop().await?.delivered, 1);
        assert_eq!(relay.stop().await?.relayed, 2);
        Ok(())
    }

    #[tokio::test]
    async fn stop_ends_one_same_topic_subscriber() -> Result<(), Box<dyn std::error::Error>> {
        let (mut relay, client) = running_relay().await?;
        let (mut first, _) = collecting(&client, "frame").await?;
        let (mut second, got) = collecting(&client, "frame").await?;

        first.stop().await?;
        let pusher = Pusher::new(client.clone());
        pusher.publish(json!("after"), "frame").await?;
        assert!(wait_until(WAIT, || got.lock().len() == 1).await);
        assert!(!second.is_finished());

        pusher.finish().await;
        second.stop().await?;
        relay.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn oversized_array_shape_is_dropped() -> Result<(), Box<dyn std::error::Error>> {
        let (mut relay, client) = running_relay().await?;
        let (mut sub, got) = collecting(&client, "frame").await?;

        let mut raw = connect_with_warmup(&client.fanin_url(), client.config.connect_warmup).await?;
        let bogus = Envelope::new(
            "frame",
            Metadata::array(DType::Uint16, vec![usize::MAX, 3], 0),
            Bytes::from_static(&[0u8; 4]),
        )?;
        send_envelope(&mut raw, &bogus).await?;
        let valid = Envelope::encode("frame", &Payload::Object(json!("fine")), 1)?;
        send_envelope(&mut raw, &valid).await?;

        assert!(wait_until(WAIT, || got.lock().len() == 1).await);
        assert_eq!(got.lock()[0], Payload::Object(json!("fine")));
        assert!(!sub.is_finished());

        raw.close(None).await?;
        assert_eq!(sub.stop().await?.delivered, 1);
        relay.stop().await?;
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_relay_fails_start() {
        let mut cfg = crate::test_support::test_config();
        cfg.connect_warmup = Duration::from_millis(100);
        let ctx = RelayContext::new(cfg).with_ports(9, 9);
        let result = Subscriber::start(ctx, "nothing", |_| Ok(())).await;
        assert!(matches!(result, Err(ExpError::Transport(_))));
    }

    /// A camera-style frame goes through a relay on its own port pair, reaches
    /// the subscriber exactly once, and the exit sentinel then ends the
    /// subscriber.
    #[tokio::test]
    async fn camera_frame_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
        let (mut relay, client) = running_relay().await?;
        let (mut sub, got) = collecting(&client, "frame").await?;

        let frame = Array2::<u16>::from_elem((4, 4), 4095);
        let pusher = Pusher::new(client.clone());
        pusher.publish(NdArray::from_ndarray(&frame), "frame").await?;
        assert!(wait_until(WAIT, || got.lock().len() == 1).await);

        pusher.publish("stop", "frame").await?;
        assert!(wait_until(WAIT, || sub.is_finished()).await);
        assert_eq!(sub.join().await?.delivered, 1);
        assert_eq!(got.lock().len(), 1);

        let arr = got.lock()[0].as_array().cloned().ok_or("expected an array")?;
        assert_eq!(arr.shape(), &[4, 4]);
        assert_eq!(arr.to_vec::<u16>()?, vec![4095; 16]);

        pusher.finish().await;
        relay.stop().await?;
        Ok(())
    }
}
