//! Signals: named events of a model, carried over the relay.
//!
//! A [`Signal`] publishes on the topic `"{name}-{owner}"`, where `owner` is
//! the [`ModelHandle`] of the model that declared it.  Connecting a callback
//! starts a [`Subscriber`] on that topic; emitting pushes a [`SignalArgs`]
//! object to it.  All signals of one model share a single pusher, opened on
//! the first connect.
//!
//! Emitting a signal nobody listens to costs nothing: no pusher is created
//! and nothing goes on the wire.

use std::sync::Arc;

use experimentor_middleware::{Pusher, RelayContext, Subscriber};
use experimentor_types::{ExpError, Payload};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::model::ModelHandle;

/// Positional and keyword arguments of one emission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalArgs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub kwargs: Map<String, Value>,
}

impl SignalArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }
}

type SharedPusher = Arc<OnceCell<Pusher>>;

pub struct Signal {
    name: String,
    owner: ModelHandle,
    topic: String,
    ctx: RelayContext,
    pusher: SharedPusher,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Signal {
    fn new(ctx: RelayContext, owner: ModelHandle, name: String, pusher: SharedPusher) -> Self {
        Self {
            topic: format!("{name}-{owner}"),
            name,
            owner,
            ctx,
            pusher,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> ModelHandle {
        self.owner
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    async fn shared_pusher(&self) -> Result<&Pusher, ExpError> {
        self.pusher
            .get_or_try_init(|| async {
                debug!(signal = %self.name, owner = %self.owner, "opening pusher for signals");
                Pusher::connect(self.ctx.clone()).await
            })
            .await
    }

    /// Publish `args` to every connected callback.
    ///
    /// # Errors
    ///
    /// [`ExpError::Transport`] if the relay cannot be reached.
    pub async fn emit(&self, args: SignalArgs) -> Result<(), ExpError> {
        let listeners = self.subscriber_count();
        if listeners == 0 {
            debug!(signal = %self.name, owner = %self.owner, "emitted with no subscribers");
            return Ok(());
        }
        debug!(signal = %self.name, topic = %self.topic, listeners, ?args, "emitting");
        let payload = Payload::object(&args)?;
        self.shared_pusher().await?.publish(payload, &self.topic).await
    }

    /// Run `callback` on every emission from now on.
    ///
    /// The first connection of a model opens its pusher, so this can take as
    /// long as the relay handshake.  Messages on the topic that are not
    /// signal arguments (a broadcast on `""`, for instance) are skipped.
    pub async fn connect<F>(&self, mut callback: F) -> Result<(), ExpError>
    where
        F: FnMut(SignalArgs) -> Result<(), ExpError> + Send + 'static,
    {
        self.shared_pusher().await?;
        let topic = self.topic.clone();
        let subscriber = Subscriber::start(self.ctx.clone(), self.topic.clone(), move |payload| {
            match payload.deserialize::<SignalArgs>() {
                Ok(args) => callback(args),
                Err(e) => {
                    warn!(topic = %topic, error = %e, "ignoring message that is not signal arguments");
                    Ok(())
                }
            }
        })
        .await?;
        debug!(signal = %self.name, topic = %self.topic, "callback connected");
        self.subscribers.lock().push(subscriber);
        Ok(())
    }

    /// Not supported: a connected callback runs until [`close`](Self::close).
    pub fn disconnect(&self, callback: &str) {
        warn!(signal = %self.name, callback, "disconnecting signals is not implemented");
    }

    /// Stop every subscriber of this signal.
    ///
    /// # Errors
    ///
    /// The first callback error among the stopped subscribers; all of them
    /// are stopped regardless.
    pub async fn close(&self) -> Result<(), ExpError> {
        let subscribers = std::mem::take(&mut *self.subscribers.lock());
        let mut first_err = None;
        for mut subscriber in subscribers {
            if let Err(e) = subscriber.stop().await {
                warn!(signal = %self.name, error = %e, "subscriber ended with an error");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "signal {} of model {}", self.name, self.owner)
    }
}

/// Signals of one model instance, in declaration order.
pub struct SignalSet {
    owner: ModelHandle,
    pusher: SharedPusher,
    signals: IndexMap<String, Signal>,
}

impl SignalSet {
    pub fn new<I, S>(ctx: RelayContext, owner: ModelHandle, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pusher = SharedPusher::default();
        let signals = names
            .into_iter()
            .map(|name| {
                let name = name.into();
                let signal = Signal::new(ctx.clone(), owner, name.clone(), Arc::clone(&pusher));
                (name, signal)
            })
            .collect();
        Self {
            owner,
            pusher,
            signals,
        }
    }

    /// # Errors
    ///
    /// [`ExpError::InvalidModel`] if the model did not declare `name`.
    pub fn get(&self, name: &str) -> Result<&Signal, ExpError> {
        self.signals.get(name).ok_or_else(|| {
            ExpError::InvalidModel(format!("model {} has no signal '{name}'", self.owner))
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.signals.keys().map(String::as_str)
    }

    pub fn owner(&self) -> ModelHandle {
        self.owner
    }

    /// Whether the shared pusher has been opened.
    pub fn has_pusher(&self) -> bool {
        self.pusher.initialized()
    }

    /// Stop all subscribers and close the shared pusher.
    pub async fn close(&self) -> Result<(), ExpError> {
        let mut first_err = None;
        for signal in self.signals.values() {
            if let Err(e) = signal.close().await {
                first_err.get_or_insert(e);
            }
        }
        if let Some(pusher) = self.pusher.get() {
            pusher.finish().await;
        }
        first_err.map_or(Ok(()), Err)
    }
}
