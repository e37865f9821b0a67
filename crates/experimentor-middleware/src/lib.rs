//! `experimentor-middleware` – the broadcast layer between instruments and
//! everything that consumes their data.
//!
//! One central relay ([`Publisher`]) accepts messages from any number of
//! [`Pusher`]s on its fan-in endpoint and rebroadcasts them, unchanged, to
//! every [`Subscriber`] connected to its fan-out endpoint.  Topics are plain
//! strings filtered on the receiving side.
//!
//! # Modules
//!
//! - [`context`] – [`StopFlag`] and [`RelayContext`], the configuration and
//!   cancellation handle passed to every component.
//! - [`codec`] – the three-frame wire message ([`Envelope`]) and the
//!   [`FrameAssembler`] that rebuilds it from a WebSocket stream.
//! - [`relay`] – the [`Publisher`] relay thread.
//! - [`pusher`] – the fan-in client.
//! - [`subscriber`] – fan-out clients running callbacks on their own thread.

pub mod codec;
pub mod context;
pub mod pusher;
pub mod relay;
pub mod subscriber;

#[cfg(test)]
pub(crate) mod test_support;

pub use codec::{Envelope, FrameAssembler};
pub use context::{RelayContext, StopFlag};
pub use pusher::Pusher;
pub use relay::{Publisher, RelayAddrs, RelayStats};
pub use subscriber::{Subscriber, SubscriberStats};
