//! # mediawire-runtime
//!
//! Channel dispatcher on top of `mediawire-transport`.
//!
//! A [`TransportContext`] owns the control, video and audio channels. Each
//! channel runs outgoing frames through its configured stages (drop gate,
//! fragmenter, packer) into a [`TransportSink`], and runs incoming bytes
//! back through unpacker and reassembly to the registered callbacks.
//! Channel lifecycle changes are delivered on a dedicated thread.
//!
//! ## Crate structure
//!
//! - [`context`] — `TransportContext` and its builder
//! - [`channel`] — Channel identity, state and pipeline stages
//! - [`events`] — Lifecycle events and their dispatcher thread
//! - [`transport`] — Traits the underlying transport implements
//! - [`config`] — TOML configuration
//! - [`loopback`] — In-process transport for demos and tests
//! - [`error`] — `TransferError`

pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod loopback;
pub mod transport;

pub use channel::{ChannelKind, ChannelState, ChannelStats, CodecInfo, OutgoingFrame, SendOutcome};
pub use config::ContextConfig;
pub use context::{ContextStats, TransportContext, TransportContextBuilder};
pub use error::TransferError;
pub use events::{EventCode, LifecycleEvent, LifecycleNotifier};
pub use transport::{OccupancyProbe, TransportDriver, TransportSink};
