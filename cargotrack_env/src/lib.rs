//! CargoTrack Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the live-sync
//! engines to run in both **Production** (tokio) and **Simulation**
//! (virtual clock) environments.
//!
//! # Core Concept: The Reactor Pattern
//!
//! Every source of non-determinism is intercepted:
//! - Time (`now()`, `sleep()`)
//! - The push channel (`connect()`, `recv()`, subscribe messages)
//! - The REST polling endpoints
//!
//! A reconnect storm or a late poll is therefore reproducible by seed.
//!
//! # Example
//!
//! ```ignore
//! use cargotrack_env::{TrackingContext, PushChannel, ChannelFrame};
//!
//! async fn pump<Ctx: TrackingContext, Ch: PushChannel>(ctx: &Ctx, channel: &Ch) {
//!     while let Some(frame) = channel.recv().await {
//!         match frame {
//!             ChannelFrame::Dropped { reason } => reconnect(reason),
//!             payload => handle(payload, ctx.now_millis()),
//!         }
//!     }
//! }
//! ```

mod channel;
mod context;
mod error;
mod service;
mod tokio_impl;
mod types;

pub use channel::{ChannelController, PushChannel};
pub use context::TrackingContext;
pub use error::EnvError;
pub use service::TrackingService;
pub use tokio_impl::TokioContext;
pub use types::{ChannelFrame, EntityId, SessionId, ViewerIdentity, ViewerRole};
