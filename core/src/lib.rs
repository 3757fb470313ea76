//! Bridge between durably queued agent-session webhook events and an
//! external engine collaborator.
//!
//! The pipeline: [`queue::PgEventQueue`] claims gateway rows with exclusive
//! semantics, [`normalize`] folds the heterogeneous webhook envelopes into
//! [`event::CanonicalEvent`]s, [`dispatch::DispatchLoop`] routes them through
//! per-session state in [`session`], and [`orchestrator::RunOrchestrator`]
//! drives engine runs while posting activities through the rate-limited
//! [`client::ApiClient`].

pub mod client;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event;
pub mod limiter;
pub mod normalize;
pub mod orchestrator;
pub mod queue;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use client::ApiClient;
pub use client::ApiError;
pub use client::RemoteApi;
pub use config::BridgeConfig;
pub use config::ConfigError;
pub use dispatch::DispatchLoop;
pub use engine::EngineRouter;
pub use engine::EngineRunner;
pub use engine::EngineUnavailableError;
pub use engine::ResumeToken;
pub use error::EventError;
pub use event::CanonicalEvent;
pub use event::EventKind;
pub use event::GatewayEvent;
pub use limiter::RateLimiter;
pub use orchestrator::RunOrchestrator;
pub use queue::EventQueue;
pub use queue::PgEventQueue;
pub use queue::QueueError;
pub use session::SessionRegistry;
pub use session::SessionState;
