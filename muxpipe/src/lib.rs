//! muxpipe: a transport-agnostic message-pipe RPC core.
//!
//! A single raw byte pipe (`AsyncRead + AsyncWrite`) carries many logical
//! interfaces at once. [`Bootstrap`] brings the transport up through
//! Connect/Start/Flush and hands out [`AssociatedEndpoint`] handles; each
//! endpoint sends framed messages, tracks two-way calls, and negotiates its
//! interface version over a reserved control channel. Pipe-level events fan
//! out to registered watchers, whose callbacks are deferred through a
//! thread-local [`RequestContext`] so they never run under internal locks.

mod bootstrap;
mod endpoint;
mod mux;
mod pending;
mod request_context;
mod watch;

pub mod control;
pub mod wire;

pub use bootstrap::{Bootstrap, BootstrapState, Delegate, Mode};
pub use endpoint::{AssociatedEndpoint, PendingCall, SendError};
pub use mux::{CloseReason, Pipe};
pub use pending::{CallError, CallResult};
pub use request_context::RequestContext;
pub use watch::{SignalsState, WatchCallback, WatchRegistry, WatchResult, Watcher};
