//! Serial multiplexer: routes frames between the shared transport and the
//! associated endpoints living on it.
//!
//! Each raw pipe is pumped by exactly one task, so endpoint state (pending
//! calls, control channels) needs no per-message locking. Public handles
//! marshal work onto that task through an unbounded command channel; that
//! hop is the only suspension point.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::control::{ControlChannel, ControlDisposition, ControlFault};
use crate::endpoint::{AssociatedEndpoint, EndpointShared};
use crate::pending::{CallError, PendingCalls, Responder};
use crate::watch::{SignalsState, WatchCallback, WatchRegistry, WatchResult, Watcher};
use crate::wire::{InterfaceId, Message, MessageCodec, MessageKind};

/// Why a pipe left the Active state. Terminal; a closed pipe never reopens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CloseReason {
    #[error("peer disconnected")]
    PeerDisconnected,

    #[error("malformed inbound frame")]
    MalformedFrame,

    #[error("peer requires an unsupported interface version")]
    VersionTooLow,

    #[error("local shutdown")]
    LocalShutdown,
}

/// Work marshalled onto the pipe's serial task.
pub(crate) enum PipeCommand {
    Send {
        message: Message,
    },
    SendWithResponse {
        message: Message,
        responder: Responder,
    },
    CreateEndpoint {
        interface_id: InterfaceId,
        max_version: u32,
        shared: Arc<EndpointShared>,
        incoming: mpsc::UnboundedSender<Message>,
    },
    CloseEndpoint {
        interface_id: InterfaceId,
    },
}

/// Verdict for one inbound frame.
#[derive(Debug)]
pub(crate) enum FrameOutcome {
    Continue,
    Reply(Message),
    Close(CloseReason),
}

struct EndpointEntry {
    control: ControlChannel,
    pending: PendingCalls,
    incoming: mpsc::UnboundedSender<Message>,
    shared: Arc<EndpointShared>,
}

/// IO-free multiplexer core. Driven by `Bootstrap::flush` while the pipe is
/// still queueing, then owned by the serial event loop once Active.
pub(crate) struct Multiplexer {
    endpoints: HashMap<InterfaceId, EndpointEntry>,
    watchers: Arc<WatchRegistry>,
    pipe_closed: Arc<AtomicBool>,
    open: bool,
}

impl Multiplexer {
    pub fn new(watchers: Arc<WatchRegistry>, pipe_closed: Arc<AtomicBool>) -> Self {
        Self {
            endpoints: HashMap::new(),
            watchers,
            pipe_closed,
            open: true,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Apply one marshalled command, returning the frame to transmit, if any.
    pub fn handle_command(&mut self, command: PipeCommand) -> Option<Message> {
        if !self.open {
            // Dropping a SendWithResponse responder resolves the caller's
            // continuation with Disconnected.
            return None;
        }
        match command {
            PipeCommand::Send { message } => Some(message),
            PipeCommand::SendWithResponse { message, responder } => {
                let Some(request_id) = message.kind.request_id() else {
                    debug_assert!(false, "SendWithResponse without a request id");
                    return None;
                };
                match self.endpoints.get_mut(&message.interface_id) {
                    Some(entry) => {
                        entry.pending.insert(request_id, responder);
                        Some(message)
                    }
                    None => {
                        let _ = responder.send(Err(CallError::EndpointClosed));
                        None
                    }
                }
            }
            PipeCommand::CreateEndpoint {
                interface_id,
                max_version,
                shared,
                incoming,
            } => {
                tracing::debug!(interface_id = %interface_id, max_version, "Installed endpoint");
                self.endpoints.insert(
                    interface_id,
                    EndpointEntry {
                        control: ControlChannel::new(max_version),
                        pending: PendingCalls::default(),
                        incoming,
                        shared,
                    },
                );
                None
            }
            PipeCommand::CloseEndpoint { interface_id } => {
                if let Some(mut entry) = self.endpoints.remove(&interface_id) {
                    entry.shared.closed.store(true, Ordering::Release);
                    if !entry.pending.is_empty() {
                        tracing::debug!(
                            interface_id = %interface_id,
                            outstanding = entry.pending.len(),
                            "Endpoint closed with outstanding calls"
                        );
                    }
                    entry.pending.fail_all(CallError::Disconnected);
                }
                None
            }
        }
    }

    /// Route one inbound frame: responses to the pending-call table, control
    /// classes to the endpoint's control channel, everything else to the
    /// application queue.
    pub fn handle_frame(&mut self, message: Message) -> FrameOutcome {
        let Some(entry) = self.endpoints.get_mut(&message.interface_id) else {
            tracing::warn!(
                interface_id = %message.interface_id,
                "Dropping frame for unknown interface"
            );
            return FrameOutcome::Continue;
        };

        if let MessageKind::Response(request_id) = message.kind {
            if !entry.pending.complete(request_id, message) {
                tracing::warn!(
                    request_id = %request_id,
                    "Response for a request that is no longer outstanding"
                );
            }
            return FrameOutcome::Continue;
        }

        if message.class.is_control() {
            return match entry.control.handle(&message) {
                ControlDisposition::Reply(reply) => FrameOutcome::Reply(reply),
                ControlDisposition::Ignore => FrameOutcome::Continue,
                ControlDisposition::ClosePipe(fault) => FrameOutcome::Close(match fault {
                    ControlFault::VersionTooLow { .. } => CloseReason::VersionTooLow,
                    ControlFault::Malformed => CloseReason::MalformedFrame,
                }),
            };
        }

        if entry.incoming.send(message).is_err() {
            tracing::trace!("Inbound receiver dropped; discarding application message");
        }
        FrameOutcome::Continue
    }

    /// Tear the pipe down: fail every outstanding call on every endpoint
    /// with `Disconnected`, mark all handles inert, and notify watchers.
    /// Idempotent.
    pub fn close(&mut self, reason: CloseReason) {
        if !self.open {
            return;
        }
        self.open = false;
        self.pipe_closed.store(true, Ordering::Release);
        tracing::debug!(reason = %reason, "Closing message pipe");
        for (_, mut entry) in self.endpoints.drain() {
            entry.shared.closed.store(true, Ordering::Release);
            entry.pending.fail_all(CallError::Disconnected);
        }
        self.watchers
            .notify_all(WatchResult::Ok, SignalsState::peer_closed());
    }
}

/// Cloneable handle to a multiplexed pipe: dynamic endpoint creation and
/// watch registration.
#[derive(Clone)]
pub struct Pipe {
    commands: mpsc::UnboundedSender<PipeCommand>,
    watchers: Arc<WatchRegistry>,
    next_interface_id: Arc<AtomicU32>,
    closed: Arc<AtomicBool>,
}

impl Pipe {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<PipeCommand>,
        watchers: Arc<WatchRegistry>,
        first_dynamic_id: u32,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            commands,
            watchers,
            next_interface_id: Arc::new(AtomicU32::new(first_dynamic_id)),
            closed,
        }
    }

    /// Create a new associated endpoint over this pipe. Interface ids come
    /// from this side's half of the id space, so no wire coordination is
    /// needed.
    pub fn create_endpoint(&self, max_version: u32) -> AssociatedEndpoint {
        // Each side allocates with stride 2 from a distinct parity.
        let interface_id = InterfaceId(self.next_interface_id.fetch_add(2, Ordering::Relaxed));
        self.create_endpoint_at(interface_id, max_version)
    }

    pub(crate) fn create_endpoint_at(
        &self,
        interface_id: InterfaceId,
        max_version: u32,
    ) -> AssociatedEndpoint {
        let shared = EndpointShared::new();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        // If the serial task is already gone the handle observes a closed
        // endpoint on first use.
        let _ = self.commands.send(PipeCommand::CreateEndpoint {
            interface_id,
            max_version,
            shared: Arc::clone(&shared),
            incoming: incoming_tx,
        });
        AssociatedEndpoint::new(interface_id, shared, self.commands.clone(), incoming_rx)
    }

    /// Register interest in this pipe's signal-state transitions.
    pub fn watch(
        &self,
        callback: impl Fn(WatchResult, SignalsState) + Send + Sync + 'static,
    ) -> Arc<Watcher> {
        self.register_watch(Box::new(callback))
    }

    pub(crate) fn register_watch(&self, callback: WatchCallback) -> Arc<Watcher> {
        self.watchers.register(callback)
    }

    pub fn cancel_watch(&self, watcher: &Arc<Watcher>) {
        self.watchers.cancel(watcher);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// The serial event loop for one pipe. Drains every command queued before
/// Start in FIFO order, then pumps sends and receives until the pipe closes
/// or every handle is dropped.
pub(crate) async fn run_pipe_loop<T>(
    transport: T,
    mut mux: Multiplexer,
    mut commands: mpsc::UnboundedReceiver<PipeCommand>,
) where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(transport);
    let mut reader = FramedRead::new(read_half, MessageCodec);
    let mut writer = FramedWrite::new(write_half, MessageCodec);

    // Messages enqueued between Connect and Start go out first, in order.
    while let Ok(command) = commands.try_recv() {
        if let Some(frame) = mux.handle_command(command) {
            if let Err(error) = writer.send(frame).await {
                tracing::debug!(error = %error, "Write failed while flushing queue");
                mux.close(CloseReason::PeerDisconnected);
                return;
            }
        }
    }

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => {
                    if let Some(frame) = mux.handle_command(command) {
                        if let Err(error) = writer.send(frame).await {
                            tracing::debug!(error = %error, "Write failed; closing pipe");
                            mux.close(CloseReason::PeerDisconnected);
                            break;
                        }
                    }
                }
                // Every handle is gone; nothing can use this pipe again.
                None => {
                    mux.close(CloseReason::LocalShutdown);
                    break;
                }
            },
            frame = reader.next() => match frame {
                Some(Ok(message)) => match mux.handle_frame(message) {
                    FrameOutcome::Continue => {}
                    FrameOutcome::Reply(reply) => {
                        if let Err(error) = writer.send(reply).await {
                            tracing::debug!(error = %error, "Reply write failed; closing pipe");
                            mux.close(CloseReason::PeerDisconnected);
                            break;
                        }
                    }
                    FrameOutcome::Close(reason) => {
                        mux.close(reason);
                        break;
                    }
                },
                Some(Err(error)) => {
                    // A framing error poisons the stream; no resync possible.
                    tracing::error!(error = %error, "Malformed inbound frame; closing pipe");
                    mux.close(CloseReason::MalformedFrame);
                    break;
                }
                None => {
                    tracing::debug!("Peer disconnected");
                    mux.close(CloseReason::PeerDisconnected);
                    break;
                }
            },
        }
    }
}
