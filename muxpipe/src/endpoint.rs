//! Associated endpoint: one logical interface multiplexed over a shared pipe.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};
use tokio_util::bytes::Bytes;

use crate::control;
use crate::mux::PipeCommand;
use crate::pending::{CallError, CallResult};
use crate::wire::{HandleRef, InterfaceId, Message, MessageClass, RESERVED_CLASS_COUNT, RequestId};

/// Synchronous failure of a fire-and-forget send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The endpoint's pipe already disconnected; the message was not sent.
    #[error("endpoint closed")]
    EndpointClosed,
}

/// State shared between an endpoint handle and the pipe's serial task.
pub(crate) struct EndpointShared {
    pub(crate) closed: AtomicBool,
    version: AtomicU32,
    next_request_id: AtomicU64,
}

impl EndpointShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            closed: AtomicBool::new(false),
            version: AtomicU32::new(0),
            next_request_id: AtomicU64::new(1),
        })
    }

    fn allocate_request_id(&self) -> RequestId {
        RequestId(self.next_request_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// An in-flight two-way call. Resolves when the matching response arrives or
/// the call fails (`Disconnected` on pipe closure or endpoint destruction).
pub struct PendingCall {
    request_id: RequestId,
    receiver: oneshot::Receiver<CallResult>,
}

impl PendingCall {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub async fn response(self) -> CallResult {
        match self.receiver.await {
            Ok(result) => result,
            // The serial task dropped the continuation without completing it;
            // the pipe went away underneath the call.
            Err(_) => Err(CallError::Disconnected),
        }
    }
}

/// Owned handle to one multiplexed interface.
///
/// Public entry points may be called from any thread; each marshals onto the
/// pipe's serial task, which owns the endpoint's pending-call table and
/// control channel. Dropping the handle closes the endpoint, failing any
/// outstanding calls.
pub struct AssociatedEndpoint {
    interface_id: InterfaceId,
    shared: Arc<EndpointShared>,
    commands: mpsc::UnboundedSender<PipeCommand>,
    incoming: Option<mpsc::UnboundedReceiver<Message>>,
}

impl AssociatedEndpoint {
    pub(crate) fn new(
        interface_id: InterfaceId,
        shared: Arc<EndpointShared>,
        commands: mpsc::UnboundedSender<PipeCommand>,
        incoming: mpsc::UnboundedReceiver<Message>,
    ) -> Self {
        Self {
            interface_id,
            shared,
            commands,
            incoming: Some(incoming),
        }
    }

    pub fn interface_id(&self) -> InterfaceId {
        self.interface_id
    }

    /// The currently negotiated interface version; 0 until a version query
    /// or assertion has run.
    pub fn version(&self) -> u32 {
        self.shared.version.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Take the stream of inbound application messages for this interface.
    /// Returns `None` on the second call.
    pub fn take_incoming(&mut self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.incoming.take()
    }

    /// Send a fire-and-forget application message.
    pub fn send(&self, class: MessageClass, payload: Bytes) -> Result<(), SendError> {
        self.send_with_handles(class, payload, Vec::new())
    }

    pub fn send_with_handles(
        &self,
        class: MessageClass,
        payload: Bytes,
        handles: Vec<HandleRef>,
    ) -> Result<(), SendError> {
        assert_application_class(class);
        let message = Message::one_way(self.interface_id, class, payload).with_handles(handles);
        self.dispatch(PipeCommand::Send { message })
    }

    /// Send a two-way application message; the returned [`PendingCall`]
    /// resolves with the peer's response. The request id is unique among
    /// this endpoint's outstanding calls.
    pub fn send_with_response(
        &self,
        class: MessageClass,
        payload: Bytes,
    ) -> Result<PendingCall, SendError> {
        assert_application_class(class);
        let request_id = self.shared.allocate_request_id();
        let (responder, receiver) = oneshot::channel();
        let message = Message::request(self.interface_id, class, request_id, payload);
        self.dispatch(PipeCommand::SendWithResponse { message, responder })?;
        Ok(PendingCall {
            request_id,
            receiver,
        })
    }

    /// Ask the peer for its maximum supported version of this interface and
    /// record the answer as the negotiated version.
    pub async fn query_version(&self) -> Result<u32, CallError> {
        let request_id = self.shared.allocate_request_id();
        let (responder, receiver) = oneshot::channel();
        let message = control::query_version_request(self.interface_id, request_id);
        self.dispatch(PipeCommand::SendWithResponse { message, responder })
            .map_err(|SendError::EndpointClosed| CallError::EndpointClosed)?;

        let response = match receiver.await {
            Ok(result) => result?,
            Err(_) => return Err(CallError::Disconnected),
        };
        let version = control::version_from_response(&response);
        self.shared.version.store(version, Ordering::Release);
        tracing::debug!(
            interface_id = %self.interface_id,
            version,
            "Negotiated interface version"
        );
        Ok(version)
    }

    /// Assert that the peer implements at least `version`, without a round
    /// trip. A peer that cannot honor the assertion closes its end of the
    /// pipe; a capable peer treats it as a no-op.
    pub fn require_version(&self, version: u32) -> Result<(), SendError> {
        let message = control::require_version_message(self.interface_id, version);
        self.dispatch(PipeCommand::Send { message })?;
        // The peer either complies or disconnects, so the assertion becomes
        // the negotiated version locally.
        self.shared.version.store(version, Ordering::Release);
        Ok(())
    }

    fn dispatch(&self, command: PipeCommand) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::EndpointClosed);
        }
        self.commands
            .send(command)
            .map_err(|_| SendError::EndpointClosed)
    }
}

impl Drop for AssociatedEndpoint {
    fn drop(&mut self) {
        // Detach from the multiplexer; outstanding calls fail over there.
        let _ = self.commands.send(PipeCommand::CloseEndpoint {
            interface_id: self.interface_id,
        });
    }
}

fn assert_application_class(class: MessageClass) {
    assert!(
        class.raw() >= RESERVED_CLASS_COUNT,
        "application sends must use a message class outside the reserved control range"
    );
}
