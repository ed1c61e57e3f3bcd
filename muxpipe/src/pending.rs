//! Pending-call table: request id to one-shot response continuation.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::wire::{Message, RequestId};

/// Failure delivered to a continuation instead of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// The peer closed the pipe before responding.
    #[error("peer disconnected before responding")]
    Disconnected,

    /// The endpoint was already closed when the call was attempted.
    #[error("endpoint closed")]
    EndpointClosed,
}

pub type CallResult = Result<Message, CallError>;

pub(crate) type Responder = oneshot::Sender<CallResult>;

/// Outstanding two-way calls for one endpoint. Lives on the pipe's serial
/// task, so no locking. Each continuation is consumed exactly once: by a
/// matching response, by pipe closure, or by endpoint destruction.
#[derive(Default)]
pub(crate) struct PendingCalls {
    calls: HashMap<RequestId, Responder>,
}

impl PendingCalls {
    pub fn insert(&mut self, request_id: RequestId, responder: Responder) {
        let previous = self.calls.insert(request_id, responder);
        debug_assert!(
            previous.is_none(),
            "request id {request_id} reused while still outstanding"
        );
    }

    /// Deliver `message` to the continuation registered under its request id.
    /// Returns false when no call is outstanding under that id.
    pub fn complete(&mut self, request_id: RequestId, message: Message) -> bool {
        match self.calls.remove(&request_id) {
            Some(responder) => {
                // The caller may have dropped its receiver; nothing to do.
                let _ = responder.send(Ok(message));
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding call with `error`, consuming each continuation
    /// exactly once.
    pub fn fail_all(&mut self, error: CallError) {
        for (_, responder) in self.calls.drain() {
            let _ = responder.send(Err(error));
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
