//! Interface control sub-protocol: version query and enforcement.
//!
//! Control messages ride the reserved message classes (`Run`,
//! `RunOrClosePipe`) with serde-tagged payloads. `QueryVersion` is a two-way
//! informational call; `RequireVersion` is a one-way directive that costs no
//! round trip when the caller only needs to assert a minimum.

use serde::{Deserialize, Serialize};
use tokio_util::bytes::Bytes;

use crate::wire::{InterfaceId, Message, MessageClass, MessageKind, RequestId};

/// Input of a two-way `Run` control call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunInput {
    QueryVersion,
}

/// Output of a two-way `Run` control call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunOutput {
    QueryVersionResult { version: u32 },
}

/// Response envelope for `Run`. `output` is absent when the receiver did not
/// recognize the input; a `Run` call is always answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResponseParams {
    pub output: Option<RunOutput>,
}

/// Input of a one-way `RunOrClosePipe` directive. A receiver that cannot
/// honor it must close its end of the pipe without responding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunOrClosePipeInput {
    RequireVersion { version: u32 },
}

/// Why the receiver side decided the pipe must close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ControlFault {
    #[error("peer requires interface version {required} but at most {supported} is supported")]
    VersionTooLow { required: u32, supported: u32 },

    #[error("undecodable control message payload")]
    Malformed,
}

/// Receiver-side verdict for one inbound control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ControlDisposition {
    Reply(Message),
    Ignore,
    ClosePipe(ControlFault),
}

fn control_payload<T: Serialize>(value: &T) -> Bytes {
    let bytes = serde_json::to_vec(value).expect("control payloads always serialize");
    Bytes::from(bytes)
}

pub(crate) fn query_version_request(interface_id: InterfaceId, request_id: RequestId) -> Message {
    Message::request(
        interface_id,
        MessageClass::Run,
        request_id,
        control_payload(&RunInput::QueryVersion),
    )
}

pub(crate) fn require_version_message(interface_id: InterfaceId, version: u32) -> Message {
    Message::one_way(
        interface_id,
        MessageClass::RunOrClosePipe,
        control_payload(&RunOrClosePipeInput::RequireVersion { version }),
    )
}

/// Extract the peer's version from a `Run` response. Absent or unrecognized
/// output reads as version 0.
pub(crate) fn version_from_response(message: &Message) -> u32 {
    serde_json::from_slice::<RunResponseParams>(&message.payload)
        .ok()
        .and_then(|params| params.output)
        .map(|RunOutput::QueryVersionResult { version }| version)
        .unwrap_or(0)
}

/// Receiver side of the control sub-protocol for one endpoint.
#[derive(Debug)]
pub(crate) struct ControlChannel {
    max_version: u32,
}

impl ControlChannel {
    pub fn new(max_version: u32) -> Self {
        Self { max_version }
    }

    pub fn handle(&self, message: &Message) -> ControlDisposition {
        match (message.class, message.kind) {
            (MessageClass::Run, MessageKind::Request(request_id)) => {
                let output = match serde_json::from_slice::<RunInput>(&message.payload) {
                    Ok(RunInput::QueryVersion) => Some(RunOutput::QueryVersionResult {
                        version: self.max_version,
                    }),
                    // Unknown input still gets an answer, with empty output.
                    Err(_) => None,
                };
                let params = RunResponseParams { output };
                ControlDisposition::Reply(Message::response(
                    message.interface_id,
                    MessageClass::Run,
                    request_id,
                    control_payload(&params),
                ))
            }
            (MessageClass::RunOrClosePipe, MessageKind::OneWay) => {
                match serde_json::from_slice::<RunOrClosePipeInput>(&message.payload) {
                    Ok(RunOrClosePipeInput::RequireVersion { version }) => {
                        if version > self.max_version {
                            let fault = ControlFault::VersionTooLow {
                                required: version,
                                supported: self.max_version,
                            };
                            tracing::error!(
                                interface_id = %message.interface_id,
                                required = version,
                                supported = self.max_version,
                                "Peer requires unsupported interface version; closing pipe"
                            );
                            ControlDisposition::ClosePipe(fault)
                        } else {
                            ControlDisposition::Ignore
                        }
                    }
                    Err(error) => {
                        tracing::error!(
                            interface_id = %message.interface_id,
                            error = %error,
                            "Undecodable RunOrClosePipe input; closing pipe"
                        );
                        ControlDisposition::ClosePipe(ControlFault::Malformed)
                    }
                }
            }
            (class, kind) => {
                tracing::error!(
                    interface_id = %message.interface_id,
                    class = class.raw(),
                    ?kind,
                    "Control message with invalid shape; closing pipe"
                );
                ControlDisposition::ClosePipe(ControlFault::Malformed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_version_input_serializes() {
        insta::assert_json_snapshot!(RunInput::QueryVersion, @r#"
        {
          "type": "query_version"
        }
        "#);
    }

    #[test]
    fn query_version_result_serializes() {
        insta::assert_json_snapshot!(
            RunOutput::QueryVersionResult { version: 3 },
            @r#"
        {
          "type": "query_version_result",
          "version": 3
        }
        "#
        );
    }

    #[test]
    fn require_version_input_serializes() {
        insta::assert_json_snapshot!(
            RunOrClosePipeInput::RequireVersion { version: 5 },
            @r#"
        {
          "type": "require_version",
          "version": 5
        }
        "#
        );
    }

    #[test]
    fn run_response_without_output_serializes() {
        insta::assert_json_snapshot!(RunResponseParams { output: None }, @r#"
        {
          "output": null
        }
        "#);
    }

    #[test]
    fn query_version_request_is_answered_with_max_version() {
        let channel = ControlChannel::new(3);
        let request = query_version_request(InterfaceId(1), RequestId(7));

        let ControlDisposition::Reply(reply) = channel.handle(&request) else {
            panic!("expected a reply");
        };
        assert_eq!(reply.class, MessageClass::Run);
        assert_eq!(reply.kind, MessageKind::Response(RequestId(7)));
        assert_eq!(version_from_response(&reply), 3);
    }

    #[test]
    fn unknown_run_input_is_still_answered() {
        let channel = ControlChannel::new(2);
        let request = Message::request(
            InterfaceId(1),
            MessageClass::Run,
            RequestId(9),
            Bytes::from_static(br#"{"type":"frobnicate"}"#),
        );

        let ControlDisposition::Reply(reply) = channel.handle(&request) else {
            panic!("expected a reply");
        };
        assert_eq!(version_from_response(&reply), 0);
        let params: RunResponseParams = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(params.output, None);
    }

    #[test]
    fn require_version_within_max_is_a_noop() {
        let channel = ControlChannel::new(2);
        let low = require_version_message(InterfaceId(1), 1);
        let exact = require_version_message(InterfaceId(1), 2);
        assert_eq!(channel.handle(&low), ControlDisposition::Ignore);
        assert_eq!(channel.handle(&exact), ControlDisposition::Ignore);
    }

    #[test]
    fn require_version_above_max_closes_pipe() {
        let channel = ControlChannel::new(2);
        let message = require_version_message(InterfaceId(1), 5);
        assert_eq!(
            channel.handle(&message),
            ControlDisposition::ClosePipe(ControlFault::VersionTooLow {
                required: 5,
                supported: 2,
            })
        );
    }

    #[test]
    fn garbage_run_or_close_pipe_payload_closes_pipe() {
        let channel = ControlChannel::new(2);
        let message = Message::one_way(
            InterfaceId(1),
            MessageClass::RunOrClosePipe,
            Bytes::from_static(b"not json"),
        );
        assert_eq!(
            channel.handle(&message),
            ControlDisposition::ClosePipe(ControlFault::Malformed)
        );
    }

    #[test]
    fn one_way_run_is_an_invalid_shape() {
        let channel = ControlChannel::new(2);
        let message = Message::one_way(
            InterfaceId(1),
            MessageClass::Run,
            control_payload(&RunInput::QueryVersion),
        );
        assert_eq!(
            channel.handle(&message),
            ControlDisposition::ClosePipe(ControlFault::Malformed)
        );
    }
}
