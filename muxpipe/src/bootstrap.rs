//! Pipe bootstrap: brings a raw byte transport up to a live multiplexed
//! pipe with its first endpoint pair.
//!
//! Both sides derive the primary interface ids from their [`Mode`], so the
//! handshake needs no wire exchange: `connect` hands the delegate its
//! endpoints immediately, and anything sent on them queues until `start`
//! spawns the serial event loop (or `flush` pushes the queue out early).

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::Encoder;

use crate::endpoint::AssociatedEndpoint;
use crate::mux::{CloseReason, Multiplexer, Pipe, PipeCommand, run_pipe_loop};
use crate::watch::WatchRegistry;
use crate::wire::{CodecError, InterfaceId, MessageCodec};

/// Which side of the transport this bootstrap is. The two sides must use
/// opposite modes; everything else is symmetric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Initiator,
    Acceptor,
}

impl Mode {
    /// Primary (outbound, inbound) interface ids for this side. The
    /// initiator's outbound is the acceptor's inbound and vice versa.
    fn primary_ids(self) -> (InterfaceId, InterfaceId) {
        match self {
            Mode::Initiator => (InterfaceId(1), InterfaceId(2)),
            Mode::Acceptor => (InterfaceId(2), InterfaceId(1)),
        }
    }

    /// First dynamically allocated interface id. The initiator takes the odd
    /// half of the id space and the acceptor the even half, so the two sides
    /// never collide without coordinating.
    fn first_dynamic_id(self) -> u32 {
        match self {
            Mode::Initiator => 3,
            Mode::Acceptor => 4,
        }
    }
}

/// Receives the primary endpoint pair once the handshake completes.
/// Called exactly once, synchronously from [`Bootstrap::connect`]; must not
/// block.
pub trait Delegate: Send {
    fn on_endpoints_available(
        &mut self,
        outbound: AssociatedEndpoint,
        inbound: AssociatedEndpoint,
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Created,
    Connecting,
    Active,
    Closed,
}

/// One side of a bootstrapping message pipe over transport `T`.
pub struct Bootstrap<T> {
    mode: Mode,
    max_version: u32,
    state: BootstrapState,
    delegate: Box<dyn Delegate>,
    // Present until start() hands them to the serial event loop.
    transport: Option<T>,
    mux: Option<Multiplexer>,
    commands: Option<mpsc::UnboundedReceiver<PipeCommand>>,
    pipe: Pipe,
}

impl<T> Bootstrap<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(transport: T, mode: Mode, max_version: u32, delegate: Box<dyn Delegate>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let watchers = Arc::new(WatchRegistry::new());
        let closed = Arc::new(AtomicBool::new(false));
        let mux = Multiplexer::new(Arc::clone(&watchers), Arc::clone(&closed));
        let pipe = Pipe::new(commands_tx, watchers, mode.first_dynamic_id(), closed);
        Self {
            mode,
            max_version,
            state: BootstrapState::Created,
            delegate,
            transport: Some(transport),
            mux: Some(mux),
            commands: Some(commands_rx),
            pipe,
        }
    }

    pub fn state(&self) -> BootstrapState {
        // The event loop owns closure once Active; reflect it here.
        if self.state == BootstrapState::Active && self.pipe.is_closed() {
            return BootstrapState::Closed;
        }
        self.state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Handle for dynamic endpoint creation and watch registration. Valid in
    /// every state; usable once `connect` has run.
    pub fn pipe(&self) -> Pipe {
        self.pipe.clone()
    }

    /// Create the primary endpoint pair and hand it to the delegate.
    ///
    /// Panics when called in any state but Created; calling out of order is
    /// a programming error, not a runtime condition.
    pub fn connect(&mut self) {
        assert_eq!(
            self.state,
            BootstrapState::Created,
            "connect is only legal in the Created state"
        );
        let (outbound_id, inbound_id) = self.mode.primary_ids();
        let outbound = self.pipe.create_endpoint_at(outbound_id, self.max_version);
        let inbound = self.pipe.create_endpoint_at(inbound_id, self.max_version);
        tracing::debug!(
            mode = ?self.mode,
            outbound = %outbound_id,
            inbound = %inbound_id,
            "Message pipe connected"
        );
        self.delegate.on_endpoints_available(outbound, inbound);
        self.state = BootstrapState::Connecting;
    }

    /// Spawn the serial event loop. Everything queued since `connect` goes
    /// out first, in send order.
    ///
    /// Panics when called in any state but Connecting.
    pub fn start(&mut self) {
        assert_eq!(
            self.state,
            BootstrapState::Connecting,
            "start is only legal in the Connecting state"
        );
        let transport = self.transport.take();
        let mux = self.mux.take();
        let commands = self.commands.take();
        let (Some(transport), Some(mux), Some(commands)) = (transport, mux, commands) else {
            unreachable!("pipe internals taken before start");
        };
        tokio::spawn(run_pipe_loop(transport, mux, commands));
        self.state = BootstrapState::Active;
        tracing::debug!(mode = ?self.mode, "Message pipe active");
    }

    /// Transmit everything queued so far without leaving Connecting, so a
    /// directive like a version assertion reaches the peer before `start`.
    /// A no-op in every other state (once Active the event loop is already
    /// pumping).
    pub async fn flush(&mut self) -> Result<(), CodecError> {
        if self.state != BootstrapState::Connecting {
            return Ok(());
        }
        let (Some(mux), Some(commands), Some(transport)) = (
            self.mux.as_mut(),
            self.commands.as_mut(),
            self.transport.as_mut(),
        ) else {
            unreachable!("pipe internals taken while Connecting");
        };

        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        while let Ok(command) = commands.try_recv() {
            if let Some(frame) = mux.handle_command(command) {
                codec.encode(frame, &mut buf)?;
            }
        }
        if buf.is_empty() {
            return Ok(());
        }
        let result = async {
            transport.write_all(&buf).await?;
            transport.flush().await
        }
        .await;
        if let Err(error) = result {
            tracing::debug!(error = %error, "Transport write failed during flush");
            mux.close(CloseReason::PeerDisconnected);
            self.state = BootstrapState::Closed;
            return Err(CodecError::Io(error));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::SendError;
    use crate::pending::CallError;
    use crate::watch::WatchResult;
    use crate::wire::MessageClass;
    use tokio::io::{AsyncReadExt, DuplexStream, duplex};
    use tokio_util::bytes::Bytes;
    use tokio_util::codec::Decoder;

    struct Capture(mpsc::UnboundedSender<(AssociatedEndpoint, AssociatedEndpoint)>);

    impl Delegate for Capture {
        fn on_endpoints_available(
            &mut self,
            outbound: AssociatedEndpoint,
            inbound: AssociatedEndpoint,
        ) {
            let _ = self.0.send((outbound, inbound));
        }
    }

    fn bootstrap(
        transport: DuplexStream,
        mode: Mode,
        max_version: u32,
    ) -> (
        Bootstrap<DuplexStream>,
        mpsc::UnboundedReceiver<(AssociatedEndpoint, AssociatedEndpoint)>,
    ) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Bootstrap::new(transport, mode, max_version, Box::new(Capture(tx))),
            rx,
        )
    }

    type Endpoints = (AssociatedEndpoint, AssociatedEndpoint);

    async fn started_pair(
        initiator_max: u32,
        acceptor_max: u32,
    ) -> (
        Endpoints,
        Endpoints,
        Bootstrap<DuplexStream>,
        Bootstrap<DuplexStream>,
    ) {
        let (left, right) = duplex(4096);
        let (mut initiator, mut initiator_rx) = bootstrap(left, Mode::Initiator, initiator_max);
        let (mut acceptor, mut acceptor_rx) = bootstrap(right, Mode::Acceptor, acceptor_max);
        initiator.connect();
        acceptor.connect();
        initiator.start();
        acceptor.start();
        let initiator_endpoints = initiator_rx.recv().await.unwrap();
        let acceptor_endpoints = acceptor_rx.recv().await.unwrap();
        (initiator_endpoints, acceptor_endpoints, initiator, acceptor)
    }

    #[tokio::test]
    async fn query_version_returns_peer_max() {
        let ((outbound, _inbound), acceptor_endpoints, initiator, _acceptor) =
            started_pair(1, 3).await;
        assert_eq!(initiator.state(), BootstrapState::Active);

        assert_eq!(outbound.query_version().await, Ok(3));
        assert_eq!(outbound.version(), 3);
        drop(acceptor_endpoints);
    }

    #[tokio::test]
    async fn require_version_within_peer_max_keeps_the_pipe_alive() {
        let ((outbound, _inbound), acceptor_endpoints, _initiator, _acceptor) =
            started_pair(1, 2).await;

        outbound.require_version(1).unwrap();
        assert_eq!(outbound.version(), 1);
        // The directive was a no-op on the peer; the pipe still answers.
        assert_eq!(outbound.query_version().await, Ok(2));
        assert_eq!(outbound.version(), 2);
        drop(acceptor_endpoints);
    }

    #[tokio::test]
    async fn require_version_above_peer_max_disconnects() {
        let ((outbound, _inbound), acceptor_endpoints, _initiator, _acceptor) =
            started_pair(1, 2).await;

        outbound.require_version(5).unwrap();
        // The peer closes its end; the next call observes the disconnect
        // either in flight or before dispatch.
        assert!(outbound.query_version().await.is_err());
        drop(acceptor_endpoints);
    }

    #[tokio::test]
    async fn messages_queued_before_start_arrive_in_order() {
        let (left, right) = duplex(4096);
        let (mut initiator, mut initiator_rx) = bootstrap(left, Mode::Initiator, 1);
        let (mut acceptor, mut acceptor_rx) = bootstrap(right, Mode::Acceptor, 1);

        initiator.connect();
        let (outbound, _inbound) = initiator_rx.recv().await.unwrap();
        for payload in [&b"one"[..], b"two", b"three"] {
            outbound
                .send(MessageClass::Application(2), Bytes::copy_from_slice(payload))
                .unwrap();
        }

        acceptor.connect();
        acceptor.start();
        let (_acceptor_outbound, mut acceptor_inbound) = acceptor_rx.recv().await.unwrap();
        let mut incoming = acceptor_inbound.take_incoming().unwrap();

        initiator.start();
        for expected in [&b"one"[..], b"two", b"three"] {
            let message = incoming.recv().await.unwrap();
            assert_eq!(&message.payload[..], expected);
        }
    }

    #[tokio::test]
    async fn flush_transmits_queued_directives_while_connecting() {
        let (left, mut right) = duplex(4096);
        let (mut initiator, mut initiator_rx) = bootstrap(left, Mode::Initiator, 1);
        initiator.connect();
        let (outbound, _inbound) = initiator_rx.recv().await.unwrap();

        outbound.require_version(1).unwrap();
        initiator.flush().await.unwrap();
        assert_eq!(initiator.state(), BootstrapState::Connecting);

        // The directive is on the wire before start() ever runs.
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        let message = loop {
            if let Some(message) = codec.decode(&mut buf).unwrap() {
                break message;
            }
            right.read_buf(&mut buf).await.unwrap();
        };
        assert_eq!(message.interface_id, InterfaceId(1));
        assert_eq!(message.class, MessageClass::RunOrClosePipe);
    }

    #[tokio::test]
    async fn dropping_an_endpoint_fails_its_outstanding_calls() {
        let ((outbound, _inbound), acceptor_endpoints, _initiator, _acceptor) =
            started_pair(1, 1).await;

        // The peer routes these to its application queue and never replies.
        let first = outbound
            .send_with_response(MessageClass::Application(2), Bytes::new())
            .unwrap();
        let second = outbound
            .send_with_response(MessageClass::Application(2), Bytes::new())
            .unwrap();
        drop(outbound);

        assert_eq!(first.response().await, Err(CallError::Disconnected));
        assert_eq!(second.response().await, Err(CallError::Disconnected));
        drop(acceptor_endpoints);
    }

    #[tokio::test]
    async fn peer_disconnect_notifies_watchers_and_closes_endpoints() {
        let (left, right) = duplex(64);
        let (mut initiator, mut initiator_rx) = bootstrap(left, Mode::Initiator, 1);
        initiator.connect();
        let (outbound, _inbound) = initiator_rx.recv().await.unwrap();

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let pipe = initiator.pipe();
        let _watcher = pipe.watch(move |result, state| {
            let _ = event_tx.send((result, state));
        });

        initiator.start();
        drop(right);

        let (result, state) = event_rx.recv().await.unwrap();
        assert_eq!(result, WatchResult::Ok);
        assert!(state.peer_closed);
        assert!(pipe.is_closed());
        assert_eq!(initiator.state(), BootstrapState::Closed);
        assert_eq!(
            outbound.send(MessageClass::Application(2), Bytes::new()),
            Err(SendError::EndpointClosed)
        );
    }

    #[tokio::test]
    async fn dynamic_endpoints_carry_traffic_both_ways() {
        let (initiator_endpoints, acceptor_endpoints, initiator, acceptor) =
            started_pair(1, 1).await;

        // Initiator allocates from the odd half, acceptor from the even half.
        let from_initiator = initiator.pipe().create_endpoint(1);
        let mut on_acceptor = acceptor.pipe().create_endpoint_at(from_initiator.interface_id(), 1);
        assert_eq!(from_initiator.interface_id(), InterfaceId(3));

        let mut incoming = on_acceptor.take_incoming().unwrap();
        from_initiator
            .send(MessageClass::Application(7), Bytes::from_static(b"ping"))
            .unwrap();
        let message = incoming.recv().await.unwrap();
        assert_eq!(message.class, MessageClass::Application(7));
        assert_eq!(&message.payload[..], b"ping");
        drop(initiator_endpoints);
        drop(acceptor_endpoints);
    }

    #[test]
    #[should_panic(expected = "start is only legal in the Connecting state")]
    fn start_before_connect_panics() {
        let (left, _right) = duplex(64);
        let (mut initiator, _rx) = bootstrap(left, Mode::Initiator, 1);
        initiator.start();
    }

    #[test]
    #[should_panic(expected = "connect is only legal in the Created state")]
    fn connect_twice_panics() {
        let (left, _right) = duplex(64);
        let (mut initiator, _rx) = bootstrap(left, Mode::Initiator, 1);
        initiator.connect();
        initiator.connect();
    }
}
