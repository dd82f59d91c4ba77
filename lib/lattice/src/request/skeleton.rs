//! The per-(request, connection) fiber behind both request shapes. Each RoC
//! walks connect → send opening → await status → handle, with the four
//! request policies deciding the edges. The same skeleton serves all-nodes
//! fan-out and single-node requests; fan-out accounting lives in the
//! request set.

use super::controller::Shared;
use super::{
    ConnectDecision, Connector, DisconnectedHandler, DisconnectDecision, Handler, HandlerStep,
    Initializer, RequestCode, RequestVersion,
};
use crate::fiber::{resume, EventDispatcher, FiberOutcome, RocFiber, Step};
use crate::parse::MessageParser;
use crate::shared::{GlobalStatus, Notification, RequestError};

/// Messages handled per resume before the fiber yields the CPU back.
const YIELD_MESSAGE_COUNT: u32 = 10;

enum Phase {
    Connect,
    SendOpening,
    AwaitStatus,
    Handle,
}

pub struct SkeletonRoc {
    code: RequestCode,
    version: RequestVersion,
    initializer: Box<dyn Initializer>,
    handler: Box<dyn Handler>,
    connector: Box<dyn Connector>,
    disconnected: Box<dyn DisconnectedHandler>,
    shared: Shared,
    phase: Phase,
}

impl SkeletonRoc {
    pub fn new(
        code: RequestCode,
        version: RequestVersion,
        initializer: Box<dyn Initializer>,
        handler: Box<dyn Handler>,
        connector: Box<dyn Connector>,
        disconnected: Box<dyn DisconnectedHandler>,
        shared: Shared,
    ) -> SkeletonRoc {
        SkeletonRoc {
            code,
            version,
            initializer,
            handler,
            connector,
            disconnected,
            shared,
            phase: Phase::Connect,
        }
    }

    fn stopped(&self) -> bool {
        self.shared.borrow().stopped
    }

    fn resume_connect(&mut self, io: &mut EventDispatcher<'_>, code: i32) -> FiberOutcome {
        if self.stopped() || code == resume::SIGNAL_STOP {
            return FiberOutcome::Complete { participated: false };
        }

        if code == resume::RECEIVED {
            // Nothing has been sent on this id yet; drop the stray message.
            io.receive();
            return FiberOutcome::Pending;
        }

        if io.connected() {
            self.send_opening(io)
        } else {
            self.consult_connector(io)
        }
    }

    fn consult_connector(&mut self, io: &mut EventDispatcher<'_>) -> FiberOutcome {
        match self.connector.on_disconnected() {
            ConnectDecision::WaitForReconnect => {
                self.phase = Phase::Connect;
                io.wait_for_reconnect();
                FiberOutcome::Pending
            }
            ConnectDecision::GiveUp => FiberOutcome::Complete { participated: false },
        }
    }

    fn send_opening(&mut self, io: &mut EventDispatcher<'_>) -> FiberOutcome {
        let code = self.code;
        let version = self.version;
        let initializer = &mut self.initializer;

        match io.send(|builder| {
            builder.add_value(code).add_value(version);
            initializer.build(builder);
        }) {
            Ok(Step::Done) => {
                self.phase = Phase::AwaitStatus;
                FiberOutcome::Pending
            }
            Ok(Step::Pending) => {
                self.phase = Phase::SendOpening;
                FiberOutcome::Pending
            }
            Err(RequestError::NodeDisconnected) => self.consult_connector(io),
            Err(err) => FiberOutcome::Failed(err),
        }
    }

    fn resume_send_opening(&mut self, io: &mut EventDispatcher<'_>, code: i32) -> FiberOutcome {
        if self.stopped() || code == resume::SIGNAL_STOP {
            return FiberOutcome::Complete { participated: false };
        }

        match code {
            resume::FLUSHED | resume::YIELDED => self.send_opening(io),
            resume::DISCONNECTED => self.consult_connector(io),
            _ => FiberOutcome::Pending,
        }
    }

    fn resume_await_status(&mut self, io: &mut EventDispatcher<'_>, code: i32) -> FiberOutcome {
        match code {
            resume::RECEIVED => {
                let payload = match io.receive() {
                    Some(payload) => payload,
                    None => return FiberOutcome::Pending,
                };

                let status = match parse_status(&payload) {
                    Some(status) => status,
                    None => {
                        io.shutdown_with_protocol_error("malformed status response");
                        return FiberOutcome::Failed(RequestError::ProtocolError);
                    }
                };

                match self.initializer.check_status(status) {
                    Ok(()) => {
                        self.phase = Phase::Handle;
                        match self.handler.started(io) {
                            Ok(HandlerStep::Finished) => FiberOutcome::Complete { participated: true },
                            Ok(HandlerStep::Continue) => self.drain(io),
                            Err(err) => FiberOutcome::Failed(err),
                        }
                    }
                    Err(err) => FiberOutcome::Failed(err),
                }
            }
            resume::DISCONNECTED => self.consult_connector(io),
            _ => FiberOutcome::Pending,
        }
    }

    fn drain(&mut self, io: &mut EventDispatcher<'_>) -> FiberOutcome {
        let mut handled = 0u32;

        while let Some(payload) = io.receive() {
            match self.handler.message(&payload, io) {
                Ok(HandlerStep::Continue) => (),
                Ok(HandlerStep::Finished) => return FiberOutcome::Complete { participated: true },
                Err(err) => return FiberOutcome::Failed(err),
            }

            if io.shutdown_requested() {
                return FiberOutcome::Failed(RequestError::ProtocolError);
            }

            handled += 1;
            if handled >= YIELD_MESSAGE_COUNT && io.pending_messages() > 0 {
                io.yield_now();
                return FiberOutcome::Pending;
            }
        }

        FiberOutcome::Pending
    }

    fn resume_handle(&mut self, io: &mut EventDispatcher<'_>, code: i32) -> FiberOutcome {
        match code {
            resume::RECEIVED | resume::YIELDED => self.drain(io),
            resume::FLUSHED => match self.handler.drained(io) {
                Ok(HandlerStep::Finished) => FiberOutcome::Complete { participated: true },
                Ok(HandlerStep::Continue) => self.drain(io),
                Err(err) => FiberOutcome::Failed(err),
            },
            resume::DISCONNECTED => match self.disconnected.on_disconnected() {
                DisconnectDecision::Retry => {
                    io.notify(Notification::NodeDisconnected { node: io.node() });
                    self.phase = Phase::Connect;
                    io.wait_for_reconnect();
                    FiberOutcome::Pending
                }
                DisconnectDecision::Abort => FiberOutcome::Failed(RequestError::NodeDisconnected),
            },
            code if code > 0 => match self.handler.signal(code, io) {
                Ok(HandlerStep::Finished) => FiberOutcome::Complete { participated: true },
                Ok(HandlerStep::Continue) => self.drain(io),
                Err(err) => FiberOutcome::Failed(err),
            },
            _ => FiberOutcome::Pending,
        }
    }
}

fn parse_status(payload: &[u8]) -> Option<GlobalStatus> {
    let mut parser = MessageParser::new(payload);
    let raw: u8 = parser.get_value().ok()?;
    parser.finish().ok()?;
    GlobalStatus::from_u8(raw)
}

impl RocFiber for SkeletonRoc {
    fn resume(&mut self, io: &mut EventDispatcher<'_>, code: i32) -> FiberOutcome {
        match self.phase {
            Phase::Connect => self.resume_connect(io, code),
            Phase::SendOpening => self.resume_send_opening(io, code),
            Phase::AwaitStatus => self.resume_await_status(io, code),
            Phase::Handle => self.resume_handle(io, code),
        }
    }
}
