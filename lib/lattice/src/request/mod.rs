//! The request fabric. A request is described by four policies supplied by
//! its author (initializer, handler, connector, disconnected handler) and
//! fanned out as one `SkeletonRoc` fiber per target connection. The
//! `RequestSet` tracks every in-flight request on the client; nodes answer
//! streaming requests through `SuspendableStream`.

pub mod context;
pub mod controller;
pub mod set;
pub mod skeleton;
pub mod suspendable;

use crate::fiber::EventDispatcher;
use crate::parse::MessageBuilder;
use crate::shared::{GlobalStatus, RequestError};

/// Request code, the first payload field of every request's opening frame.
pub type RequestCode = u16;
/// Request version, the second field. A node that does not recognize the
/// pair answers with a not-supported status.
pub type RequestVersion = u8;

/// Builds the opening payload body and validates the node's status
/// response.
pub trait Initializer {
    fn build(&mut self, builder: &mut MessageBuilder);

    fn check_status(&mut self, status: GlobalStatus) -> Result<(), RequestError> {
        match status {
            GlobalStatus::None => Ok(()),
            GlobalStatus::RequestVersionNotSupported | GlobalStatus::RequestNotSupported => {
                Err(RequestError::Unsupported)
            }
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HandlerStep {
    /// Keep the fiber alive and wait for more events.
    Continue,
    /// The request body is complete on this connection.
    Finished,
}

/// The request body, driven by inbound messages and signals once the status
/// response was accepted.
pub trait Handler {
    /// Called once when the exchange opens. Simple requests may finish here.
    fn started(&mut self, _io: &mut EventDispatcher<'_>) -> Result<HandlerStep, RequestError> {
        Ok(HandlerStep::Continue)
    }

    /// One inbound message for this RoC.
    fn message(
        &mut self,
        payload: &[u8],
        io: &mut EventDispatcher<'_>,
    ) -> Result<HandlerStep, RequestError>;

    /// A positive (user) resume code.
    fn signal(&mut self, _code: i32, _io: &mut EventDispatcher<'_>) -> Result<HandlerStep, RequestError> {
        Ok(HandlerStep::Continue)
    }

    /// The write buffer drained after a send was parked.
    fn drained(&mut self, _io: &mut EventDispatcher<'_>) -> Result<HandlerStep, RequestError> {
        Ok(HandlerStep::Continue)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectDecision {
    /// Park until the connection reauthenticates.
    WaitForReconnect,
    /// Back out; the fan-out counts one fewer participant.
    GiveUp,
}

/// Policy for a disconnect observed before the handler has started.
pub trait Connector {
    fn on_disconnected(&mut self) -> ConnectDecision {
        ConnectDecision::WaitForReconnect
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DisconnectDecision {
    /// Reconnect and re-issue the request from the start.
    Retry,
    /// Fail this RoC with `NodeDisconnected`.
    Abort,
}

/// Policy for a disconnect observed while the handler was running.
pub trait DisconnectedHandler {
    fn on_disconnected(&mut self) -> DisconnectDecision {
        DisconnectDecision::Abort
    }
}

/// Connector that always waits for the connection to come back.
pub struct WaitConnector;

impl Connector for WaitConnector {}

/// Connector that backs out when the node is down.
pub struct GiveUpConnector;

impl Connector for GiveUpConnector {
    fn on_disconnected(&mut self) -> ConnectDecision {
        ConnectDecision::GiveUp
    }
}

/// Disconnected handler that aborts the RoC.
pub struct AbortOnDisconnect;

impl DisconnectedHandler for AbortOnDisconnect {}

/// Disconnected handler that re-issues the request after reconnection.
pub struct RetryOnDisconnect;

impl DisconnectedHandler for RetryOnDisconnect {
    fn on_disconnected(&mut self) -> DisconnectDecision {
        DisconnectDecision::Retry
    }
}
