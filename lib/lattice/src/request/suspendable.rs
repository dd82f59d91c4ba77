//! Node side of a suspendable stream: a long-running iteration turned into
//! a flow-controlled, acknowledged, resumable sequence of record frames.
//! Control messages from the client (Suspend/Resume/Stop) are answered with
//! exactly one Ack each before the transition becomes visible, and a second
//! control before the outstanding Ack is a protocol error.

use crate::fiber::{resume, EventDispatcher, FiberOutcome, RocFiber, Step};
use crate::parse::MessageBuilder;
use crate::shared::RequestError;

/// Records streamed between yields, giving other RoCs on the connection CPU.
pub const YIELD_SEND_COUNT: u32 = 10;

/// One step of the underlying iteration.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SourceStep {
    /// A record to stream.
    Record(Vec<u8>),
    /// No data right now; the host signals `DATA_READY` when there is.
    Pending,
    /// The iteration finished.
    End,
    /// The backing channel disappeared mid-stream.
    ChannelRemoved,
}

/// The long-running iteration feeding the stream.
pub trait RecordSource {
    fn next(&mut self) -> SourceStep;
}

/// Pure decision over a received message's raw bytes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReceivedMessageAction {
    Suspend,
    Resume,
    Exit,
    Undefined,
}

/// Request-defined wire mapping: classifies inbound control messages and
/// builds the outbound record/ack/end payloads.
pub trait StreamProtocol {
    fn classify(&self, payload: &[u8]) -> ReceivedMessageAction;
    fn record(&self, builder: &mut MessageBuilder, data: &[u8]);
    fn ack(&self, builder: &mut MessageBuilder);
    fn end(&self, builder: &mut MessageBuilder);
    fn channel_removed(&self, builder: &mut MessageBuilder);
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum StreamState {
    Sending,
    WaitingForData,
    Suspended,
}

/// Outbound message owed to the client but not yet accepted by the write
/// buffer. Acks take precedence over a stashed record.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum PendingOut {
    /// Ack plus the state the stream enters once it is out.
    Ack(StreamState),
    AckThenEnd,
    End,
    ChannelRemoved,
}

pub struct SuspendableStream {
    source: Box<dyn RecordSource>,
    protocol: Box<dyn StreamProtocol>,
    state: StreamState,
    /// Record pulled from the source but not yet accepted by the writer.
    stashed_record: Option<Vec<u8>>,
    pending_out: Option<PendingOut>,
    sent_since_yield: u32,
    exiting: bool,
}

impl SuspendableStream {
    pub fn new(source: Box<dyn RecordSource>, protocol: Box<dyn StreamProtocol>) -> SuspendableStream {
        SuspendableStream {
            source,
            protocol,
            state: StreamState::Sending,
            stashed_record: None,
            pending_out: None,
            sent_since_yield: 0,
            exiting: false,
        }
    }

    /// Flushes the owed control output, if any. `Ok(true)` when the stream
    /// may continue, `Ok(false)` when it still waits for buffer space.
    fn flush_pending_out(&mut self, io: &mut EventDispatcher<'_>) -> Result<bool, FiberOutcome> {
        let pending = match self.pending_out {
            Some(pending) => pending,
            None => return Ok(true),
        };

        let protocol = &self.protocol;
        let step = match pending {
            PendingOut::Ack(_) | PendingOut::AckThenEnd => io.send(|builder| protocol.ack(builder)),
            PendingOut::End => io.send(|builder| protocol.end(builder)),
            PendingOut::ChannelRemoved => io.send(|builder| protocol.channel_removed(builder)),
        };

        match step {
            Ok(Step::Done) => match pending {
                PendingOut::Ack(next_state) => {
                    self.pending_out = None;
                    self.state = next_state;
                    Ok(true)
                }
                PendingOut::AckThenEnd => {
                    self.pending_out = Some(PendingOut::End);
                    self.flush_pending_out(io)
                }
                PendingOut::End | PendingOut::ChannelRemoved => {
                    Err(FiberOutcome::Complete { participated: true })
                }
            },
            Ok(Step::Pending) => Ok(false),
            Err(err) => Err(FiberOutcome::Failed(err)),
        }
    }

    /// Streams records while in `Sending`, yielding every
    /// `YIELD_SEND_COUNT` records.
    fn drive(&mut self, io: &mut EventDispatcher<'_>) -> FiberOutcome {
        match self.flush_pending_out(io) {
            Ok(true) => (),
            Ok(false) => return FiberOutcome::Pending,
            Err(outcome) => return outcome,
        }

        while self.state == StreamState::Sending {
            if self.sent_since_yield >= YIELD_SEND_COUNT {
                self.sent_since_yield = 0;
                io.yield_now();
                return FiberOutcome::Pending;
            }

            let record = match self.stashed_record.take() {
                Some(record) => SourceStep::Record(record),
                None => self.source.next(),
            };

            match record {
                SourceStep::Record(data) => {
                    let protocol = &self.protocol;
                    match io.send(|builder| protocol.record(builder, &data)) {
                        Ok(Step::Done) => self.sent_since_yield += 1,
                        Ok(Step::Pending) => {
                            self.stashed_record = Some(data);
                            return FiberOutcome::Pending;
                        }
                        Err(err) => return FiberOutcome::Failed(err),
                    }
                }
                SourceStep::Pending => {
                    self.state = StreamState::WaitingForData;
                }
                SourceStep::End => {
                    self.pending_out = Some(PendingOut::End);
                    return match self.flush_pending_out(io) {
                        Ok(true) | Ok(false) => FiberOutcome::Pending,
                        Err(outcome) => outcome,
                    };
                }
                SourceStep::ChannelRemoved => {
                    self.exiting = true;
                    self.pending_out = Some(PendingOut::ChannelRemoved);
                    return match self.flush_pending_out(io) {
                        Ok(true) | Ok(false) => FiberOutcome::Pending,
                        Err(outcome) => outcome,
                    };
                }
            }
        }

        FiberOutcome::Pending
    }

    fn on_control(&mut self, payload: &[u8], io: &mut EventDispatcher<'_>) -> FiberOutcome {
        if self.exiting {
            // A removed channel ends the conversation; late client messages
            // are dropped.
            return FiberOutcome::Pending;
        }

        if self.pending_out.is_some() {
            io.shutdown_with_protocol_error("control message while a previous one is unacknowledged");
            return FiberOutcome::Failed(RequestError::ProtocolError);
        }

        match self.protocol.classify(payload) {
            ReceivedMessageAction::Suspend => {
                self.pending_out = Some(PendingOut::Ack(StreamState::Suspended));
                self.drive_after_ack(io)
            }
            ReceivedMessageAction::Resume => {
                self.pending_out = Some(PendingOut::Ack(StreamState::Sending));
                self.drive_after_ack(io)
            }
            ReceivedMessageAction::Exit => {
                self.pending_out = Some(PendingOut::AckThenEnd);
                match self.flush_pending_out(io) {
                    Ok(true) | Ok(false) => FiberOutcome::Pending,
                    Err(outcome) => outcome,
                }
            }
            ReceivedMessageAction::Undefined => {
                io.shutdown_with_protocol_error("undefined control message");
                FiberOutcome::Failed(RequestError::ProtocolError)
            }
        }
    }

    fn drive_after_ack(&mut self, io: &mut EventDispatcher<'_>) -> FiberOutcome {
        match self.flush_pending_out(io) {
            Ok(true) => self.drive(io),
            Ok(false) => FiberOutcome::Pending,
            Err(outcome) => outcome,
        }
    }
}

impl RocFiber for SuspendableStream {
    fn resume(&mut self, io: &mut EventDispatcher<'_>, code: i32) -> FiberOutcome {
        match code {
            resume::STARTED | resume::YIELDED => self.drive(io),
            resume::FLUSHED => self.drive_after_ack(io),
            resume::RECEIVED => match io.receive() {
                Some(payload) => self.on_control(&payload, io),
                None => FiberOutcome::Pending,
            },
            resume::DISCONNECTED => FiberOutcome::Failed(RequestError::NodeDisconnected),
            code if code >= resume::DATA_READY => {
                if self.state == StreamState::WaitingForData {
                    self.state = StreamState::Sending;
                    self.drive(io)
                } else {
                    FiberOutcome::Pending
                }
            }
            _ => FiberOutcome::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::frame;
    use crate::parse::MessageParser;
    use crate::shared::{Notification, RequestId};
    use std::collections::VecDeque;
    use std::net::SocketAddr;

    // Test wire mapping: first byte tags the message.
    const MSG_RECORD: u8 = 1;
    const MSG_ACK: u8 = 2;
    const MSG_END: u8 = 3;
    const MSG_CHANNEL_REMOVED: u8 = 4;
    const CTL_SUSPEND: u8 = 10;
    const CTL_RESUME: u8 = 11;
    const CTL_STOP: u8 = 12;

    struct TestProtocol;

    impl StreamProtocol for TestProtocol {
        fn classify(&self, payload: &[u8]) -> ReceivedMessageAction {
            match payload.first() {
                Some(&CTL_SUSPEND) => ReceivedMessageAction::Suspend,
                Some(&CTL_RESUME) => ReceivedMessageAction::Resume,
                Some(&CTL_STOP) => ReceivedMessageAction::Exit,
                _ => ReceivedMessageAction::Undefined,
            }
        }

        fn record(&self, builder: &mut MessageBuilder, data: &[u8]) {
            builder.add_value(MSG_RECORD).add_array(data);
        }

        fn ack(&self, builder: &mut MessageBuilder) {
            builder.add_value(MSG_ACK);
        }

        fn end(&self, builder: &mut MessageBuilder) {
            builder.add_value(MSG_END);
        }

        fn channel_removed(&self, builder: &mut MessageBuilder) {
            builder.add_value(MSG_CHANNEL_REMOVED);
        }
    }

    struct QueueSource {
        steps: VecDeque<SourceStep>,
    }

    impl QueueSource {
        fn new(steps: Vec<SourceStep>) -> QueueSource {
            QueueSource {
                steps: steps.into_iter().collect(),
            }
        }
    }

    impl RecordSource for QueueSource {
        fn next(&mut self) -> SourceStep {
            self.steps.pop_front().unwrap_or(SourceStep::Pending)
        }
    }

    struct Harness {
        write: Buffer,
        mailbox: VecDeque<Vec<u8>>,
        flush: Vec<crate::fiber::RocId>,
        reconnect: Vec<crate::fiber::RocId>,
        wakes: Vec<(crate::fiber::RocId, i32)>,
        notes: Vec<(RequestId, Notification)>,
        shutdown: Option<String>,
    }

    impl Harness {
        fn new() -> Harness {
            Harness {
                write: Buffer::new(65536),
                mailbox: VecDeque::new(),
                flush: Vec::new(),
                reconnect: Vec::new(),
                wakes: Vec::new(),
                notes: Vec::new(),
                shutdown: None,
            }
        }

        fn addr() -> SocketAddr {
            "127.0.0.1:4000".parse().unwrap()
        }

        fn resume(&mut self, fiber: &mut SuspendableStream, code: i32) -> FiberOutcome {
            let mut io = EventDispatcher::new(
                1,
                9,
                Self::addr(),
                true,
                4096,
                Some(&mut self.write),
                &mut self.mailbox,
                &mut self.flush,
                &mut self.reconnect,
                &mut self.wakes,
                &mut self.notes,
                &mut self.shutdown,
            );
            fiber.resume(&mut io, code)
        }

        /// Tags of all frames accepted by the writer so far.
        fn sent_tags(&mut self) -> Vec<u8> {
            let mut tags = Vec::new();

            loop {
                match frame::extract(&mut self.write, 4096) {
                    Ok((_, payload)) => {
                        let mut parser = MessageParser::new(&payload);
                        tags.push(parser.get_value::<u8>().unwrap());
                    }
                    Err(_) => break,
                }
            }

            tags
        }

        fn push_control(&mut self, tag: u8) {
            self.mailbox.push_back(vec![tag]);
        }
    }

    fn stream(steps: Vec<SourceStep>) -> SuspendableStream {
        SuspendableStream::new(Box::new(QueueSource::new(steps)), Box::new(TestProtocol))
    }

    fn records(count: usize) -> Vec<SourceStep> {
        (0..count).map(|i| SourceStep::Record(vec![i as u8])).collect()
    }

    #[test]
    fn test_streams_records_then_end() {
        let mut harness = Harness::new();
        let mut steps = records(3);
        steps.push(SourceStep::End);
        let mut fiber = stream(steps);

        let outcome = harness.resume(&mut fiber, resume::STARTED);

        assert_eq!(outcome, FiberOutcome::Complete { participated: true });
        assert_eq!(harness.sent_tags(), vec![MSG_RECORD, MSG_RECORD, MSG_RECORD, MSG_END]);
    }

    #[test]
    fn test_yields_every_ten_records() {
        let mut harness = Harness::new();
        let mut steps = records(15);
        steps.push(SourceStep::End);
        let mut fiber = stream(steps);

        assert_eq!(harness.resume(&mut fiber, resume::STARTED), FiberOutcome::Pending);
        assert_eq!(harness.wakes, vec![(1, resume::YIELDED)]);
        assert_eq!(harness.sent_tags().len(), 10);

        harness.wakes.clear();
        let outcome = harness.resume(&mut fiber, resume::YIELDED);

        assert_eq!(outcome, FiberOutcome::Complete { participated: true });
        assert_eq!(harness.sent_tags(), vec![MSG_RECORD, MSG_RECORD, MSG_RECORD, MSG_RECORD, MSG_RECORD, MSG_END]);
    }

    #[test]
    fn test_suspend_acks_and_stops_records() {
        let mut harness = Harness::new();
        let mut fiber = stream(records(100));

        // Stream a couple of records, then suspend.
        harness.resume(&mut fiber, resume::STARTED);
        harness.sent_tags();

        harness.push_control(CTL_SUSPEND);
        assert_eq!(harness.resume(&mut fiber, resume::RECEIVED), FiberOutcome::Pending);
        assert_eq!(harness.sent_tags(), vec![MSG_ACK]);

        // No records while suspended, whatever wakes arrive.
        assert_eq!(harness.resume(&mut fiber, resume::YIELDED), FiberOutcome::Pending);
        assert_eq!(harness.resume(&mut fiber, 5), FiberOutcome::Pending);
        assert!(harness.sent_tags().is_empty());

        // Resume is acked and streaming picks back up.
        harness.push_control(CTL_RESUME);
        assert_eq!(harness.resume(&mut fiber, resume::RECEIVED), FiberOutcome::Pending);
        let tags = harness.sent_tags();
        assert_eq!(tags[0], MSG_ACK);
        assert!(tags[1..].iter().all(|&tag| tag == MSG_RECORD));
        assert!(tags.len() > 1);
    }

    #[test]
    fn test_stop_acks_then_ends() {
        let mut harness = Harness::new();
        let mut fiber = stream(records(100));

        harness.resume(&mut fiber, resume::STARTED);
        harness.sent_tags();

        harness.push_control(CTL_STOP);
        let outcome = harness.resume(&mut fiber, resume::RECEIVED);

        assert_eq!(outcome, FiberOutcome::Complete { participated: true });
        assert_eq!(harness.sent_tags(), vec![MSG_ACK, MSG_END]);
    }

    #[test]
    fn test_waiting_for_data_resumes_on_data_ready() {
        let mut harness = Harness::new();
        let mut steps = records(2);
        steps.push(SourceStep::Pending);
        steps.push(SourceStep::Record(vec![7]));
        steps.push(SourceStep::End);
        let mut fiber = stream(steps);

        assert_eq!(harness.resume(&mut fiber, resume::STARTED), FiberOutcome::Pending);
        assert_eq!(harness.sent_tags(), vec![MSG_RECORD, MSG_RECORD]);

        // Nothing happens until the host signals data.
        assert_eq!(harness.resume(&mut fiber, resume::YIELDED), FiberOutcome::Pending);
        assert!(harness.sent_tags().is_empty());

        let outcome = harness.resume(&mut fiber, resume::DATA_READY);
        assert_eq!(outcome, FiberOutcome::Complete { participated: true });
        assert_eq!(harness.sent_tags(), vec![MSG_RECORD, MSG_END]);
    }

    #[test]
    fn test_suspend_while_waiting_for_data() {
        let mut harness = Harness::new();
        let mut steps = records(1);
        // The source runs dry twice: once before the suspend, once right
        // after the resume.
        steps.push(SourceStep::Pending);
        steps.push(SourceStep::Pending);
        steps.push(SourceStep::Record(vec![7]));
        steps.push(SourceStep::End);
        let mut fiber = stream(steps);

        harness.resume(&mut fiber, resume::STARTED);
        harness.sent_tags();

        harness.push_control(CTL_SUSPEND);
        harness.resume(&mut fiber, resume::RECEIVED);
        assert_eq!(harness.sent_tags(), vec![MSG_ACK]);

        // Data arriving while suspended stays queued.
        assert_eq!(harness.resume(&mut fiber, resume::DATA_READY), FiberOutcome::Pending);
        assert!(harness.sent_tags().is_empty());

        harness.push_control(CTL_RESUME);
        harness.resume(&mut fiber, resume::RECEIVED);
        let tags = harness.sent_tags();
        assert_eq!(tags[0], MSG_ACK);

        // The stream parked on the dry source again; data-ready finishes it.
        let outcome = harness.resume(&mut fiber, resume::DATA_READY);
        assert_eq!(outcome, FiberOutcome::Complete { participated: true });
        assert_eq!(harness.sent_tags(), vec![MSG_RECORD, MSG_END]);
    }

    #[test]
    fn test_double_control_is_protocol_error() {
        let mut harness = Harness::new();
        let mut fiber = stream(records(100));

        harness.resume(&mut fiber, resume::STARTED);

        // Choke the write buffer so the first Ack cannot leave.
        let spare = harness.write.free_capacity();
        harness.write.commit(spare);

        harness.push_control(CTL_SUSPEND);
        assert_eq!(harness.resume(&mut fiber, resume::RECEIVED), FiberOutcome::Pending);

        harness.push_control(CTL_RESUME);
        let outcome = harness.resume(&mut fiber, resume::RECEIVED);

        assert_eq!(outcome, FiberOutcome::Failed(RequestError::ProtocolError));
        assert!(harness.shutdown.is_some());
    }

    #[test]
    fn test_undefined_control_is_protocol_error() {
        let mut harness = Harness::new();
        let mut fiber = stream(records(100));

        harness.resume(&mut fiber, resume::STARTED);
        harness.sent_tags();

        harness.push_control(0xee);
        let outcome = harness.resume(&mut fiber, resume::RECEIVED);

        assert_eq!(outcome, FiberOutcome::Failed(RequestError::ProtocolError));
    }

    #[test]
    fn test_channel_removed_sends_notice_and_ignores_rest() {
        let mut harness = Harness::new();
        let mut steps = records(1);
        steps.push(SourceStep::ChannelRemoved);
        let mut fiber = stream(steps);

        let outcome = harness.resume(&mut fiber, resume::STARTED);

        assert_eq!(outcome, FiberOutcome::Complete { participated: true });
        assert_eq!(harness.sent_tags(), vec![MSG_RECORD, MSG_CHANNEL_REMOVED]);
    }
}
