use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{EngineEvent, EngineEvents, EngineFactory, NegotiationEngine};
use crate::error::{ClientError, EngineError};
use crate::negotiation::{Effect, Input, Negotiation, Phase, SessionEvent};
use crate::transport::SignalSink;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Handle to one running negotiation session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    peer_id: String,
    instance: u64,
    mailbox: mpsc::UnboundedSender<Input>,
    phase: watch::Receiver<Phase>,
}

impl SessionHandle {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Distinguishes successive sessions with the same peer.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == Phase::Closed || self.mailbox.is_closed()
    }

    /// End the session and tell the peer. Repeating it is harmless.
    pub fn hang_up(&self) -> Result<(), ClientError> {
        self.dispatch(Input::Hangup)
    }

    /// Renegotiate as the offering side with a fresh engine.
    pub fn restart(&self) -> Result<(), ClientError> {
        self.dispatch(Input::Restart)
    }

    pub(crate) fn dispatch(&self, input: Input) -> Result<(), ClientError> {
        self.mailbox
            .send(input)
            .map_err(|_| ClientError::SessionClosed(self.peer_id.clone()))
    }

    /// Wait until the published phase satisfies `accept`. A session that
    /// ends without ever getting there resolves to [`Phase::Closed`].
    pub async fn wait_for(&self, accept: impl Fn(Phase) -> bool) -> Phase {
        let mut phase = self.phase.clone();
        let result = phase.wait_for(|current| accept(*current)).await;
        match result {
            Ok(current) => *current,
            Err(_) => Phase::Closed,
        }
    }
}

/// Session lifecycle notification for the owning endpoint.
#[derive(Debug, Clone)]
pub(crate) struct SessionReport {
    pub peer_id: String,
    pub instance: u64,
    pub event: SessionEvent,
}

pub(crate) struct SessionParams {
    pub local_id: String,
    pub peer_id: String,
    pub factory: Arc<dyn EngineFactory>,
    pub outbox: Arc<dyn SignalSink>,
    pub reports: mpsc::UnboundedSender<SessionReport>,
    pub negotiation_timeout: Option<Duration>,
}

/// Start a session actor whose first input is `first`.
pub(crate) fn spawn_session(params: SessionParams, first: Input) -> SessionHandle {
    let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
    let (phase_tx, phase_rx) = watch::channel(Phase::Idle);
    let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);

    let handle = SessionHandle {
        peer_id: params.peer_id.clone(),
        instance,
        mailbox: mailbox_tx.clone(),
        phase: phase_rx,
    };
    // Queued before the actor starts so it is the first thing handled.
    let _ = mailbox_tx.send(first);

    let actor = SessionActor {
        negotiation: Negotiation::new(
            params.local_id,
            params.peer_id,
            params.negotiation_timeout.is_some(),
        ),
        engine: None,
        factory: params.factory,
        outbox: params.outbox,
        reports: params.reports,
        mailbox_tx,
        phase_tx,
        negotiation_timeout: params.negotiation_timeout,
        deadline: None,
        instance,
    };
    tokio::spawn(actor.run(mailbox_rx));
    handle
}

struct SessionActor {
    negotiation: Negotiation,
    engine: Option<Arc<dyn NegotiationEngine>>,
    factory: Arc<dyn EngineFactory>,
    outbox: Arc<dyn SignalSink>,
    reports: mpsc::UnboundedSender<SessionReport>,
    mailbox_tx: mpsc::UnboundedSender<Input>,
    phase_tx: watch::Sender<Phase>,
    negotiation_timeout: Option<Duration>,
    deadline: Option<JoinHandle<()>>,
    instance: u64,
}

impl SessionActor {
    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<Input>) {
        debug!(
            target = "tidepool::session",
            peer_id = %self.negotiation.peer_id(),
            instance = self.instance,
            "session started"
        );

        if let Some(failure) = self.build_engine(0).await {
            self.process(failure).await;
        }

        while !self.negotiation.is_closed() {
            let Some(input) = mailbox.recv().await else {
                break;
            };
            self.process(input).await;
        }

        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
        if let Some(engine) = self.engine.take() {
            engine.close().await;
        }
        debug!(
            target = "tidepool::session",
            peer_id = %self.negotiation.peer_id(),
            instance = self.instance,
            "session stopped"
        );
    }

    /// Run one input to quiescence: effects in order, engine completions
    /// fed back before the next mailbox item is looked at.
    async fn process(&mut self, input: Input) {
        let mut pending = VecDeque::from([input]);
        while let Some(input) = pending.pop_front() {
            for effect in self.negotiation.handle(input) {
                if let Some(next) = self.apply(effect).await {
                    pending.push_back(next);
                }
            }
            self.phase_tx.send_replace(self.negotiation.phase());
        }
    }

    async fn apply(&mut self, effect: Effect) -> Option<Input> {
        match effect {
            Effect::CreateOffer => {
                let result = match self.engine.clone() {
                    Some(engine) => engine.create_offer().await,
                    None => Err(no_engine()),
                };
                Some(Input::LocalDescriptionCreated(result))
            }
            Effect::CreateAnswer => {
                let result = match self.engine.clone() {
                    Some(engine) => engine.create_answer().await,
                    None => Err(no_engine()),
                };
                Some(Input::LocalDescriptionCreated(result))
            }
            Effect::SetLocalDescription(description) => {
                let result = match self.engine.clone() {
                    Some(engine) => engine.set_local_description(description).await,
                    None => Err(no_engine()),
                };
                Some(Input::LocalDescriptionSet(result))
            }
            Effect::SetRemoteDescription(description) => {
                let result = match self.engine.clone() {
                    Some(engine) => engine.set_remote_description(description).await,
                    None => Err(no_engine()),
                };
                Some(Input::RemoteDescriptionSet(result))
            }
            Effect::AddRemoteCandidate(candidate) => {
                if let Some(engine) = self.engine.clone() {
                    if let Err(err) = engine.add_remote_candidate(candidate).await {
                        warn!(
                            target = "tidepool::session",
                            peer_id = %self.negotiation.peer_id(),
                            error = %err,
                            "failed to apply remote candidate"
                        );
                    }
                }
                None
            }
            Effect::Send(message) => {
                if let Err(err) = self.outbox.send_signal(message) {
                    warn!(
                        target = "tidepool::session",
                        peer_id = %self.negotiation.peer_id(),
                        error = %err,
                        "dropping outbound frame"
                    );
                }
                None
            }
            Effect::ArmDeadline { generation } => {
                self.arm_deadline(generation);
                None
            }
            Effect::ReleaseEngine => {
                if let Some(deadline) = self.deadline.take() {
                    deadline.abort();
                }
                if let Some(engine) = self.engine.take() {
                    engine.close().await;
                }
                None
            }
            Effect::RebuildEngine { generation } => {
                if let Some(engine) = self.engine.take() {
                    engine.close().await;
                }
                self.build_engine(generation).await
            }
            Effect::Notify(event) => {
                match &event {
                    SessionEvent::Established => info!(
                        target = "tidepool::session",
                        peer_id = %self.negotiation.peer_id(),
                        "peer connection established"
                    ),
                    SessionEvent::Ended(reason) => info!(
                        target = "tidepool::session",
                        peer_id = %self.negotiation.peer_id(),
                        reason = ?reason,
                        "session ended"
                    ),
                }
                let _ = self.reports.send(SessionReport {
                    peer_id: self.negotiation.peer_id().to_string(),
                    instance: self.instance,
                    event,
                });
                None
            }
        }
    }

    /// On failure, returns the input that reports it to the state machine.
    async fn build_engine(&mut self, generation: u64) -> Option<Input> {
        let events = EngineEvents::new(generation, self.mailbox_tx.clone());
        match self.factory.create(self.negotiation.peer_id(), events).await {
            Ok(engine) => {
                self.engine = Some(engine);
                None
            }
            Err(err) => {
                warn!(
                    target = "tidepool::session",
                    peer_id = %self.negotiation.peer_id(),
                    error = %err,
                    "failed to build negotiation engine"
                );
                Some(Input::Engine {
                    generation,
                    event: EngineEvent::Failed(err),
                })
            }
        }
    }

    fn arm_deadline(&mut self, generation: u64) {
        let Some(timeout) = self.negotiation_timeout else {
            return;
        };
        if let Some(previous) = self.deadline.take() {
            previous.abort();
        }
        let mailbox = self.mailbox_tx.clone();
        self.deadline = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = mailbox.send(Input::DeadlineElapsed(generation));
        }));
    }
}

fn no_engine() -> EngineError {
    EngineError::new("negotiation engine unavailable")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ConnectionState, SessionDescription};
    use crate::error::NegotiationError;
    use crate::negotiation::EndReason;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tidepool_proto::{IceCandidate, MessageType, SignalingMessage};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        closes: AtomicUsize,
        events: Mutex<Option<EngineEvents>>,
    }

    struct FakeEngine {
        recorder: Arc<Recorder>,
        generation: u64,
    }

    #[async_trait]
    impl NegotiationEngine for FakeEngine {
        async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
            self.recorder.calls.lock().push("create_offer".into());
            Ok(SessionDescription::offer(format!("offer-{}", self.generation)))
        }

        async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
            self.recorder.calls.lock().push("create_answer".into());
            Ok(SessionDescription::answer("answer"))
        }

        async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError> {
            self.recorder
                .calls
                .lock()
                .push(format!("set_local:{}", description.sdp));
            Ok(())
        }

        async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError> {
            if description.sdp == "garbage" {
                return Err(EngineError::new("unparseable sdp"));
            }
            self.recorder
                .calls
                .lock()
                .push(format!("set_remote:{}", description.sdp));
            Ok(())
        }

        async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
            self.recorder
                .calls
                .lock()
                .push(format!("add_candidate:{}", candidate.candidate));
            Ok(())
        }

        async fn close(&self) {
            self.recorder.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeFactory {
        recorder: Arc<Recorder>,
    }

    #[async_trait]
    impl EngineFactory for FakeFactory {
        async fn create(
            &self,
            _peer_id: &str,
            events: EngineEvents,
        ) -> Result<Arc<dyn NegotiationEngine>, EngineError> {
            let generation = events.generation();
            *self.recorder.events.lock() = Some(events);
            Ok(Arc::new(FakeEngine {
                recorder: Arc::clone(&self.recorder),
                generation,
            }))
        }
    }

    struct Harness {
        recorder: Arc<Recorder>,
        outbox: mpsc::UnboundedReceiver<SignalingMessage>,
        reports: mpsc::UnboundedReceiver<SessionReport>,
    }

    fn start(first: Input, timeout: Option<Duration>) -> (SessionHandle, Harness) {
        let recorder = Arc::new(Recorder::default());
        let (outbox_tx, outbox) = mpsc::unbounded_channel();
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let handle = spawn_session(
            SessionParams {
                local_id: "A".into(),
                peer_id: "B".into(),
                factory: Arc::new(FakeFactory {
                    recorder: Arc::clone(&recorder),
                }),
                outbox: Arc::new(outbox_tx),
                reports: reports_tx,
                negotiation_timeout: timeout,
            },
            first,
        );
        (
            handle,
            Harness {
                recorder,
                outbox,
                reports,
            },
        )
    }

    #[test_timeout::tokio_timeout_test]
    async fn caller_session_reaches_connected() {
        let (handle, mut harness) = start(Input::Call, None);

        let offer = harness.outbox.recv().await.expect("offer");
        assert_eq!(offer, SignalingMessage::offer("A", "B", "offer-0"));
        handle.wait_for(|phase| phase == Phase::AwaitingAnswer).await;

        handle.dispatch(Input::RemoteAnswer("answer".into())).unwrap();
        handle.wait_for(|phase| phase == Phase::Negotiating).await;

        let events = harness.recorder.events.lock().clone().expect("engine events");
        assert!(events.emit(EngineEvent::LocalCandidate(IceCandidate::new(
            "candidate:1",
            Some("0".into()),
            Some(0)
        ))));
        let trickled = harness.outbox.recv().await.expect("candidate");
        assert_eq!(trickled.kind, MessageType::IceCandidates);

        events.emit(EngineEvent::ConnectionState(ConnectionState::Connected));
        assert_eq!(
            handle.wait_for(|phase| phase == Phase::Connected).await,
            Phase::Connected
        );
        let report = harness.reports.recv().await.expect("report");
        assert_eq!(report.event, SessionEvent::Established);
        assert_eq!(report.instance, handle.instance());
    }

    #[test_timeout::tokio_timeout_test]
    async fn hangup_twice_closes_engine_once() {
        let (handle, mut harness) = start(Input::Call, None);
        harness.outbox.recv().await.expect("offer");

        handle.hang_up().unwrap();
        let _ = handle.hang_up();
        assert_eq!(handle.wait_for(|phase| phase == Phase::Closed).await, Phase::Closed);

        assert_eq!(
            harness.outbox.recv().await.expect("end call"),
            SignalingMessage::end_call("A", "B")
        );
        let report = harness.reports.recv().await.expect("report");
        assert_eq!(report.event, SessionEvent::Ended(EndReason::Local));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.recorder.closes.load(Ordering::SeqCst), 1);
        assert!(matches!(handle.hang_up(), Err(ClientError::SessionClosed(_))));
        assert!(matches!(handle.restart(), Err(ClientError::SessionClosed(_))));
    }

    #[test_timeout::tokio_timeout_test]
    async fn bad_remote_offer_fails_only_this_session() {
        let (handle, mut harness) = start(Input::RemoteOffer("garbage".into()), None);

        assert_eq!(handle.wait_for(|phase| phase == Phase::Closed).await, Phase::Closed);
        let report = harness.reports.recv().await.expect("report");
        assert!(matches!(
            report.event,
            SessionEvent::Ended(EndReason::Failed(NegotiationError::SetRemoteDescription(_)))
        ));
        assert_eq!(harness.recorder.closes.load(Ordering::SeqCst), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn negotiation_deadline_closes_a_stalled_caller() {
        let (handle, mut harness) = start(Input::Call, Some(Duration::from_millis(100)));
        harness.outbox.recv().await.expect("offer");

        assert_eq!(handle.wait_for(|phase| phase == Phase::Closed).await, Phase::Closed);
        let report = harness.reports.recv().await.expect("report");
        assert_eq!(
            report.event,
            SessionEvent::Ended(EndReason::Failed(NegotiationError::TimedOut(
                Phase::AwaitingAnswer
            )))
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn restart_rebuilds_engine_and_reoffers() {
        let (handle, mut harness) = start(Input::Call, None);
        assert_eq!(
            harness.outbox.recv().await.expect("first offer"),
            SignalingMessage::offer("A", "B", "offer-0")
        );

        handle.restart().unwrap();
        assert_eq!(
            harness.outbox.recv().await.expect("second offer"),
            SignalingMessage::offer("A", "B", "offer-1")
        );
        assert_eq!(harness.recorder.closes.load(Ordering::SeqCst), 1);
        assert_eq!(
            handle.wait_for(|phase| phase == Phase::AwaitingAnswer).await,
            Phase::AwaitingAnswer
        );
    }
}
