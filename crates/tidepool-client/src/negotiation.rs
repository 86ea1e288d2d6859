//! Per-peer negotiation state machine.
//!
//! [`Negotiation`] is synchronous and does no I/O: every socket message,
//! engine completion, engine notification, local command and timer expiry
//! is fed in as an [`Input`], and the machine answers with the ordered
//! [`Effect`]s the caller must carry out. The session actor in
//! [`crate::session`] is the only production driver; tests drive it
//! directly.
//!
//! ```text
//!            Call                LocalDescriptionSet           RemoteDescriptionSet
//!   Idle ─────────────▶ Offering ───────────────▶ AwaitingAnswer ──────────────▶ Negotiating
//!     │                                                                              ▲   │
//!     │ RemoteOffer                       LocalDescriptionSet (answer sent)          │   │ engine Connected
//!     └──────────────▶ Answering ────────────────────────────────────────────────────┘   ▼
//!                                                                                    Connected
//!   any non-Closed phase ── EndCall / Hangup / failure / timeout ──▶ Closed (terminal)
//! ```

use std::collections::VecDeque;
use std::fmt;

use tidepool_proto::{IceCandidate, SignalingMessage};

use crate::engine::{ConnectionState, EngineEvent, SdpKind, SessionDescription};
use crate::error::{EngineError, NegotiationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    Offering,
    AwaitingAnswer,
    Answering,
    Negotiating,
    Connected,
    Closed,
}

impl Phase {
    /// Phases covered by the negotiation deadline.
    pub fn is_handshaking(self) -> bool {
        matches!(self, Phase::Offering | Phase::AwaitingAnswer | Phase::Answering)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Idle => "idle",
            Phase::Offering => "offering",
            Phase::AwaitingAnswer => "awaiting answer",
            Phase::Answering => "answering",
            Phase::Negotiating => "negotiating",
            Phase::Connected => "connected",
            Phase::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteDescription {
    Absent,
    Applying,
    Applied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Local request to call the peer.
    Call,
    RemoteOffer(String),
    RemoteAnswer(String),
    RemoteCandidate(IceCandidate),
    RemoteEndCall,
    /// Local teardown; tells the peer with `EndCall`.
    Hangup,
    /// Rebuild the engine and re-offer without tearing the session down.
    Restart,
    LocalDescriptionCreated(Result<SessionDescription, EngineError>),
    LocalDescriptionSet(Result<(), EngineError>),
    RemoteDescriptionSet(Result<(), EngineError>),
    Engine { generation: u64, event: EngineEvent },
    DeadlineElapsed(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(SessionDescription),
    SetRemoteDescription(SessionDescription),
    AddRemoteCandidate(IceCandidate),
    Send(SignalingMessage),
    ArmDeadline { generation: u64 },
    ReleaseEngine,
    RebuildEngine { generation: u64 },
    Notify(SessionEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Established,
    Ended(EndReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The peer sent `EndCall`.
    Remote,
    /// Hung up locally.
    Local,
    /// The engine reported its connection closed.
    ConnectionClosed,
    Failed(NegotiationError),
}

#[derive(Debug)]
pub struct Negotiation {
    local_id: String,
    peer_id: String,
    role: Role,
    phase: Phase,
    generation: u64,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    remote_state: RemoteDescription,
    pending_candidates: VecDeque<IceCandidate>,
    deadlines: bool,
}

impl Negotiation {
    pub fn new(local_id: impl Into<String>, peer_id: impl Into<String>, deadlines: bool) -> Self {
        Self {
            local_id: local_id.into(),
            peer_id: peer_id.into(),
            role: Role::Callee,
            phase: Phase::Idle,
            generation: 0,
            local_description: None,
            remote_description: None,
            remote_state: RemoteDescription::Absent,
            pending_candidates: VecDeque::new(),
            deadlines,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn remote_state(&self) -> RemoteDescription {
        self.remote_state
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        if self.phase == Phase::Closed {
            return Vec::new();
        }

        match input {
            Input::Call => self.call(),
            Input::RemoteOffer(sdp) => self.remote_offer(sdp),
            Input::RemoteAnswer(sdp) => self.remote_answer(sdp),
            Input::RemoteCandidate(candidate) => self.remote_candidate(candidate),
            Input::RemoteEndCall => self.terminate(EndReason::Remote),
            Input::Hangup => {
                let mut effects = vec![Effect::Send(SignalingMessage::end_call(
                    &self.local_id,
                    &self.peer_id,
                ))];
                effects.extend(self.terminate(EndReason::Local));
                effects
            }
            Input::Restart => self.restart(),
            Input::LocalDescriptionCreated(result) => self.local_description_created(result),
            Input::LocalDescriptionSet(result) => self.local_description_set(result),
            Input::RemoteDescriptionSet(result) => self.remote_description_set(result),
            Input::Engine { generation, event } => {
                if generation != self.generation {
                    return Vec::new();
                }
                self.engine_event(event)
            }
            Input::DeadlineElapsed(generation) => {
                if generation != self.generation || !self.phase.is_handshaking() {
                    return Vec::new();
                }
                self.fail(NegotiationError::TimedOut(self.phase))
            }
        }
    }

    fn call(&mut self) -> Vec<Effect> {
        if self.phase != Phase::Idle {
            return Vec::new();
        }
        self.role = Role::Caller;
        self.begin_offer(Vec::new())
    }

    fn begin_offer(&mut self, mut effects: Vec<Effect>) -> Vec<Effect> {
        self.phase = Phase::Offering;
        effects.push(Effect::CreateOffer);
        self.arm_deadline(&mut effects);
        effects
    }

    fn remote_offer(&mut self, sdp: String) -> Vec<Effect> {
        let mut effects = Vec::new();
        match self.phase {
            Phase::Idle => {}
            Phase::Offering | Phase::AwaitingAnswer if self.wins_glare() => {
                // Both sides offered at once; the larger identifier keeps its offer.
                return effects;
            }
            _ => effects = self.reset(),
        }
        self.role = Role::Callee;
        self.phase = Phase::Answering;
        let offer = SessionDescription::offer(sdp);
        self.remote_description = Some(offer.clone());
        self.remote_state = RemoteDescription::Applying;
        effects.push(Effect::SetRemoteDescription(offer));
        self.arm_deadline(&mut effects);
        effects
    }

    fn remote_answer(&mut self, sdp: String) -> Vec<Effect> {
        if self.phase != Phase::AwaitingAnswer || self.remote_state != RemoteDescription::Absent {
            return Vec::new();
        }
        let answer = SessionDescription::answer(sdp);
        self.remote_description = Some(answer.clone());
        self.remote_state = RemoteDescription::Applying;
        vec![Effect::SetRemoteDescription(answer)]
    }

    fn remote_candidate(&mut self, candidate: IceCandidate) -> Vec<Effect> {
        if self.remote_state == RemoteDescription::Applied {
            vec![Effect::AddRemoteCandidate(candidate)]
        } else {
            self.pending_candidates.push_back(candidate);
            Vec::new()
        }
    }

    fn restart(&mut self) -> Vec<Effect> {
        let effects = self.reset();
        self.role = Role::Caller;
        self.begin_offer(effects)
    }

    /// Drop everything negotiated so far and ask for a fresh engine.
    fn reset(&mut self) -> Vec<Effect> {
        self.generation += 1;
        self.phase = Phase::Idle;
        self.local_description = None;
        self.remote_description = None;
        self.remote_state = RemoteDescription::Absent;
        self.pending_candidates.clear();
        vec![Effect::RebuildEngine {
            generation: self.generation,
        }]
    }

    fn local_description_created(
        &mut self,
        result: Result<SessionDescription, EngineError>,
    ) -> Vec<Effect> {
        match result {
            Ok(description) => {
                let expected = match self.phase {
                    Phase::Offering => SdpKind::Offer,
                    Phase::Answering => SdpKind::Answer,
                    _ => return Vec::new(),
                };
                if description.kind != expected {
                    return self.fail(NegotiationError::CreateDescription(EngineError::new(
                        format!("engine produced {:?} while {}", description.kind, self.phase),
                    )));
                }
                self.local_description = Some(description.clone());
                vec![Effect::SetLocalDescription(description)]
            }
            Err(err) => self.fail(NegotiationError::CreateDescription(err)),
        }
    }

    fn local_description_set(&mut self, result: Result<(), EngineError>) -> Vec<Effect> {
        if let Err(err) = result {
            return self.fail(NegotiationError::SetLocalDescription(err));
        }
        let Some(sdp) = self.local_description.as_ref().map(|desc| desc.sdp.clone()) else {
            return Vec::new();
        };
        match self.phase {
            Phase::Offering => {
                self.phase = Phase::AwaitingAnswer;
                vec![Effect::Send(SignalingMessage::offer(
                    &self.local_id,
                    &self.peer_id,
                    sdp,
                ))]
            }
            Phase::Answering => {
                self.phase = Phase::Negotiating;
                vec![Effect::Send(SignalingMessage::answer(
                    &self.local_id,
                    &self.peer_id,
                    sdp,
                ))]
            }
            _ => Vec::new(),
        }
    }

    fn remote_description_set(&mut self, result: Result<(), EngineError>) -> Vec<Effect> {
        if let Err(err) = result {
            return self.fail(NegotiationError::SetRemoteDescription(err));
        }
        if self.remote_state != RemoteDescription::Applying {
            return Vec::new();
        }
        self.remote_state = RemoteDescription::Applied;
        let mut effects: Vec<Effect> = self
            .pending_candidates
            .drain(..)
            .map(Effect::AddRemoteCandidate)
            .collect();
        match self.phase {
            Phase::Answering => effects.push(Effect::CreateAnswer),
            Phase::AwaitingAnswer => self.phase = Phase::Negotiating,
            _ => {}
        }
        effects
    }

    fn engine_event(&mut self, event: EngineEvent) -> Vec<Effect> {
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                match SignalingMessage::ice_candidate(&self.local_id, &self.peer_id, &candidate) {
                    Ok(message) => vec![Effect::Send(message)],
                    Err(_) => Vec::new(),
                }
            }
            EngineEvent::ConnectionState(ConnectionState::Connected) => {
                if self.phase == Phase::Connected || self.phase == Phase::Idle {
                    return Vec::new();
                }
                self.phase = Phase::Connected;
                vec![Effect::Notify(SessionEvent::Established)]
            }
            EngineEvent::ConnectionState(ConnectionState::Failed) => {
                self.fail(NegotiationError::ConnectionFailed)
            }
            EngineEvent::ConnectionState(ConnectionState::Closed) => {
                self.terminate(EndReason::ConnectionClosed)
            }
            EngineEvent::ConnectionState(_) => Vec::new(),
            EngineEvent::Failed(err) => self.fail(NegotiationError::Engine(err)),
        }
    }

    /// Fatal to this session only. The peer is told with `EndCall`.
    fn fail(&mut self, err: NegotiationError) -> Vec<Effect> {
        let mut effects = vec![Effect::Send(SignalingMessage::end_call(
            &self.local_id,
            &self.peer_id,
        ))];
        effects.extend(self.terminate(EndReason::Failed(err)));
        effects
    }

    fn terminate(&mut self, reason: EndReason) -> Vec<Effect> {
        if self.phase == Phase::Closed {
            return Vec::new();
        }
        self.phase = Phase::Closed;
        self.pending_candidates.clear();
        vec![
            Effect::ReleaseEngine,
            Effect::Notify(SessionEvent::Ended(reason)),
        ]
    }

    fn arm_deadline(&self, effects: &mut Vec<Effect>) {
        if self.deadlines {
            effects.push(Effect::ArmDeadline {
                generation: self.generation,
            });
        }
    }

    fn wins_glare(&self) -> bool {
        self.role == Role::Caller && self.local_id > self.peer_id
    }
}
