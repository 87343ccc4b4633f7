// Subscriber unit (SU) call-control state machine
//
// The actor only holds state and makes decisions. Sending messages and
// arming timers is the emulator's job, so every method here is synchronous
// and safe to call from any task. The inner lock is never held across an
// await point.

use std::fmt;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::IssiTesterError;
use crate::sip::message::SipRequest;
use crate::sip::{CallParams, IssiResponse};
use crate::topology::SuConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActorState {
    Off,
    On,
}

impl fmt::Display for ActorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorState::Off => f.write_str("OFF"),
            ActorState::On => f.write_str("ON"),
        }
    }
}

/// Receives arrived/departed notifications from actor state transitions
pub trait MobilityListener: Send + Sync {
    fn arrived(&self, unit: &str, rfss: &str);
    fn departed(&self, unit: &str, rfss: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogState {
    Early,
    Confirmed,
}

/// One leg of a group call as seen by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupLeg {
    pub unit: String,
    pub answered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Unit { peer: String },
    /// Caller side holds one leg per member, members hold the caller's leg
    Group { group: String, legs: Vec<GroupLeg> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSegment {
    pub call_id: String,
    pub kind: SegmentKind,
    pub role: CallRole,
    pub dialog: DialogState,
    pub priority: u8,
    /// Callee has answered 200 and waits for ACK
    pub ok_sent: bool,
    /// Scenario that set the call up, on the caller side
    pub scenario: Option<String>,
    /// The INVITE being answered, on the callee side
    #[serde(skip)]
    pub invite: Option<SipRequest>,
}

impl CallSegment {
    pub fn peers(&self) -> Vec<String> {
        match &self.kind {
            SegmentKind::Unit { peer } => vec![peer.clone()],
            SegmentKind::Group { legs, .. } => legs.iter().map(|l| l.unit.clone()).collect(),
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.dialog == DialogState::Confirmed
    }

    /// A pending segment another setup may displace
    fn is_preemptable(&self) -> bool {
        self.dialog == DialogState::Early && !self.ok_sent
    }
}

/// Serving-node conditions the decision table consults
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServingConditions {
    pub rf_resources_available: bool,
    pub availability_check_supported: bool,
}

/// Outcome of an incoming call setup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupDecision {
    Busy,
    DeclinedCollidingCall,
    NoRfResource,
    /// Send 183 "no RF resources" first, then accept
    ProgressThenAccept,
    Accept,
    /// Accept, displacing a pending lower-priority segment
    Preempt,
}

impl SetupDecision {
    /// Responses to send to the caller, in order
    pub fn responses(self) -> Vec<IssiResponse> {
        match self {
            SetupDecision::Busy => vec![IssiResponse::Busy],
            SetupDecision::DeclinedCollidingCall => vec![IssiResponse::DeclinedCollidingCall],
            SetupDecision::NoRfResource => vec![IssiResponse::NoRfResource],
            SetupDecision::ProgressThenAccept => vec![
                IssiResponse::SessionProgressNoRfResources,
                IssiResponse::Accepted,
            ],
            SetupDecision::Accept | SetupDecision::Preempt => vec![IssiResponse::Accepted],
        }
    }

    pub fn accepts(self) -> bool {
        matches!(
            self,
            SetupDecision::ProgressThenAccept | SetupDecision::Accept | SetupDecision::Preempt
        )
    }
}

struct ActorInner {
    state: ActorState,
    serving_rfss: String,
    transmit_priority: u8,
    available: bool,
    segment: Option<CallSegment>,
    /// Scenario currently driving this actor's outgoing call
    call_controller: Option<String>,
}

pub struct Actor {
    id: String,
    home_rfss: String,
    callee_processing_delay_secs: u64,
    inner: Mutex<ActorInner>,
}

fn poisoned(id: &str) -> IssiTesterError {
    IssiTesterError::CallControl(format!("actor {} state lock poisoned", id))
}

impl Actor {
    /// New actor in the OFF state
    pub fn new(config: &SuConfig) -> Self {
        Self {
            id: config.id.clone(),
            home_rfss: config.home_rfss.clone(),
            callee_processing_delay_secs: config.callee_processing_delay_secs,
            inner: Mutex::new(ActorInner {
                state: ActorState::Off,
                serving_rfss: config.initial_serving_rfss().to_string(),
                transmit_priority: config.transmit_priority,
                available: config.available,
                segment: None,
                call_controller: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn home_rfss(&self) -> &str {
        &self.home_rfss
    }

    pub fn callee_processing_delay_secs(&self) -> u64 {
        self.callee_processing_delay_secs
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut ActorInner) -> T) -> Result<T, IssiTesterError> {
        let mut inner = self.inner.lock().map_err(|_| poisoned(&self.id))?;
        Ok(f(&mut inner))
    }

    pub fn state(&self) -> ActorState {
        self.with_inner(|i| i.state).unwrap_or(ActorState::Off)
    }

    pub fn serving_rfss(&self) -> String {
        self.with_inner(|i| i.serving_rfss.clone()).unwrap_or_default()
    }

    pub fn set_serving_rfss(&self, rfss: &str) -> Result<(), IssiTesterError> {
        self.with_inner(|i| i.serving_rfss = rfss.to_string())
    }

    pub fn transmit_priority(&self) -> u8 {
        self.with_inner(|i| i.transmit_priority).unwrap_or(0)
    }

    pub fn segment(&self) -> Option<CallSegment> {
        self.with_inner(|i| i.segment.clone()).ok().flatten()
    }

    pub fn call_controller(&self) -> Option<String> {
        self.with_inner(|i| i.call_controller.clone()).ok().flatten()
    }

    /// Move between ON and OFF. A real transition notifies the listener
    /// exactly once; setting the current state again does nothing. An active
    /// segment is left in place when switching OFF.
    pub fn set_state(
        &self,
        state: ActorState,
        listener: &dyn MobilityListener,
    ) -> Result<bool, IssiTesterError> {
        let (changed, rfss) = self.with_inner(|inner| {
            let changed = inner.state != state;
            inner.state = state;
            (changed, inner.serving_rfss.clone())
        })?;
        if changed {
            info!(actor = %self.id, rfss = %rfss, state = %state, "actor state changed");
            match state {
                ActorState::On => listener.arrived(&self.id, &rfss),
                ActorState::Off => listener.departed(&self.id, &rfss),
            }
        }
        Ok(changed)
    }

    /// Bind a pending outgoing segment. The actor must be ON and idle, and
    /// the scenario becomes its call controller.
    pub fn begin_call_setup(
        &self,
        scenario: &str,
        call_id: &str,
        kind: SegmentKind,
        priority: u8,
    ) -> Result<(), IssiTesterError> {
        self.with_inner(|inner| {
            if inner.state != ActorState::On {
                return Err(IssiTesterError::CallControl(format!(
                    "actor {} is OFF and cannot place a call",
                    self.id
                )));
            }
            if let Some(existing) = &inner.segment {
                return Err(IssiTesterError::CallControl(format!(
                    "actor {} already has call {}",
                    self.id, existing.call_id
                )));
            }
            inner.call_controller = Some(scenario.to_string());
            inner.segment = Some(CallSegment {
                call_id: call_id.to_string(),
                kind,
                role: CallRole::Caller,
                dialog: DialogState::Early,
                priority,
                ok_sent: false,
                scenario: Some(scenario.to_string()),
                invite: None,
            });
            Ok(())
        })?
    }

    /// Decision table for an incoming setup, first match wins:
    /// busy on a confirmed different call, declined when not outranking a
    /// pending different call, busy when unavailable, then the RF-resource
    /// branch, then accept.
    pub fn decide_setup(
        &self,
        call_id: &str,
        params: &CallParams,
        serving: ServingConditions,
    ) -> SetupDecision {
        let Ok(inner) = self.inner.lock() else {
            return SetupDecision::Busy;
        };
        let mut preempt = false;
        if let Some(current) = inner.segment.as_ref().filter(|s| s.call_id != call_id) {
            if current.is_confirmed() {
                return SetupDecision::Busy;
            }
            if params.priority <= current.priority || !current.is_preemptable() {
                return SetupDecision::DeclinedCollidingCall;
            }
            preempt = true;
        }
        if !inner.available {
            return SetupDecision::Busy;
        }
        if !serving.rf_resources_available {
            let check_requested = params.availability_check && serving.availability_check_supported;
            if check_requested && params.in_call_roam {
                return SetupDecision::NoRfResource;
            }
            return SetupDecision::ProgressThenAccept;
        }
        if preempt {
            SetupDecision::Preempt
        } else {
            SetupDecision::Accept
        }
    }

    /// Bind an early incoming segment if the actor is idle. Returns false
    /// when another call already occupies the actor.
    pub fn bind_incoming(
        &self,
        call_id: &str,
        kind: SegmentKind,
        priority: u8,
        invite: &SipRequest,
    ) -> Result<bool, IssiTesterError> {
        self.with_inner(|inner| match &inner.segment {
            Some(existing) => existing.call_id == call_id,
            None => {
                inner.segment = Some(incoming_segment(call_id, kind, priority, invite));
                true
            }
        })
    }

    /// Record an accepted setup: replaces whatever pending segment was bound
    /// and returns the displaced one, if it belonged to a different call.
    pub fn accept_incoming(
        &self,
        call_id: &str,
        kind: SegmentKind,
        priority: u8,
        invite: &SipRequest,
    ) -> Result<Option<CallSegment>, IssiTesterError> {
        self.with_inner(|inner| {
            let mut segment = incoming_segment(call_id, kind, priority, invite);
            segment.ok_sent = true;
            let displaced = inner.segment.replace(segment);
            if displaced.as_ref().is_some_and(|d| d.call_id != call_id) {
                inner.call_controller = None;
                displaced
            } else {
                None
            }
        })
    }

    /// ACK received. Only valid after this actor answered 200.
    pub fn handle_call_setup_confirm(&self, call_id: &str) -> Result<bool, IssiTesterError> {
        self.with_inner(|inner| match inner.segment.as_mut() {
            Some(segment) if segment.call_id == call_id && segment.ok_sent => {
                segment.dialog = DialogState::Confirmed;
                debug!(actor = %self.id, call_id, "call confirmed by ACK");
                true
            }
            _ => false,
        })
    }

    /// 200 received for our INVITE. For group calls marks the answering leg.
    pub fn handle_setup_accepted(
        &self,
        call_id: &str,
        from_unit: &str,
    ) -> Result<bool, IssiTesterError> {
        self.with_inner(|inner| match inner.segment.as_mut() {
            Some(segment) if segment.call_id == call_id && segment.role == CallRole::Caller => {
                if let SegmentKind::Group { legs, .. } = &mut segment.kind {
                    if let Some(leg) = legs.iter_mut().find(|l| l.unit == from_unit) {
                        leg.answered = true;
                    }
                }
                segment.dialog = DialogState::Confirmed;
                true
            }
            _ => false,
        })
    }

    /// A final rejection for our INVITE from `from_unit`. Unit calls clear;
    /// group calls drop the leg and clear once no legs remain unanswered
    /// and none answered. Returns the cleared segment.
    pub fn handle_setup_rejected(
        &self,
        call_id: &str,
        from_unit: &str,
    ) -> Result<Option<CallSegment>, IssiTesterError> {
        self.with_inner(|inner| {
            let Some(segment) = inner.segment.as_mut().filter(|s| s.call_id == call_id) else {
                return None;
            };
            if let SegmentKind::Group { legs, .. } = &mut segment.kind {
                legs.retain(|l| l.unit != from_unit);
                if !legs.is_empty() {
                    return None;
                }
            }
            inner.call_controller = None;
            inner.segment.take()
        })
    }

    /// Cancel is allowed only for the initiator before the call is confirmed
    pub fn can_cancel(&self, call_id: &str) -> bool {
        self.with_inner(|inner| {
            inner.segment.as_ref().is_some_and(|s| {
                s.call_id == call_id && s.role == CallRole::Caller && !s.is_confirmed()
            })
        })
        .unwrap_or(false)
    }

    /// Group-call cancel: legs that have not answered yet
    pub fn unanswered_legs(&self, call_id: &str) -> Vec<String> {
        self.with_inner(|inner| match inner.segment.as_ref() {
            Some(CallSegment {
                call_id: id,
                kind: SegmentKind::Group { legs, .. },
                ..
            }) if id == call_id => legs
                .iter()
                .filter(|l| !l.answered)
                .map(|l| l.unit.clone())
                .collect(),
            _ => Vec::new(),
        })
        .unwrap_or_default()
    }

    /// Unbind the segment if it belongs to `call_id`
    pub fn clear_call(&self, call_id: &str) -> Result<Option<CallSegment>, IssiTesterError> {
        self.with_inner(|inner| {
            if inner.segment.as_ref().is_some_and(|s| s.call_id == call_id) {
                inner.call_controller = None;
                inner.segment.take()
            } else {
                None
            }
        })
    }

    /// Unbind whatever segment is active
    pub fn take_segment(&self) -> Result<Option<CallSegment>, IssiTesterError> {
        self.with_inner(|inner| {
            inner.call_controller = None;
            inner.segment.take()
        })
    }
}

fn incoming_segment(call_id: &str, kind: SegmentKind, priority: u8, invite: &SipRequest) -> CallSegment {
    CallSegment {
        call_id: call_id.to_string(),
        kind,
        role: CallRole::Callee,
        dialog: DialogState::Early,
        priority,
        ok_sent: false,
        scenario: None,
        invite: Some(invite.clone()),
    }
}
