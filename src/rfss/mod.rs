// Per-node RFSS emulator
//
// Holds the actors of one emulated node and turns scenario actions and
// received signaling into actor transitions and outgoing messages. Actor
// state lives in `crate::actor`; this module decides who gets which
// message and owns every deferred task (ringing, cancel, talk spurt).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::action::ScriptHost;
use crate::actor::{
    Actor, ActorState, CallRole, CallSegment, GroupLeg, MobilityListener, SegmentKind,
    ServingConditions,
};
use crate::error::IssiTesterError;
use crate::ptt::{PttControlType, PttPacket};
use crate::scenario::{CallSetup, GroupCallSetup, Roaming, Scenario, ScenarioKind, ScriptAction};
use crate::scheduler::ScenarioExecutor;
use crate::script::TestScript;
use crate::sip::message::{Method, SipMessage, SipRequest, SipResponse};
use crate::sip::{build_response, generate_branch, CallParams, IssiResponse, GROUP_HEADER};
use crate::timer::TimerService;
use crate::topology::{uri_host, uri_user, LocationMap};
use crate::trace::{Direction, SignalingLog};
use crate::transport::{Inbound, NodeTransport};
use crate::trigger::ObservedEvent;

/// Upper bound on the gap between provisional responses while a callee
/// defers its decision
pub const PROVISIONAL_INTERVAL: Duration = Duration::from_secs(60);
/// Delay between call confirmation and the designated talk spurt
pub const TALK_SPURT_DELAY: Duration = Duration::from_secs(1);
/// Length of an emulated talk spurt
pub const TALK_SPURT_LENGTH: Duration = Duration::from_secs(1);
/// Delay before a scripted unmute takes effect
pub const UNMUTE_DELAY: Duration = Duration::from_secs(1);

/// An arrived/departed notification raised by an actor on this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MobilityEvent {
    pub unit: String,
    pub rfss: String,
    pub arrived: bool,
}

/// Group call context held by the caller's serving node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupServing {
    pub call_id: String,
    pub group: String,
    pub caller: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActorStatus {
    pub id: String,
    pub state: ActorState,
    pub serving_rfss: String,
    pub call: Option<CallSegment>,
}

pub struct RfssParts {
    pub node_id: String,
    pub script: Arc<TestScript>,
    pub transport: Arc<dyn NodeTransport>,
    pub timers: Arc<TimerService>,
    pub log: Arc<SignalingLog>,
    pub script_host: Arc<dyn ScriptHost>,
}

pub struct RfssEmulator {
    node_id: String,
    domain: String,
    script: Arc<TestScript>,
    locations: LocationMap,
    actors: DashMap<String, Arc<Actor>>,
    transport: Arc<dyn NodeTransport>,
    timers: Arc<TimerService>,
    log: Arc<SignalingLog>,
    script_host: Arc<dyn ScriptHost>,
    group_calls: DashMap<String, GroupServing>,
    /// Incoming calls cancelled or displaced while their decision was pending
    abandoned: DashSet<String>,
    mobility: Mutex<Vec<MobilityEvent>>,
    call_counter: AtomicU64,
    me: Weak<RfssEmulator>,
}

impl RfssEmulator {
    pub fn new(parts: RfssParts) -> Result<Arc<Self>, IssiTesterError> {
        let topology = parts.script.topology.clone();
        let domain = topology
            .rfss(&parts.node_id)
            .map(|r| r.domain.clone())
            .ok_or_else(|| IssiTesterError::UnknownNode(parts.node_id.clone()))?;
        let actors = DashMap::new();
        for unit in topology.units() {
            actors.insert(unit.id.clone(), Arc::new(Actor::new(unit)));
        }
        Ok(Arc::new_cyclic(|me| Self {
            node_id: parts.node_id,
            domain,
            locations: topology.initial_locations(),
            script: parts.script,
            actors,
            transport: parts.transport,
            timers: parts.timers,
            log: parts.log,
            script_host: parts.script_host,
            group_calls: DashMap::new(),
            abandoned: DashSet::new(),
            mobility: Mutex::new(Vec::new()),
            call_counter: AtomicU64::new(1),
            me: me.clone(),
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn locations(&self) -> &LocationMap {
        &self.locations
    }

    pub fn actor(&self, id: &str) -> Option<Arc<Actor>> {
        self.actors.get(id).map(|a| a.value().clone())
    }

    pub fn mobility_events(&self) -> Vec<MobilityEvent> {
        self.mobility.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn group_calls(&self) -> Vec<GroupServing> {
        let mut calls: Vec<GroupServing> = self.group_calls.iter().map(|e| e.value().clone()).collect();
        calls.sort_by(|a, b| a.call_id.cmp(&b.call_id));
        calls
    }

    /// Actors this node currently serves, sorted by id
    pub fn actor_status(&self) -> Vec<ActorStatus> {
        let mut status: Vec<ActorStatus> = self
            .actors
            .iter()
            .filter(|a| self.serves(a.key()))
            .map(|a| ActorStatus {
                id: a.id().to_string(),
                state: a.state(),
                serving_rfss: a.serving_rfss(),
                call: a.segment(),
            })
            .collect();
        status.sort_by(|a, b| a.id.cmp(&b.id));
        status
    }

    fn this(&self) -> Result<Arc<Self>, IssiTesterError> {
        self.me
            .upgrade()
            .ok_or_else(|| IssiTesterError::CallControl("emulator shut down".into()))
    }

    /// Switch on every unit that starts out served by this node
    pub fn power_up(&self) -> Result<(), IssiTesterError> {
        for unit in self.script.topology.units() {
            if unit.initially_on && self.serves(&unit.id) {
                if let Some(actor) = self.actor(&unit.id) {
                    actor.set_state(ActorState::On, self)?;
                }
            }
        }
        Ok(())
    }

    fn serves(&self, unit: &str) -> bool {
        self.script.topology.self_test
            || self.locations.serving_rfss(unit).as_deref() == Some(self.node_id.as_str())
    }

    /// Actor served by this node, if any
    fn served_actor(&self, unit: &str) -> Option<Arc<Actor>> {
        if self.serves(unit) {
            self.actor(unit)
        } else {
            None
        }
    }

    /// Node that currently serves `unit`
    fn route_node(&self, unit: &str) -> Result<String, IssiTesterError> {
        if self.script.topology.self_test {
            return Ok(self.node_id.clone());
        }
        self.locations
            .serving_rfss(unit)
            .ok_or_else(|| IssiTesterError::UnknownActor(unit.to_string()))
    }

    /// Node a response goes back to: the host of the top Via
    fn response_node(&self, request: &SipRequest) -> Result<String, IssiTesterError> {
        let host = request
            .headers
            .get("Via")
            .and_then(uri_host)
            .ok_or_else(|| IssiTesterError::ParseError("request has no Via host".into()))?;
        self.script
            .topology
            .rfss_by_domain(host)
            .map(|r| r.id.clone())
            .ok_or_else(|| IssiTesterError::UnknownNode(host.to_string()))
    }

    fn next_call_id(&self) -> String {
        let n = self.call_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{:08x}@{}", self.node_id, n, rand::random::<u32>(), self.domain)
    }

    // ===== sending =====

    async fn send_sip_to_node(&self, node: &str, message: SipMessage) -> Result<(), IssiTesterError> {
        self.log
            .record(Direction::Sent, node, &ObservedEvent::Sip(message.clone()));
        self.transport.send_sip(node, message).await
    }

    async fn send_request(&self, to_unit: &str, request: SipRequest) -> Result<(), IssiTesterError> {
        let node = self.route_node(to_unit)?;
        debug!(node = %self.node_id, to = %node, method = %request.method, call_id = %request.call_id(), "sending request");
        self.send_sip_to_node(&node, SipMessage::Request(request)).await
    }

    async fn respond(&self, request: &SipRequest, response: IssiResponse) -> Result<(), IssiTesterError> {
        let node = self.response_node(request)?;
        let to_user = uri_user(&request.request_uri).unwrap_or("");
        let tag = dialog_tag(request.call_id(), to_user);
        let message = build_response(request, response, Some(&tag));
        self.send_sip_to_node(&node, SipMessage::Response(message)).await
    }

    async fn send_ptt(&self, packet: PttPacket) -> Result<(), IssiTesterError> {
        let node = self.route_node(&packet.target_unit)?;
        self.log
            .record(Direction::Sent, &node, &ObservedEvent::Ptt(packet.clone()));
        self.transport.send_ptt(&node, packet).await
    }

    fn build_request(
        &self,
        method: Method,
        from: &str,
        to: &str,
        call_id: &str,
        cseq: u32,
    ) -> Result<SipRequest, IssiTesterError> {
        let topology = &self.script.topology;
        let to_uri = topology.uri(to)?;
        let from_uri = topology.uri(from)?;
        let mut request = SipRequest::new(method.clone(), to_uri.clone());
        request.headers.add(
            "Via",
            format!(
                "SIP/2.0/UDP {};branch={}",
                self.domain,
                generate_branch(call_id, cseq, method.as_str())
            ),
        );
        request.headers.set("Max-Forwards", "70".to_string());
        request
            .headers
            .set("From", format!("<{}>;tag={}", from_uri, dialog_tag(call_id, from)));
        request.headers.set("To", format!("<{}>", to_uri));
        request.headers.set("Call-ID", call_id.to_string());
        let mut cseq_buf = itoa::Buffer::new();
        request
            .headers
            .set("CSeq", format!("{} {}", cseq_buf.format(cseq), method));
        request
            .headers
            .set("Contact", format!("<sip:{}@{}>", from, self.domain));
        Ok(request)
    }

    // ===== scenario actions =====

    async fn call_setup(&self, scenario: &Scenario, setup: &CallSetup) -> Result<(), IssiTesterError> {
        let Some(actor) = self.served_actor(&setup.caller) else {
            debug!(node = %self.node_id, actor = %setup.caller, "caller not served here");
            return Ok(());
        };
        let priority = setup.priority.unwrap_or_else(|| actor.transmit_priority());
        let call_id = self.next_call_id();
        actor.begin_call_setup(
            &scenario.id,
            &call_id,
            SegmentKind::Unit {
                peer: setup.callee.clone(),
            },
            priority,
        )?;

        let mut invite = self.build_request(Method::Invite, &setup.caller, &setup.callee, &call_id, 1)?;
        CallParams {
            priority,
            emergency: setup.emergency,
            full_duplex: setup.full_duplex,
            protected: setup.protected,
            availability_check: setup.availability_check,
            in_call_roam: setup.in_call_roam,
        }
        .apply(&mut invite.headers);

        info!(node = %self.node_id, actor = %setup.caller, callee = %setup.callee, call_id = %call_id, priority, "placing call");
        if let Err(e) = self.send_request(&setup.callee, invite).await {
            actor.clear_call(&call_id)?;
            return Err(e);
        }
        if let Some(delay) = setup.cancel_after {
            self.arm_cancel(&actor, &call_id, delay)?;
        }
        Ok(())
    }

    async fn group_call_setup(
        &self,
        scenario: &Scenario,
        setup: &GroupCallSetup,
    ) -> Result<(), IssiTesterError> {
        let Some(actor) = self.served_actor(&setup.caller) else {
            debug!(node = %self.node_id, actor = %setup.caller, "group caller not served here");
            return Ok(());
        };
        let group = self
            .script
            .topology
            .group(&setup.group)
            .ok_or_else(|| IssiTesterError::UnknownGroup(setup.group.clone()))?;
        let members: Vec<String> = group
            .members
            .iter()
            .filter(|m| **m != setup.caller)
            .cloned()
            .collect();
        let priority = setup.priority.unwrap_or_else(|| actor.transmit_priority());
        let call_id = self.next_call_id();
        let legs = members
            .iter()
            .map(|unit| GroupLeg {
                unit: unit.clone(),
                answered: false,
            })
            .collect();
        actor.begin_call_setup(
            &scenario.id,
            &call_id,
            SegmentKind::Group {
                group: setup.group.clone(),
                legs,
            },
            priority,
        )?;
        self.group_calls.insert(
            call_id.clone(),
            GroupServing {
                call_id: call_id.clone(),
                group: setup.group.clone(),
                caller: setup.caller.clone(),
                members: members.clone(),
            },
        );

        let params = CallParams {
            priority,
            emergency: setup.emergency,
            protected: setup.protected,
            ..Default::default()
        };
        info!(node = %self.node_id, actor = %setup.caller, group = %setup.group, call_id = %call_id, members = members.len(), "placing group call");
        for member in &members {
            let mut invite = self.build_request(Method::Invite, &setup.caller, member, &call_id, 1)?;
            params.apply(&mut invite.headers);
            invite.headers.set(GROUP_HEADER, setup.group.clone());
            if let Err(e) = self.send_request(member, invite).await {
                warn!(node = %self.node_id, member = %member, error = %e, "group leg not sent");
                actor.handle_setup_rejected(&call_id, member)?;
            }
        }
        if actor.segment().is_none() {
            self.group_calls.remove(&call_id);
            return Err(IssiTesterError::CallControl(format!(
                "no member of {} reachable",
                setup.group
            )));
        }
        if let Some(delay) = setup.cancel_after {
            self.arm_cancel(&actor, &call_id, delay)?;
        }
        Ok(())
    }

    fn arm_cancel(&self, actor: &Arc<Actor>, call_id: &str, delay: Duration) -> Result<(), IssiTesterError> {
        let this = self.this()?;
        let actor = actor.clone();
        let call_id = call_id.to_string();
        self.timers.schedule(delay, async move {
            if let Err(e) = this.cancel_call(&actor, &call_id).await {
                warn!(actor = %actor.id(), call_id = %call_id, error = %e, "cancel failed");
            }
        });
        Ok(())
    }

    /// Send CANCEL for a pending outgoing call. A group call is cancelled
    /// as a whole: pending legs get CANCEL, answered legs get BYE.
    async fn cancel_call(&self, actor: &Actor, call_id: &str) -> Result<(), IssiTesterError> {
        let targets = match actor.segment() {
            Some(
                segment @ CallSegment {
                    kind: SegmentKind::Group { .. },
                    role: CallRole::Caller,
                    ..
                },
            ) if segment.call_id == call_id => return self.cancel_group_call(actor, &segment).await,
            Some(segment) if actor.can_cancel(call_id) => segment.peers(),
            _ => Vec::new(),
        };
        if targets.is_empty() {
            debug!(actor = %actor.id(), call_id, "nothing left to cancel");
            return Ok(());
        }
        info!(node = %self.node_id, actor = %actor.id(), call_id, legs = targets.len(), "cancelling call");
        for target in targets {
            let cancel = self.build_request(Method::Cancel, actor.id(), &target, call_id, 1)?;
            self.send_request(&target, cancel).await?;
        }
        Ok(())
    }

    async fn cancel_group_call(&self, actor: &Actor, segment: &CallSegment) -> Result<(), IssiTesterError> {
        let call_id = segment.call_id.as_str();
        let pending = actor.unanswered_legs(call_id);
        let answered = connected_peers(segment);
        info!(
            node = %self.node_id,
            actor = %actor.id(),
            call_id,
            pending = pending.len(),
            answered = answered.len(),
            "cancelling group call"
        );
        actor.clear_call(call_id)?;
        self.group_calls.remove(call_id);
        for target in pending {
            let cancel = self.build_request(Method::Cancel, actor.id(), &target, call_id, 1)?;
            self.send_request(&target, cancel).await?;
        }
        for target in answered {
            let bye = self.build_request(Method::Bye, actor.id(), &target, call_id, 2)?;
            self.send_request(&target, bye).await?;
        }
        Ok(())
    }

    async fn terminate_call(&self, actor_id: &str) -> Result<(), IssiTesterError> {
        let Some(actor) = self.served_actor(actor_id) else {
            return Ok(());
        };
        let Some(segment) = actor.segment() else {
            debug!(node = %self.node_id, actor = %actor_id, "no call to terminate");
            return Ok(());
        };
        if !segment.is_confirmed() && segment.role == CallRole::Caller {
            self.cancel_call(&actor, &segment.call_id).await?;
        } else {
            for peer in connected_peers(&segment) {
                let bye = self.build_request(Method::Bye, actor_id, &peer, &segment.call_id, 2)?;
                self.send_request(&peer, bye).await?;
            }
        }
        actor.clear_call(&segment.call_id)?;
        self.group_calls.remove(&segment.call_id);
        info!(node = %self.node_id, actor = %actor_id, call_id = %segment.call_id, "call terminated");
        Ok(())
    }

    async fn roam(&self, roaming: &Roaming) -> Result<(), IssiTesterError> {
        let actor = self
            .actor(&roaming.actor)
            .ok_or_else(|| IssiTesterError::UnknownActor(roaming.actor.clone()))?;
        let previous = self.locations.move_unit(&roaming.actor, &roaming.destination);
        info!(
            node = %self.node_id,
            actor = %roaming.actor,
            from = ?previous,
            to = %roaming.destination,
            "unit roaming"
        );
        let left = previous
            .as_deref()
            .filter(|p| *p != roaming.destination.as_str());
        if roaming.initiated_by_home && actor.home_rfss() == self.node_id {
            if let Some(previous) = left.filter(|p| *p != self.node_id) {
                self.deregister(&roaming.actor, previous).await?;
            }
        }
        if left == Some(self.node_id.as_str()) {
            actor.set_state(ActorState::Off, self)?;
        }
        actor.set_serving_rfss(&roaming.destination)?;
        let arriving_here = roaming.destination == self.node_id || self.script.topology.self_test;
        if arriving_here && actor.segment().is_none() {
            actor.set_state(ActorState::On, self)?;
        }
        Ok(())
    }

    /// REGISTER with Expires 0 telling `node` the unit has left it
    async fn deregister(&self, unit: &str, node: &str) -> Result<(), IssiTesterError> {
        let rfss = self
            .script
            .topology
            .rfss(node)
            .ok_or_else(|| IssiTesterError::UnknownNode(node.to_string()))?;
        let call_id = self.next_call_id();
        let mut register = self.build_request(Method::Register, unit, unit, &call_id, 1)?;
        register.request_uri = format!("sip:{}", rfss.domain);
        register.headers.set("Expires", "0".to_string());
        register.headers.set("Contact", "*".to_string());
        self.send_sip_to_node(node, SipMessage::Request(register)).await
    }

    async fn actor_script(&self, action: &ScriptAction) -> Result<(), IssiTesterError> {
        let Some(actor) = self.served_actor(&action.target) else {
            return Ok(());
        };
        match action.method.as_str() {
            "power_on" => {
                actor.set_state(ActorState::On, self)?;
            }
            "power_off" => {
                actor.set_state(ActorState::Off, self)?;
            }
            "mute" => self.send_to_call_peers(&actor, PttControlType::Mute).await?,
            "unmute" => {
                let this = self.this()?;
                self.timers.schedule(UNMUTE_DELAY, async move {
                    if let Err(e) = this.send_to_call_peers(&actor, PttControlType::Unmute).await {
                        warn!(actor = %actor.id(), error = %e, "unmute failed");
                    }
                });
            }
            "talk_spurt" => {
                if let Some(segment) = actor.segment() {
                    self.schedule_talk_spurt(actor.id(), &segment.call_id, Duration::ZERO)?;
                }
            }
            other => self.script_host.invoke(&action.target, other)?,
        }
        Ok(())
    }

    async fn send_to_call_peers(&self, actor: &Actor, control: PttControlType) -> Result<(), IssiTesterError> {
        let Some(segment) = actor.segment() else {
            debug!(actor = %actor.id(), control = %control, "no call, packet not sent");
            return Ok(());
        };
        for peer in connected_peers(&segment) {
            self.send_ptt(PttPacket::new(control, &segment.call_id, actor.id(), peer))
                .await?;
        }
        Ok(())
    }

    fn schedule_talk_spurt(&self, actor_id: &str, call_id: &str, delay: Duration) -> Result<(), IssiTesterError> {
        let this = self.this()?;
        let actor_id = actor_id.to_string();
        let call_id = call_id.to_string();
        self.timers.schedule(delay, async move {
            let Some(actor) = this.actor(&actor_id) else {
                return;
            };
            if actor.segment().is_some_and(|s| s.call_id == call_id) {
                debug!(actor = %actor_id, call_id = %call_id, "requesting talk spurt");
                if let Err(e) = this.send_to_call_peers(&actor, PttControlType::SpurtRequest).await {
                    warn!(actor = %actor_id, error = %e, "talk spurt request failed");
                }
            }
        });
        Ok(())
    }

    /// Whether `actor` is the designated talk-spurt sender of the call
    fn is_talk_spurt_sender(&self, actor: &str, segment: &CallSegment) -> bool {
        let designated = |sender: &Option<String>| sender.as_deref() == Some(actor);
        if let Some(id) = &segment.scenario {
            return match self.script.scenario(id).map(|s| &s.kind) {
                Some(ScenarioKind::CallSetup(s)) => designated(&s.talk_spurt_sender),
                Some(ScenarioKind::GroupCallSetup(s)) => designated(&s.talk_spurt_sender),
                _ => false,
            };
        }
        let peers = segment.peers();
        self.script.scenarios().iter().any(|s| match (&s.kind, &segment.kind) {
            (ScenarioKind::CallSetup(c), SegmentKind::Unit { peer }) => {
                c.callee == actor && c.caller == *peer && designated(&c.talk_spurt_sender)
            }
            (ScenarioKind::GroupCallSetup(g), SegmentKind::Group { group, .. }) => {
                g.group == *group && peers.contains(&g.caller) && designated(&g.talk_spurt_sender)
            }
            _ => false,
        })
    }

    // ===== inbound =====

    /// Record and handle one message delivered to this node
    pub async fn handle_inbound(&self, inbound: &Inbound) {
        self.log
            .record(Direction::Received, &inbound.from_node, &inbound.event);
        let result = match &inbound.event {
            ObservedEvent::Sip(SipMessage::Request(request)) => self.on_request(request).await,
            ObservedEvent::Sip(SipMessage::Response(response)) => self.on_response(response).await,
            ObservedEvent::Ptt(packet) => self.on_ptt(packet).await,
        };
        if let Err(e) = result {
            warn!(
                node = %self.node_id,
                from = %inbound.from_node,
                event = %inbound.event.summary(),
                error = %e,
                "failed to handle inbound message"
            );
        }
    }

    async fn on_request(&self, request: &SipRequest) -> Result<(), IssiTesterError> {
        if request.method == Method::Register {
            info!(node = %self.node_id, unit = ?request.headers.get("From").and_then(uri_user), "unit deregistered");
            return self.respond(request, IssiResponse::Accepted).await;
        }
        let target = uri_user(&request.request_uri).unwrap_or("").to_string();
        match request.method {
            Method::Invite => self.on_invite(&target, request).await,
            Method::Ack => self.on_ack(&target, request),
            Method::Cancel => self.on_cancel(&target, request).await,
            Method::Bye => self.on_bye(&target, request).await,
            _ => self.respond(request, IssiResponse::Accepted).await,
        }
    }

    async fn on_invite(&self, target: &str, invite: &SipRequest) -> Result<(), IssiTesterError> {
        let call_id = invite.call_id().to_string();
        let actor = match self.served_actor(target) {
            Some(actor) if actor.state() == ActorState::On => actor,
            _ => {
                info!(node = %self.node_id, actor = %target, call_id = %call_id, "callee unreachable, busy");
                return self.respond(invite, IssiResponse::Busy).await;
            }
        };
        let caller = invite
            .headers
            .get("From")
            .and_then(uri_user)
            .unwrap_or("")
            .to_string();
        let params = CallParams::from_headers(&invite.headers);
        let kind = match invite.headers.get(GROUP_HEADER) {
            Some(group) => SegmentKind::Group {
                group: group.to_string(),
                legs: vec![GroupLeg {
                    unit: caller,
                    answered: true,
                }],
            },
            None => SegmentKind::Unit { peer: caller },
        };
        actor.bind_incoming(&call_id, kind.clone(), params.priority, invite)?;

        let delay = actor.callee_processing_delay_secs();
        if delay == 0 {
            return self.answer(&actor, invite, kind, params).await;
        }
        let this = self.this()?;
        let invite = invite.clone();
        self.timers.schedule(Duration::ZERO, async move {
            let mut remaining = Duration::from_secs(delay);
            while !remaining.is_zero() {
                if this.abandoned.remove(invite.call_id()).is_some() {
                    return;
                }
                if let Err(e) = this.respond(&invite, IssiResponse::Ringing).await {
                    warn!(call_id = %invite.call_id(), error = %e, "provisional response failed");
                }
                let step = remaining.min(PROVISIONAL_INTERVAL);
                tokio::time::sleep(step).await;
                remaining -= step;
            }
            if let Err(e) = this.answer(&actor, &invite, kind, params).await {
                warn!(call_id = %invite.call_id(), error = %e, "deferred answer failed");
            }
        });
        Ok(())
    }

    /// Run the decision table and send its responses
    async fn answer(
        &self,
        actor: &Actor,
        invite: &SipRequest,
        kind: SegmentKind,
        params: CallParams,
    ) -> Result<(), IssiTesterError> {
        let call_id = invite.call_id();
        if self.abandoned.remove(call_id).is_some() {
            debug!(actor = %actor.id(), call_id, "call abandoned before answer");
            return Ok(());
        }
        let serving = self
            .script
            .topology
            .rfss(&self.node_id)
            .map(|r| ServingConditions {
                rf_resources_available: r.rf_resources_available,
                availability_check_supported: r.availability_check_supported,
            })
            .ok_or_else(|| IssiTesterError::UnknownNode(self.node_id.clone()))?;
        let decision = actor.decide_setup(call_id, &params, serving);
        info!(node = %self.node_id, actor = %actor.id(), call_id, decision = ?decision, "call setup decision");

        if decision.accepts() {
            if let Some(displaced) = actor.accept_incoming(call_id, kind, params.priority, invite)? {
                self.release_displaced(actor, displaced).await?;
            }
        } else {
            actor.clear_call(call_id)?;
        }
        for response in decision.responses() {
            self.respond(invite, response).await?;
        }
        Ok(())
    }

    /// Tear down a pending segment pushed out by a higher-priority setup
    async fn release_displaced(&self, actor: &Actor, displaced: CallSegment) -> Result<(), IssiTesterError> {
        info!(actor = %actor.id(), call_id = %displaced.call_id, "pending call preempted");
        match (displaced.role, &displaced.invite) {
            (CallRole::Callee, Some(invite)) => {
                self.abandoned.insert(displaced.call_id.clone());
                self.respond(invite, IssiResponse::RequestTerminated).await
            }
            _ => {
                for peer in displaced.peers() {
                    let cancel = self.build_request(Method::Cancel, actor.id(), &peer, &displaced.call_id, 1)?;
                    self.send_request(&peer, cancel).await?;
                }
                self.group_calls.remove(&displaced.call_id);
                Ok(())
            }
        }
    }

    fn on_ack(&self, target: &str, ack: &SipRequest) -> Result<(), IssiTesterError> {
        let Some(actor) = self.served_actor(target) else {
            return Ok(());
        };
        if !actor.handle_call_setup_confirm(ack.call_id())? {
            debug!(actor = %target, call_id = %ack.call_id(), "ACK without a matching answer");
            return Ok(());
        }
        info!(node = %self.node_id, actor = %target, call_id = %ack.call_id(), "call confirmed");
        if let Some(segment) = actor.segment() {
            if self.is_talk_spurt_sender(target, &segment) {
                self.schedule_talk_spurt(target, &segment.call_id, TALK_SPURT_DELAY)?;
            }
        }
        Ok(())
    }

    async fn on_cancel(&self, target: &str, cancel: &SipRequest) -> Result<(), IssiTesterError> {
        let call_id = cancel.call_id();
        let pending = self
            .served_actor(target)
            .and_then(|actor| actor.segment().map(|s| (actor, s)))
            .filter(|(_, s)| s.call_id == call_id && !s.is_confirmed());
        let Some((actor, segment)) = pending else {
            return self.respond(cancel, IssiResponse::CallDoesNotExist).await;
        };
        self.respond(cancel, IssiResponse::Accepted).await?;
        actor.clear_call(call_id)?;
        if !segment.ok_sent {
            // Stops the deferred decision still ringing for this call
            self.abandoned.insert(call_id.to_string());
        }
        if let Some(invite) = &segment.invite {
            self.respond(invite, IssiResponse::RequestTerminated).await?;
        }
        info!(node = %self.node_id, actor = %target, call_id, "call cancelled by caller");
        Ok(())
    }

    async fn on_bye(&self, target: &str, bye: &SipRequest) -> Result<(), IssiTesterError> {
        let call_id = bye.call_id();
        let Some(actor) = self.served_actor(target) else {
            return self.respond(bye, IssiResponse::CallDoesNotExist).await;
        };
        let from = bye.headers.get("From").and_then(uri_user).unwrap_or("");
        let cleared = match actor.segment() {
            Some(segment) if segment.call_id == call_id => {
                let group_caller = segment.role == CallRole::Caller
                    && matches!(segment.kind, SegmentKind::Group { .. });
                if group_caller {
                    // One member left; the call ends with its last leg
                    if actor.handle_setup_rejected(call_id, from)?.is_some() {
                        self.group_calls.remove(call_id);
                    }
                } else {
                    actor.clear_call(call_id)?;
                }
                true
            }
            _ => false,
        };
        if cleared {
            info!(node = %self.node_id, actor = %target, call_id, "call released by peer");
            self.respond(bye, IssiResponse::Accepted).await
        } else {
            self.respond(bye, IssiResponse::CallDoesNotExist).await
        }
    }

    async fn on_response(&self, response: &SipResponse) -> Result<(), IssiTesterError> {
        if response.cseq_method() != Some(Method::Invite) || response.is_provisional() {
            debug!(node = %self.node_id, response = %response.status_code, call_id = %response.call_id(), "response observed");
            return Ok(());
        }
        let call_id = response.call_id();
        let caller = response.headers.get("From").and_then(uri_user).unwrap_or("");
        let callee = response.headers.get("To").and_then(uri_user).unwrap_or("");
        let Some(actor) = self.served_actor(caller) else {
            return Ok(());
        };

        if response.is_success() {
            let accepted = actor.handle_setup_accepted(call_id, callee)?;
            let ack = self.build_request(Method::Ack, caller, callee, call_id, 1)?;
            self.send_request(callee, ack).await?;
            if !accepted {
                // Answered after we gave up on the call
                let bye = self.build_request(Method::Bye, caller, callee, call_id, 2)?;
                return self.send_request(callee, bye).await;
            }
            info!(node = %self.node_id, actor = %caller, peer = %callee, call_id, "call accepted");
            if let Some(segment) = actor.segment() {
                if self.is_talk_spurt_sender(caller, &segment) {
                    self.schedule_talk_spurt(caller, call_id, TALK_SPURT_DELAY)?;
                }
            }
        } else if response.status_code >= 300 {
            info!(node = %self.node_id, actor = %caller, peer = %callee, call_id, status = response.status_code, "call setup rejected");
            if actor.handle_setup_rejected(call_id, callee)?.is_some() {
                self.group_calls.remove(call_id);
            }
        }
        Ok(())
    }

    async fn on_ptt(&self, packet: &PttPacket) -> Result<(), IssiTesterError> {
        let Some(actor) = self.served_actor(&packet.target_unit) else {
            return Ok(());
        };
        if let Some(control) = packet.reply_control() {
            return self.send_ptt(packet.reply(control)).await;
        }
        match packet.control {
            PttControlType::SpurtGrant => {
                if !actor.segment().is_some_and(|s| s.call_id == packet.session) {
                    return Ok(());
                }
                let start = packet.reply(PttControlType::SpurtStart);
                let mut progress = start.clone();
                progress.control = PttControlType::SpurtProgress;
                progress.sequence = start.sequence.wrapping_add(1);
                let mut end = progress.clone();
                end.control = PttControlType::SpurtEnd;
                end.sequence = progress.sequence.wrapping_add(1);
                self.send_ptt(start).await?;
                self.send_ptt(progress).await?;
                let this = self.this()?;
                self.timers.schedule(TALK_SPURT_LENGTH, async move {
                    if let Err(e) = this.send_ptt(end).await {
                        warn!(error = %e, "spurt end failed");
                    }
                });
            }
            control => {
                debug!(actor = %packet.target_unit, control = %control, session = %packet.session, "PTT packet received");
            }
        }
        Ok(())
    }
}

impl MobilityListener for RfssEmulator {
    fn arrived(&self, unit: &str, rfss: &str) {
        info!(node = %self.node_id, unit, rfss, "unit arrived");
        if let Ok(mut events) = self.mobility.lock() {
            events.push(MobilityEvent {
                unit: unit.to_string(),
                rfss: rfss.to_string(),
                arrived: true,
            });
        }
    }

    fn departed(&self, unit: &str, rfss: &str) {
        info!(node = %self.node_id, unit, rfss, "unit departed");
        if let Ok(mut events) = self.mobility.lock() {
            events.push(MobilityEvent {
                unit: unit.to_string(),
                rfss: rfss.to_string(),
                arrived: false,
            });
        }
    }
}

#[async_trait]
impl ScenarioExecutor for RfssEmulator {
    async fn execute(&self, scenario: &Scenario) -> Result<(), IssiTesterError> {
        match &scenario.kind {
            ScenarioKind::CallSetup(setup) => self.call_setup(scenario, setup).await,
            ScenarioKind::GroupCallSetup(setup) => self.group_call_setup(scenario, setup).await,
            ScenarioKind::Roaming(roaming) => self.roam(roaming).await,
            ScenarioKind::ActorScript(action) => self.actor_script(action).await,
            ScenarioKind::NodeScript(action) if action.target == self.node_id => {
                self.script_host.invoke(&action.target, &action.method)
            }
            ScenarioKind::NodeScript(_) => Ok(()),
            ScenarioKind::CallTerminator { actor } => self.terminate_call(actor).await,
        }
    }
}

/// Peers media packets go to: every unit leg, and answered group legs
fn connected_peers(segment: &CallSegment) -> Vec<String> {
    match &segment.kind {
        SegmentKind::Unit { peer } => vec![peer.clone()],
        SegmentKind::Group { legs, .. } => legs
            .iter()
            .filter(|l| l.answered)
            .map(|l| l.unit.clone())
            .collect(),
    }
}

/// Stable per-dialog tag for one side of a call
fn dialog_tag(call_id: &str, unit: &str) -> String {
    let mut hasher = DefaultHasher::new();
    call_id.hash(&mut hasher);
    unit.hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}
