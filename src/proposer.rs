//! The proposer drives the synod protocol round-by-round for queued values.  Rounds are unique to
//! a proposer by construction: proposer p of P starts at round p and strides by P, so competing
//! proposers can always supersede one another without ever colliding.  A round that makes no
//! quorum progress within [ROUND_TIMEOUT] is abandoned and the proposer backs off multiplicatively
//! (with jitter) before contending again; backoff resets the moment a quorum answers.
//!
//! The state machine returns explicit [Outbound] effects instead of touching sockets, so every
//! quorum rule can be checked by feeding it messages.
//!
//! Phase-1b replies carry the acceptor's previously accepted (round, value) pair, and a quorum of
//! them binds the proposer: it must propose the value of the highest accepted round it saw, and
//! may fall back to its own value only when the quorum reported nothing.  A queued value is only
//! removed when it is decided, so adopting a competitor's value never loses our own; it is simply
//! re-proposed under a later round.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use guacamole::combinators::any;
use guacamole::Guacamole;
use indicio::clue;

use crate::config::Configuration;
use crate::multicast;
use crate::wire::{is_end_marker, EndMarker, Message};
use crate::{
    Error, ACCEPTOR_MAJORITY, COLLECTOR, EXPECTED_CLIENTS, MAX_BACKOFF, MIN_BACKOFF,
    QUEUE_CAPACITY, ROUND_TIMEOUT, TOTAL_PROPOSERS,
};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static SUBMISSIONS: biometrics::Counter = biometrics::Counter::new("synod.proposer.submissions");
static DUPLICATE_SUBMISSIONS: biometrics::Counter =
    biometrics::Counter::new("synod.proposer.duplicate_submissions");
static QUEUE_OVERFLOW: biometrics::Counter =
    biometrics::Counter::new("synod.proposer.queue_overflow");
static END_MARKERS: biometrics::Counter = biometrics::Counter::new("synod.proposer.end_markers");
static ROUNDS_STARTED: biometrics::Counter =
    biometrics::Counter::new("synod.proposer.rounds.started");
static ROUNDS_ABANDONED: biometrics::Counter =
    biometrics::Counter::new("synod.proposer.rounds.abandoned");
static ROUNDS_DECIDED: biometrics::Counter =
    biometrics::Counter::new("synod.proposer.rounds.decided");
static ADOPTIONS: biometrics::Counter = biometrics::Counter::new("synod.proposer.adoptions");
static PEER_DECISIONS: biometrics::Counter =
    biometrics::Counter::new("synod.proposer.peer_decisions");

/// Registers this module's biometrics with the provided Collector.
pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&SUBMISSIONS);
    collector.register_counter(&DUPLICATE_SUBMISSIONS);
    collector.register_counter(&QUEUE_OVERFLOW);
    collector.register_counter(&END_MARKERS);
    collector.register_counter(&ROUNDS_STARTED);
    collector.register_counter(&ROUNDS_ABANDONED);
    collector.register_counter(&ROUNDS_DECIDED);
    collector.register_counter(&ADOPTIONS);
    collector.register_counter(&PEER_DECISIONS);
}

////////////////////////////////////////////// Outbound ////////////////////////////////////////////

/// Destination group for an [Outbound] effect.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Group {
    Proposers,
    Acceptors,
    Learners,
}

/// One message the proposer wants on the wire.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Outbound {
    pub group: Group,
    pub message: Message,
}

impl Outbound {
    fn to(group: Group, message: Message) -> Self {
        Self { group, message }
    }
}

///////////////////////////////////////////// Proposer /////////////////////////////////////////////

struct ActiveRound {
    round: u64,
    /// The queued value this round was started for.  Stays at the front of its queue until some
    /// round decides it.
    value: String,
    /// The value actually sent in phase 2, once phase 1 makes quorum.  May differ from `value`
    /// when an acceptor reported a previously accepted pair.
    proposing: Option<String>,
    /// Highest previously accepted (round, value) reported by any phase-1b so far.
    adopted: Option<(u64, String)>,
    phase1b: HashSet<u64>,
    phase2b: HashSet<u64>,
    phase2_sent: bool,
    started: Instant,
}

/// The proposer state machine.
pub struct Proposer {
    id: u64,
    round_number: u64,
    queue_regular: VecDeque<String>,
    queue_end: VecDeque<String>,
    active: Option<ActiveRound>,
    decided: HashSet<String>,
    client_counts: HashMap<u64, u64>,
    values_decided: u64,
    end_markers_seen: HashSet<String>,
    backoff: Duration,
}

impl Proposer {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            round_number: id,
            queue_regular: VecDeque::new(),
            queue_end: VecDeque::new(),
            active: None,
            decided: HashSet::new(),
            client_counts: HashMap::new(),
            values_decided: 0,
            end_markers_seen: HashSet::new(),
            backoff: MIN_BACKOFF,
        }
    }

    /// Demultiplex one received message.
    pub fn handle_message(&mut self, message: &Message) -> Vec<Outbound> {
        match message {
            Message::Submission { value } if is_end_marker(value) => {
                self.handle_end_marker(value);
                vec![]
            }
            Message::Submission { value } => {
                self.handle_submission(value);
                vec![]
            }
            Message::Decision { value } => {
                self.handle_peer_decision(value);
                vec![]
            }
            Message::Phase1B {
                round,
                acceptor,
                accepted,
            } => self.handle_phase1b(*round, *acceptor, accepted),
            Message::Phase2B {
                round,
                value,
                acceptor,
            } => self.handle_phase2b(*round, value, *acceptor),
            _ => vec![],
        }
    }

    fn handle_end_marker(&mut self, value: &str) {
        if let Some(marker) = EndMarker::parse(value) {
            self.client_counts.insert(marker.client, marker.count);
        }
        if self.end_markers_seen.insert(value.to_string()) {
            END_MARKERS.click();
            clue!(COLLECTOR, indicio::INFO, {
                proposer: self.id,
                end_marker: value,
            });
            if !self.decided.contains(value) && !self.queue_end.iter().any(|queued| queued == value)
            {
                self.queue_end.push_back(value.to_string());
            }
        }
    }

    fn handle_submission(&mut self, value: &str) {
        if self.decided.contains(value) || self.queue_regular.iter().any(|queued| queued == value) {
            DUPLICATE_SUBMISSIONS.click();
            return;
        }
        if self.queue_regular.len() >= QUEUE_CAPACITY {
            QUEUE_OVERFLOW.click();
            self.queue_regular.pop_front();
        }
        SUBMISSIONS.click();
        self.queue_regular.push_back(value.to_string());
    }

    fn handle_peer_decision(&mut self, value: &str) {
        if self.decided.contains(value) {
            return;
        }
        PEER_DECISIONS.click();
        clue!(COLLECTOR, indicio::INFO, {
            proposer: self.id,
            peer_decided: value,
        });
        self.commit(value);
    }

    fn handle_phase1b(
        &mut self,
        round: u64,
        acceptor: u64,
        accepted: &Option<(u64, String)>,
    ) -> Vec<Outbound> {
        let Some(active) = self.active.as_mut() else {
            return vec![];
        };
        if round != active.round || active.phase2_sent {
            return vec![];
        }
        active.phase1b.insert(acceptor);
        if let Some((accepted_round, accepted_value)) = accepted {
            let highest = active.adopted.as_ref().map(|(r, _)| *r).unwrap_or(0);
            if *accepted_round > highest {
                active.adopted = Some((*accepted_round, accepted_value.clone()));
            }
        }
        if active.phase1b.len() < ACCEPTOR_MAJORITY {
            return vec![];
        }
        let value = match active.adopted.as_ref() {
            Some((_, adopted)) => {
                ADOPTIONS.click();
                adopted.clone()
            }
            None => active.value.clone(),
        };
        active.proposing = Some(value.clone());
        active.phase2_sent = true;
        self.backoff = MIN_BACKOFF;
        clue!(COLLECTOR, indicio::DEBUG, {
            proposer: self.id,
            phase2a: round,
            value: &value,
        });
        vec![Outbound::to(
            Group::Acceptors,
            Message::Phase2A { round, value },
        )]
    }

    fn handle_phase2b(&mut self, round: u64, value: &str, acceptor: u64) -> Vec<Outbound> {
        let Some(active) = self.active.as_mut() else {
            return vec![];
        };
        if round != active.round || !active.phase2_sent {
            return vec![];
        }
        let Some(proposing) = active.proposing.as_ref() else {
            return vec![];
        };
        if value != proposing {
            return vec![];
        }
        active.phase2b.insert(acceptor);
        if active.phase2b.len() < ACCEPTOR_MAJORITY {
            return vec![];
        }
        let decided = proposing.clone();
        self.active = None;
        self.backoff = MIN_BACKOFF;
        self.commit(&decided);
        ROUNDS_DECIDED.click();
        clue!(COLLECTOR, indicio::INFO, {
            proposer: self.id,
            decided: &decided,
            round: round,
        });
        let message = Message::Decision { value: decided };
        vec![
            Outbound::to(Group::Learners, message.clone()),
            Outbound::to(Group::Proposers, message),
        ]
    }

    /// Record a value as decided and drop it from whichever queue holds it.
    fn commit(&mut self, value: &str) {
        if self.decided.insert(value.to_string()) && !is_end_marker(value) {
            self.values_decided += 1;
        }
        let queue = if is_end_marker(value) {
            &mut self.queue_end
        } else {
            &mut self.queue_regular
        };
        if let Some(position) = queue.iter().position(|queued| queued == value) {
            queue.remove(position);
        }
    }

    /// Abandon a round that has outlived [ROUND_TIMEOUT].  Returns the grown backoff for the
    /// caller to sleep; a competing higher round gets a window to make progress.
    pub fn tick(&mut self, now: Instant) -> Option<Duration> {
        let active = self.active.as_ref()?;
        if now.duration_since(active.started) <= ROUND_TIMEOUT {
            return None;
        }
        ROUNDS_ABANDONED.click();
        clue!(COLLECTOR, indicio::DEBUG, {
            proposer: self.id,
            abandoned: active.round,
        });
        self.active = None;
        self.backoff = std::cmp::min(self.backoff * 3 / 2, MAX_BACKOFF);
        Some(self.backoff)
    }

    /// Start a round for the next pending value, if idle and anything is pending.  Data values
    /// drain before end markers so the termination handshake cannot overtake the payload.
    pub fn start_round(&mut self, now: Instant) -> Option<Outbound> {
        if self.active.is_some() {
            return None;
        }
        let value = self
            .queue_regular
            .front()
            .or_else(|| self.queue_end.front())?
            .clone();
        self.round_number += TOTAL_PROPOSERS;
        let round = self.round_number;
        self.active = Some(ActiveRound {
            round,
            value: value.clone(),
            proposing: None,
            adopted: None,
            phase1b: HashSet::new(),
            phase2b: HashSet::new(),
            phase2_sent: false,
            started: now,
        });
        ROUNDS_STARTED.click();
        clue!(COLLECTOR, indicio::DEBUG, {
            proposer: self.id,
            round: round,
            proposing: &value,
        });
        Some(Outbound::to(
            Group::Acceptors,
            Message::Phase1A { round },
        ))
    }

    /// The termination check: idle, nothing pending, an end marker from every expected client, and
    /// every promised value decided.  Returns the end marker to announce before exiting.
    pub fn finished(&self) -> Option<EndMarker> {
        if self.active.is_some()
            || !self.queue_regular.is_empty()
            || !self.queue_end.is_empty()
            || self.end_markers_seen.len() < EXPECTED_CLIENTS
        {
            return None;
        }
        let expected: u64 = self.client_counts.values().sum();
        if expected == 0 || self.values_decided < expected {
            return None;
        }
        Some(EndMarker {
            client: self.id,
            count: self.values_decided,
        })
    }
}

/////////////////////////////////////////////// run ////////////////////////////////////////////////

/// Run a proposer until the termination check passes.
pub fn run_proposer(id: u64, config: &Configuration) -> Result<(), Error> {
    let socket = multicast::receiver(config.proposers)?;
    let learners = multicast::sender()?;
    let mut proposer = Proposer::new(id);
    let mut guac = Guacamole::new(id);
    let mut buf = [0u8; multicast::DATAGRAM_MAX];
    clue!(COLLECTOR, indicio::INFO, {
        proposer: id,
        starting: true,
    });
    loop {
        if let Some(backoff) = proposer.tick(Instant::now()) {
            std::thread::sleep(jittered(&mut guac, backoff));
            continue;
        }
        let mut outbound = Vec::new();
        if let Some(text) = multicast::recv(&socket, &mut buf) {
            if let Some(message) = Message::parse(&text) {
                outbound.extend(proposer.handle_message(&message));
            }
        }
        if let Some(out) = proposer.start_round(Instant::now()) {
            outbound.push(out);
        }
        for out in outbound {
            let (via, group) = match out.group {
                Group::Proposers => (&socket, config.proposers),
                Group::Acceptors => (&socket, config.acceptors),
                Group::Learners => (&learners, config.learners),
            };
            multicast::send(via, group, &out.message.to_string());
        }
        if let Some(marker) = proposer.finished() {
            let marker = marker.to_string();
            multicast::send(&socket, config.acceptors, &marker);
            multicast::send(&socket, config.learners, &marker);
            clue!(COLLECTOR, indicio::INFO, {
                proposer: id,
                finished: &marker,
            });
            break;
        }
    }
    Ok(())
}

/// Jitter a backoff to somewhere in [backoff/2, backoff).  Two proposers that abandoned rounds in
/// lockstep must not wake in lockstep too.
fn jittered(guac: &mut Guacamole, backoff: Duration) -> Duration {
    let r: f64 = any(guac);
    backoff / 2 + backoff.mul_f64(r / 2.0)
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
