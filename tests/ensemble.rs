//! Drive a whole ensemble (two proposers, three acceptors, two learners, two clients' worth of
//! traffic) through the role state machines with an in-memory stand-in for the multicast groups.
//! Delivery is deterministic: every group member gets its own copy of every datagram sent to the
//! group, one datagram is handled per role per step, and simulated time advances 50ms per step so
//! round timeouts and backoff fire the way they would on a quiet network.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use synod::acceptor::{Acceptor, Verdict};
use synod::learner::Learner;
use synod::proposer::{Group, Outbound, Proposer};
use synod::wire::Message;

const PROPOSERS: usize = 2;
const ACCEPTORS: usize = 3;
const LEARNERS: usize = 2;
const STEP: Duration = Duration::from_millis(50);
const MAX_STEPS: usize = 100_000;

struct Net {
    proposers: Vec<VecDeque<String>>,
    acceptors: Vec<VecDeque<String>>,
    learners: Vec<VecDeque<String>>,
    acceptor_sends: u64,
    acceptor_loss_percent: u64,
}

impl Net {
    fn new(acceptor_loss_percent: u64) -> Self {
        Self {
            proposers: vec![VecDeque::new(); PROPOSERS],
            acceptors: vec![VecDeque::new(); ACCEPTORS],
            learners: vec![VecDeque::new(); LEARNERS],
            acceptor_sends: 0,
            acceptor_loss_percent,
        }
    }

    fn to_proposers(&mut self, message: &str) {
        for inbox in self.proposers.iter_mut() {
            inbox.push_back(message.to_string());
        }
    }

    fn to_acceptors(&mut self, message: &str) {
        self.acceptor_sends += 1;
        if (self.acceptor_sends * 7919) % 100 < self.acceptor_loss_percent {
            return;
        }
        for inbox in self.acceptors.iter_mut() {
            inbox.push_back(message.to_string());
        }
    }

    fn to_learners(&mut self, message: &str) {
        for inbox in self.learners.iter_mut() {
            inbox.push_back(message.to_string());
        }
    }

    fn dispatch(&mut self, outbound: Vec<Outbound>) {
        for out in outbound {
            let message = out.message.to_string();
            match out.group {
                Group::Proposers => self.to_proposers(&message),
                Group::Acceptors => self.to_acceptors(&message),
                Group::Learners => self.to_learners(&message),
            }
        }
    }

    fn quiet(&self) -> bool {
        self.proposers.iter().all(VecDeque::is_empty)
            && self.acceptors.iter().all(VecDeque::is_empty)
            && self.learners.iter().all(VecDeque::is_empty)
    }
}

struct Outcome {
    emitted: Vec<Vec<String>>,
    learners: Vec<Learner>,
    acceptors_alive: usize,
    end_time: Instant,
}

fn run_ensemble(acceptor_loss_percent: u64) -> Outcome {
    let mut net = Net::new(acceptor_loss_percent);
    let mut proposers: Vec<Option<Proposer>> =
        (1..=PROPOSERS as u64).map(|id| Some(Proposer::new(id))).collect();
    let mut acceptors: Vec<Option<Acceptor>> =
        (1..=ACCEPTORS as u64).map(|id| Some(Acceptor::new(id))).collect();
    let mut now = Instant::now();
    let mut learners: Vec<Learner> =
        (1..=LEARNERS as u64).map(|id| Learner::new(id, now)).collect();
    let mut emitted: Vec<Vec<String>> = vec![vec![]; LEARNERS];
    // Two clients, two values each, submitted with the client's usual redundancy.
    for (client, values) in [(1u64, ["x1", "x2"]), (2u64, ["y1", "y2"])] {
        for value in values {
            for _ in 0..3 {
                net.to_proposers(value);
            }
        }
        for _ in 0..3 {
            net.to_proposers(&format!("END_{client}_2"));
        }
    }
    let mut converged = false;
    for _ in 0..MAX_STEPS {
        now += STEP;
        for (index, slot) in proposers.iter_mut().enumerate() {
            let Some(proposer) = slot else {
                // An exited process's datagrams fall on the floor.
                net.proposers[index].clear();
                continue;
            };
            if proposer.tick(now).is_some() {
                continue;
            }
            if let Some(text) = net.proposers[index].pop_front() {
                if let Some(message) = Message::parse(&text) {
                    let outbound = proposer.handle_message(&message);
                    net.dispatch(outbound);
                }
            }
            if let Some(out) = proposer.start_round(now) {
                net.dispatch(vec![out]);
            }
            if let Some(marker) = proposer.finished() {
                let marker = marker.to_string();
                net.to_acceptors(&marker);
                net.to_learners(&marker);
                *slot = None;
            }
        }
        for (index, slot) in acceptors.iter_mut().enumerate() {
            let Some(acceptor) = slot else {
                net.acceptors[index].clear();
                continue;
            };
            if let Some(text) = net.acceptors[index].pop_front() {
                if let Some(message) = Message::parse(&text) {
                    match acceptor.observe(&message) {
                        Verdict::Reply(reply) => net.to_proposers(&reply.to_string()),
                        Verdict::Ignore => {}
                        Verdict::Shutdown => {
                            *slot = None;
                        }
                    }
                }
            }
        }
        for index in 0..LEARNERS {
            if let Some(text) = net.learners[index].pop_front() {
                if let Some(message) = Message::parse(&text) {
                    match message {
                        Message::Decision { value } => {
                            if learners[index].learn(&value, now) {
                                emitted[index].push(value.clone());
                                net.to_learners(&Message::Decision { value }.to_string());
                            }
                        }
                        Message::Catchup { .. } => {
                            for value in learners[index].replay() {
                                net.to_learners(&Message::Decision { value }.to_string());
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        if proposers.iter().all(Option::is_none) && net.quiet() {
            converged = true;
            break;
        }
    }
    assert!(converged, "ensemble did not converge within {MAX_STEPS} steps");
    Outcome {
        emitted,
        learners,
        acceptors_alive: acceptors.iter().filter(|slot| slot.is_some()).count(),
        end_time: now,
    }
}

fn sorted(values: &[String]) -> Vec<String> {
    let mut values = values.to_vec();
    values.sort();
    values
}

#[test]
fn lossless_ensemble_agrees_and_terminates() {
    let outcome = run_ensemble(0);
    for emitted in outcome.emitted.iter() {
        assert_eq!(vec!["x1", "x2", "y1", "y2"], sorted(emitted));
        assert_eq!(4, emitted.len());
    }
    let quiet = outcome.end_time + Duration::from_secs(4);
    for learner in outcome.learners.iter() {
        assert!(learner.finished(quiet));
    }
    assert_eq!(0, outcome.acceptors_alive);
}

#[test]
fn thirty_percent_loss_toward_acceptors_still_converges() {
    let outcome = run_ensemble(30);
    for emitted in outcome.emitted.iter() {
        assert_eq!(vec!["x1", "x2", "y1", "y2"], sorted(emitted));
    }
    let quiet = outcome.end_time + Duration::from_secs(4);
    for learner in outcome.learners.iter() {
        assert!(learner.finished(quiet));
    }
}

#[test]
fn late_learner_catches_up_on_request() {
    let mut net = Net::new(0);
    let now = Instant::now();
    let mut veteran = Learner::new(1, now);
    for value in ["END_1_2", "x1", "x2", "END_2_1", "y1"] {
        veteran.learn(value, now);
    }
    let mut latecomer = Learner::new(2, now);
    net.to_learners(&Message::Catchup { learner: 2 }.to_string());
    // The veteran answers the request with a full replay.
    let Some(text) = net.learners[0].pop_front() else {
        panic!("catch-up request should be queued");
    };
    let Some(Message::Catchup { .. }) = Message::parse(&text) else {
        panic!("catch-up request should parse");
    };
    for value in veteran.replay() {
        net.to_learners(&Message::Decision { value }.to_string());
    }
    while let Some(text) = net.learners[1].pop_front() {
        if let Some(Message::Decision { value }) = Message::parse(&text) {
            latecomer.learn(&value, now);
        }
    }
    assert_eq!(veteran.replay(), latecomer.replay());
}
