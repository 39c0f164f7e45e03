//! The learner receives decisions, deduplicates them, and prints each agreed data value exactly
//! once in the order it first saw them.  Learners help each other: every fresh decision is
//! forwarded once, decisions are gossiped periodically while values are still outstanding, and a
//! catch-up request triggers a full replay.  End-marker decisions are bookkeeping, never output.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::time::{Duration, Instant};

use indicio::clue;

use crate::config::Configuration;
use crate::multicast;
use crate::wire::{is_end_marker, EndMarker, Message};
use crate::{Error, COLLECTOR, EXPECTED_CLIENTS, QUIESCENCE, RESEND_BATCH_SIZE, RESEND_INTERVAL};

///////////////////////////////////////////// constants ////////////////////////////////////////////

/// The canonical late joiner.  A learner with this id solicits catch-up at startup.
pub const CATCHUP_LEARNER_ID: u64 = 2;

const CATCHUP_SOLICITS: usize = 3;
const SOLICIT_PAUSE: Duration = Duration::from_millis(10);
const GOSSIP_PAUSE: Duration = Duration::from_millis(1);
const HANDLE_PAUSE: Duration = Duration::from_micros(500);
const LEARNER_RECV_BUFFER: usize = 1 << 18;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static VALUES_LEARNED: biometrics::Counter = biometrics::Counter::new("synod.learner.values");
static DUPLICATE_DECISIONS: biometrics::Counter =
    biometrics::Counter::new("synod.learner.duplicates");
static GOSSIP_BATCHES: biometrics::Counter = biometrics::Counter::new("synod.learner.gossip");
static CATCHUP_REQUESTS: biometrics::Counter =
    biometrics::Counter::new("synod.learner.catchup_requests");

/// Registers this module's biometrics with the provided Collector.
pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&VALUES_LEARNED);
    collector.register_counter(&DUPLICATE_DECISIONS);
    collector.register_counter(&GOSSIP_BATCHES);
    collector.register_counter(&CATCHUP_REQUESTS);
}

////////////////////////////////////////////// Learner /////////////////////////////////////////////

/// The learner state machine.
pub struct Learner {
    id: u64,
    learned: HashSet<String>,
    ordered: Vec<String>,
    client_counts: HashMap<u64, u64>,
    values_learned: u64,
    last_value: Instant,
    last_resend: Instant,
}

impl Learner {
    pub fn new(id: u64, now: Instant) -> Self {
        Self {
            id,
            learned: HashSet::new(),
            ordered: Vec::new(),
            client_counts: HashMap::new(),
            values_learned: 0,
            last_value: now,
            last_resend: now,
        }
    }

    /// Take in one decided value.  Returns true iff the value is fresh data, in which case the
    /// caller owes it one line of output and one forwarded decision.
    pub fn learn(&mut self, value: &str, now: Instant) -> bool {
        if let Some(marker) = EndMarker::parse(value) {
            self.client_counts.insert(marker.client, marker.count);
        }
        if !self.learned.insert(value.to_string()) {
            DUPLICATE_DECISIONS.click();
            return false;
        }
        self.ordered.push(value.to_string());
        self.last_value = now;
        if is_end_marker(value) {
            return false;
        }
        self.values_learned += 1;
        VALUES_LEARNED.click();
        true
    }

    /// Every [RESEND_INTERVAL], while values are still outstanding, hand back a bounded batch of
    /// known data values to rebroadcast for peers that missed them.
    pub fn gossip(&mut self, now: Instant) -> Vec<String> {
        if now.duration_since(self.last_resend) <= RESEND_INTERVAL {
            return vec![];
        }
        self.last_resend = now;
        let expected: u64 = self.client_counts.values().sum();
        if expected == 0 || self.values_learned >= expected {
            return vec![];
        }
        GOSSIP_BATCHES.click();
        let batch: Vec<String> = self
            .data_values()
            .take(RESEND_BATCH_SIZE)
            .cloned()
            .collect();
        clue!(COLLECTOR, indicio::DEBUG, {
            learner: self.id,
            gossip: batch.len(),
        });
        batch
    }

    /// Everything a catch-up requester needs: all known data values, first-seen order.
    pub fn replay(&self) -> Vec<String> {
        self.data_values().cloned().collect()
    }

    fn data_values(&self) -> impl Iterator<Item = &String> {
        self.ordered.iter().filter(|value| !is_end_marker(value))
    }

    /// Exit once an end marker from every expected client has been decided, every promised value
    /// has been learned, and the wire has been quiet for [QUIESCENCE].
    pub fn finished(&self, now: Instant) -> bool {
        let expected: u64 = self.client_counts.values().sum();
        self.client_counts.len() >= EXPECTED_CLIENTS
            && expected > 0
            && self.values_learned >= expected
            && now.duration_since(self.last_value) > QUIESCENCE
    }
}

/////////////////////////////////////////////// run ////////////////////////////////////////////////

/// Run a learner until it has learned everything and the wire goes quiet.
pub fn run_learner(id: u64, config: &Configuration) -> Result<(), Error> {
    let socket = multicast::receiver(config.learners)?;
    multicast::request_recv_buffer(&socket, LEARNER_RECV_BUFFER);
    let stdout = std::io::stdout();
    let mut learner = Learner::new(id, Instant::now());
    let mut buf = [0u8; multicast::DATAGRAM_MAX];
    clue!(COLLECTOR, indicio::INFO, {
        learner: id,
        starting: true,
    });
    if id == CATCHUP_LEARNER_ID {
        let solicit = Message::Catchup { learner: id }.to_string();
        for _ in 0..CATCHUP_SOLICITS {
            multicast::send(&socket, config.learners, &solicit);
            std::thread::sleep(SOLICIT_PAUSE);
        }
    }
    loop {
        for value in learner.gossip(Instant::now()) {
            multicast::send(
                &socket,
                config.learners,
                &Message::Decision { value }.to_string(),
            );
            std::thread::sleep(GOSSIP_PAUSE);
        }
        if let Some(text) = multicast::recv(&socket, &mut buf) {
            std::thread::sleep(HANDLE_PAUSE);
            match Message::parse(&text) {
                Some(Message::Decision { value }) => {
                    if learner.learn(&value, Instant::now()) {
                        let mut out = stdout.lock();
                        writeln!(out, "{value}")?;
                        out.flush()?;
                        drop(out);
                        multicast::send(
                            &socket,
                            config.learners,
                            &Message::Decision { value }.to_string(),
                        );
                        std::thread::sleep(HANDLE_PAUSE);
                    }
                }
                Some(Message::Catchup {
                    learner: requester,
                }) => {
                    CATCHUP_REQUESTS.click();
                    clue!(COLLECTOR, indicio::INFO, {
                        learner: id,
                        catchup_for: requester,
                    });
                    for value in learner.replay() {
                        multicast::send(
                            &socket,
                            config.learners,
                            &Message::Decision { value }.to_string(),
                        );
                        std::thread::sleep(GOSSIP_PAUSE);
                    }
                }
                _ => {}
            }
        }
        if learner.finished(Instant::now()) {
            break;
        }
    }
    clue!(COLLECTOR, indicio::INFO, {
        learner: id,
        values_learned: learner.values_learned,
        finished: true,
    });
    Ok(())
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_data_is_emitted_exactly_once() {
        let now = Instant::now();
        let mut learner = Learner::new(1, now);
        assert!(learner.learn("apple", now));
        assert!(!learner.learn("apple", now));
        assert!(!learner.learn("apple", now));
        assert_eq!(1, learner.values_learned);
    }

    #[test]
    fn end_markers_are_never_emitted() {
        let now = Instant::now();
        let mut learner = Learner::new(1, now);
        assert!(!learner.learn("END_1_2", now));
        assert_eq!(0, learner.values_learned);
        assert_eq!(Some(&2), learner.client_counts.get(&1));
    }

    #[test]
    fn duplicate_end_markers_still_update_counts() {
        let now = Instant::now();
        let mut learner = Learner::new(1, now);
        learner.learn("END_1_2", now);
        learner.learn("END_1_2", now);
        assert_eq!(1, learner.client_counts.len());
        assert_eq!(Some(&2), learner.client_counts.get(&1));
    }

    #[test]
    fn replay_preserves_first_seen_order_and_skips_end_markers() {
        let now = Instant::now();
        let mut learner = Learner::new(1, now);
        learner.learn("banana", now);
        learner.learn("END_1_3", now);
        learner.learn("apple", now);
        learner.learn("banana", now);
        learner.learn("cherry", now);
        assert_eq!(vec!["banana", "apple", "cherry"], learner.replay());
    }

    #[test]
    fn gossip_waits_for_the_interval() {
        let now = Instant::now();
        let mut learner = Learner::new(1, now);
        learner.learn("END_1_2", now);
        learner.learn("apple", now);
        assert!(learner.gossip(now).is_empty());
        let later = now + RESEND_INTERVAL + Duration::from_millis(1);
        assert_eq!(vec!["apple"], learner.gossip(later));
        assert!(learner.gossip(later).is_empty());
    }

    #[test]
    fn gossip_stops_once_caught_up() {
        let now = Instant::now();
        let mut learner = Learner::new(1, now);
        learner.learn("END_1_1", now);
        learner.learn("apple", now);
        let later = now + RESEND_INTERVAL + Duration::from_millis(1);
        assert!(learner.gossip(later).is_empty());
    }

    #[test]
    fn gossip_needs_a_count_to_aim_for() {
        let now = Instant::now();
        let mut learner = Learner::new(1, now);
        learner.learn("apple", now);
        let later = now + RESEND_INTERVAL + Duration::from_millis(1);
        assert!(learner.gossip(later).is_empty());
    }

    #[test]
    fn gossip_batches_are_bounded() {
        let now = Instant::now();
        let mut learner = Learner::new(1, now);
        learner.learn("END_1_500", now);
        for i in 0..150 {
            learner.learn(&format!("value{i}"), now);
        }
        let later = now + RESEND_INTERVAL + Duration::from_millis(1);
        assert_eq!(RESEND_BATCH_SIZE, learner.gossip(later).len());
    }

    #[test]
    fn finished_needs_counts_values_and_quiet() {
        let now = Instant::now();
        let mut learner = Learner::new(1, now);
        let quiet = now + QUIESCENCE + Duration::from_millis(1);
        assert!(!learner.finished(quiet));
        learner.learn("END_1_1", now);
        learner.learn("END_2_1", now);
        learner.learn("x1", now);
        assert!(!learner.finished(now));
        assert!(!learner.finished(quiet));
        learner.learn("y1", now);
        assert!(!learner.finished(now));
        assert!(learner.finished(quiet));
    }

    #[test]
    fn finished_needs_both_clients() {
        let now = Instant::now();
        let mut learner = Learner::new(1, now);
        learner.learn("END_1_1", now);
        learner.learn("x1", now);
        let quiet = now + QUIESCENCE + Duration::from_millis(1);
        assert!(!learner.finished(quiet));
    }
}
