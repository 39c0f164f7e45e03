//! The acceptor is the mutable memory of the protocol.  It keeps the classical
//! (promised, accepted, accepted value) register, promises rounds at least as high as any it has
//! promised before, accepts values under promised rounds, and stays silent about everything
//! staler.  An end marker shuts it down.

use std::net::UdpSocket;
use std::time::{Duration, Instant};

use indicio::clue;

use crate::config::Configuration;
use crate::multicast;
use crate::wire::{is_end_marker, Message};
use crate::{Error, COLLECTOR};

///////////////////////////////////////////// constants ////////////////////////////////////////////

/// Minimum spacing between handled messages.  Smooths bursts so replies do not overrun kernel
/// buffers on the proposer side.
pub const MIN_MESSAGE_INTERVAL: Duration = Duration::from_micros(500);

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static PROMISES: biometrics::Counter = biometrics::Counter::new("synod.acceptor.promises");
static ACCEPTS: biometrics::Counter = biometrics::Counter::new("synod.acceptor.accepts");
static STALE_ROUNDS: biometrics::Counter = biometrics::Counter::new("synod.acceptor.stale_rounds");
static SHUTDOWNS: biometrics::Counter = biometrics::Counter::new("synod.acceptor.shutdowns");

/// Registers this module's biometrics with the provided Collector.
pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&PROMISES);
    collector.register_counter(&ACCEPTS);
    collector.register_counter(&STALE_ROUNDS);
    collector.register_counter(&SHUTDOWNS);
}

////////////////////////////////////////////// Verdict /////////////////////////////////////////////

/// What one observed message obliges the acceptor to do.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// Reply to the proposers group.
    Reply(Message),
    /// Drop the message.  Stale rounds and foreign traffic land here.
    Ignore,
    /// An end marker arrived; the acceptor's work is done.
    Shutdown,
}

///////////////////////////////////////////// Acceptor /////////////////////////////////////////////

/// The acceptor register.  `promised` never decreases; `accepted` trails `promised`; whenever
/// `accepted` is non-zero there is an accepted value.
pub struct Acceptor {
    id: u64,
    promised: u64,
    accepted: u64,
    value: Option<String>,
}

impl Acceptor {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            promised: 0,
            accepted: 0,
            value: None,
        }
    }

    /// Observe one message and decide what to do about it.
    pub fn observe(&mut self, message: &Message) -> Verdict {
        match message {
            Message::Phase1A { round } => {
                if *round >= self.promised {
                    self.promised = *round;
                    PROMISES.click();
                    let accepted = if self.accepted > 0 {
                        self.value
                            .clone()
                            .map(|value| (self.accepted, value))
                    } else {
                        None
                    };
                    Verdict::Reply(Message::Phase1B {
                        round: *round,
                        acceptor: self.id,
                        accepted,
                    })
                } else {
                    STALE_ROUNDS.click();
                    Verdict::Ignore
                }
            }
            Message::Phase2A { round, value } => {
                if *round >= self.promised {
                    self.promised = *round;
                    self.accepted = *round;
                    self.value = Some(value.clone());
                    ACCEPTS.click();
                    Verdict::Reply(Message::Phase2B {
                        round: *round,
                        value: value.clone(),
                        acceptor: self.id,
                    })
                } else {
                    STALE_ROUNDS.click();
                    Verdict::Ignore
                }
            }
            Message::Submission { value } if is_end_marker(value) => {
                SHUTDOWNS.click();
                Verdict::Shutdown
            }
            _ => Verdict::Ignore,
        }
    }
}

/////////////////////////////////////////////// run ////////////////////////////////////////////////

/// Run an acceptor until an end marker arrives.
pub fn run_acceptor(id: u64, config: &Configuration) -> Result<(), Error> {
    let socket: UdpSocket = multicast::receiver(config.acceptors)?;
    let mut acceptor = Acceptor::new(id);
    let mut buf = [0u8; multicast::DATAGRAM_MAX];
    let mut last_message = Instant::now() - MIN_MESSAGE_INTERVAL;
    clue!(COLLECTOR, indicio::INFO, {
        acceptor: id,
        starting: true,
    });
    loop {
        let Some(text) = multicast::recv(&socket, &mut buf) else {
            continue;
        };
        let since_last = last_message.elapsed();
        if since_last < MIN_MESSAGE_INTERVAL {
            std::thread::sleep(MIN_MESSAGE_INTERVAL - since_last);
        }
        last_message = Instant::now();
        let Some(message) = Message::parse(&text) else {
            continue;
        };
        match acceptor.observe(&message) {
            Verdict::Reply(reply) => {
                clue!(COLLECTOR, indicio::DEBUG, {
                    acceptor: id,
                    reply: reply.to_string(),
                });
                multicast::send(&socket, config.proposers, &reply.to_string());
            }
            Verdict::Ignore => {}
            Verdict::Shutdown => {
                break;
            }
        }
    }
    clue!(COLLECTOR, indicio::INFO, {
        acceptor: id,
        finished: true,
    });
    Ok(())
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////
