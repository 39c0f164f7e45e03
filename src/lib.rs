//! synod agrees upon a set of client-submitted values over UDP multicast.
//!
//! The crate provides the four role state machines of a multi-decree synod deployment (proposer,
//! acceptor, learner, and the client collaborator) plus the group transport they share.  Each role
//! is a single-threaded event loop over one or two datagram sockets; all coordination is by
//! message passing and every message fits in one datagram.  The state machines themselves are
//! plain structs that consume parsed messages and return explicit effects, so the protocol can be
//! driven in tests without opening a socket.

use std::time::Duration;

///////////////////////////////////////////// constants ////////////////////////////////////////////

/// Number of proposer processes in the canonical deployment.  Proposer p generates rounds
/// p, p + TOTAL_PROPOSERS, p + 2*TOTAL_PROPOSERS, ... so that no two proposers ever share a round.
pub const TOTAL_PROPOSERS: u64 = 2;

/// Number of acceptor processes in the canonical deployment.
pub const TOTAL_ACCEPTORS: u64 = 3;

/// A quorum of acceptors.  Two quorums always intersect in at least one acceptor.
pub const ACCEPTOR_MAJORITY: usize = (TOTAL_ACCEPTORS as usize / 2) + 1;

/// Number of clients whose end markers must be decided before the ensemble may shut down.
pub const EXPECTED_CLIENTS: usize = 2;

/// How long a proposer drives one round before abandoning it to a competitor.
pub const ROUND_TIMEOUT: Duration = Duration::from_millis(1500);

/// Contention backoff bounds.  The backoff grows by half on every abandoned round and resets on
/// quorum progress.
pub const MIN_BACKOFF: Duration = Duration::from_millis(50);
pub const MAX_BACKOFF: Duration = Duration::from_millis(1000);

/// Bound on the proposer's queue of submitted-but-undecided values.  Overflow drops the oldest
/// entry; clients re-send, so the loss is recoverable.
pub const QUEUE_CAPACITY: usize = 10_000;

/// Learner gossip cadence and per-interval batch bound.
pub const RESEND_INTERVAL: Duration = Duration::from_millis(500);
pub const RESEND_BATCH_SIZE: usize = 100;

/// How long a learner that has learned everything waits for stragglers before exiting.
pub const QUIESCENCE: Duration = Duration::from_millis(3000);

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static IO_ERROR: biometrics::Counter = biometrics::Counter::new("synod.error.io");

/// Registers this crate's biometrics with the provided Collector.
pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&IO_ERROR);
    config::register_biometrics(collector);
    wire::register_biometrics(collector);
    multicast::register_biometrics(collector);
    acceptor::register_biometrics(collector);
    proposer::register_biometrics(collector);
    learner::register_biometrics(collector);
    client::register_biometrics(collector);
}

////////////////////////////////////////////// indicio /////////////////////////////////////////////

/// The indicio collector for the whole crate.  Binaries register an emitter and set a verbosity;
/// the library assumes nothing.
pub static COLLECTOR: indicio::Collector = indicio::Collector::new();

/////////////////////////////////////////////// Error //////////////////////////////////////////////

/// The error type for everything that can go wrong setting a role up.  Once a role's loop is
/// running, errors are recovered locally and never propagate across roles.
#[derive(Debug)]
pub enum Error {
    /// The configuration file was missing, unreadable, or lacked a required group.
    ConfigError(String),
    /// An I/O error that prevents the role from starting, e.g. a socket that will not bind.
    Io(std::io::Error),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        IO_ERROR.click();
        Self::Io(err)
    }
}

impl From<Error> for indicio::Value {
    fn from(err: Error) -> Self {
        match err {
            Error::ConfigError(what) => {
                indicio::value!({
                    config_error: what,
                })
            }
            Error::Io(err) => {
                indicio::value!({
                    io_error: err.to_string(),
                })
            }
        }
    }
}

////////////////////////////////////////////// modules /////////////////////////////////////////////

pub mod acceptor;
pub mod client;
pub mod config;
pub mod learner;
pub mod multicast;
pub mod proposer;
pub mod wire;

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorums_intersect() {
        assert!(2 * ACCEPTOR_MAJORITY > TOTAL_ACCEPTORS as usize);
    }

    #[test]
    fn backoff_bounds_ordered() {
        assert!(MIN_BACKOFF < MAX_BACKOFF);
    }
}
