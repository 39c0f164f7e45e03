//! The client collaborator.  Reads one value per line from stdin and submits each a few times to
//! the proposers group; UDP drops are expected and redundancy is cheaper than acknowledgement.
//! After EOF it waits for the system to drain, then announces how many values it submitted with
//! an end marker so the termination handshake has something to count against.

use std::io::BufRead;
use std::time::Duration;

use indicio::clue;

use crate::config::Configuration;
use crate::multicast;
use crate::wire::EndMarker;
use crate::{Error, COLLECTOR};

///////////////////////////////////////////// constants ////////////////////////////////////////////

/// How many times each value is submitted.
pub const SUBMIT_REDUNDANCY: usize = 3;

const SUBMIT_PAUSE: Duration = Duration::from_millis(10);
const DRAIN_PAUSE: Duration = Duration::from_secs(10);
const END_REDUNDANCY: usize = 3;
const END_PAUSE: Duration = Duration::from_millis(500);
const LINGER: Duration = Duration::from_secs(1);

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static VALUES_SUBMITTED: biometrics::Counter = biometrics::Counter::new("synod.client.values");

/// Registers this module's biometrics with the provided Collector.
pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&VALUES_SUBMITTED);
}

/////////////////////////////////////////////// run ////////////////////////////////////////////////

/// Run a client: submit stdin, then announce the count.
pub fn run_client(id: u64, config: &Configuration) -> Result<(), Error> {
    let socket = multicast::sender()?;
    let stdin = std::io::stdin();
    let mut count: u64 = 0;
    clue!(COLLECTOR, indicio::INFO, {
        client: id,
        starting: true,
    });
    for line in stdin.lock().lines() {
        let line = line?;
        let value = line.trim();
        if value.is_empty() {
            continue;
        }
        for _ in 0..SUBMIT_REDUNDANCY {
            multicast::send(&socket, config.proposers, value);
            std::thread::sleep(SUBMIT_PAUSE);
        }
        VALUES_SUBMITTED.click();
        count += 1;
    }
    clue!(COLLECTOR, indicio::INFO, {
        client: id,
        submitted: count,
    });
    std::thread::sleep(DRAIN_PAUSE);
    let marker = EndMarker { client: id, count }.to_string();
    for _ in 0..END_REDUNDANCY {
        multicast::send(&socket, config.proposers, &marker);
        std::thread::sleep(END_PAUSE);
    }
    std::thread::sleep(LINGER);
    clue!(COLLECTOR, indicio::INFO, {
        client: id,
        finished: true,
    });
    Ok(())
}
