//! The datagram grammar.  Messages are ASCII, whitespace-separated tokens, one message per
//! datagram.  The set of message kinds is closed, so the grammar is a tagged enum with a parse
//! and a Display that round-trip exactly.

use std::fmt::{Display, Formatter};

use indicio::clue;

use crate::COLLECTOR;

///////////////////////////////////////////// constants ////////////////////////////////////////////

/// Values bearing this prefix are end markers, not data.  Learners never print them.
pub const END_PREFIX: &str = "END_";

const CATCHUP_PREFIX: &str = "CATCHUP_REQUEST_";

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static MALFORMED_MESSAGE: biometrics::Counter = biometrics::Counter::new("synod.wire.malformed");

/// Registers this module's biometrics with the provided Collector.
pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&MALFORMED_MESSAGE);
}

////////////////////////////////////////////// Message /////////////////////////////////////////////

/// One datagram's worth of protocol.  Everything that is not a recognized verb parses as a bare
/// [Message::Submission]; a submission whose value carries [END_PREFIX] is a client's end marker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    /// A proposer rallies support for a round.
    Phase1A { round: u64 },
    /// An acceptor promises a round, echoing its previously accepted pair when it has one.
    Phase1B {
        round: u64,
        acceptor: u64,
        accepted: Option<(u64, String)>,
    },
    /// A proposer asks acceptors to accept a value under a rallied round.
    Phase2A { round: u64, value: String },
    /// An acceptor accepted the value under the round.
    Phase2B {
        round: u64,
        value: String,
        acceptor: u64,
    },
    /// A value reached quorum.  Sent by proposers to learners and peers, and gossiped by learners.
    Decision { value: String },
    /// A freshly started learner solicits a replay of every known decision.
    Catchup { learner: u64 },
    /// A client-submitted value, either data or an end marker.
    Submission { value: String },
}

impl Message {
    /// Parse one datagram.  Returns None for anything that violates the grammar; the caller is
    /// expected to drop the datagram and move on.
    pub fn parse(text: &str) -> Option<Message> {
        let parsed = Self::parse_inner(text);
        if parsed.is_none() {
            MALFORMED_MESSAGE.click();
            clue!(COLLECTOR, indicio::WARNING, {
                malformed: text,
            });
        }
        parsed
    }

    fn parse_inner(text: &str) -> Option<Message> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        match tokens.as_slice() {
            ["PHASE1A", round] => Some(Message::Phase1A {
                round: round.parse().ok()?,
            }),
            ["PHASE1B", round, acceptor] => Some(Message::Phase1B {
                round: round.parse().ok()?,
                acceptor: acceptor.parse().ok()?,
                accepted: None,
            }),
            ["PHASE1B", round, acceptor, accepted_round, accepted_value] => Some(Message::Phase1B {
                round: round.parse().ok()?,
                acceptor: acceptor.parse().ok()?,
                accepted: Some((accepted_round.parse().ok()?, accepted_value.to_string())),
            }),
            ["PHASE2A", round, value] => Some(Message::Phase2A {
                round: round.parse().ok()?,
                value: value.to_string(),
            }),
            ["PHASE2B", round, value, acceptor] => Some(Message::Phase2B {
                round: round.parse().ok()?,
                value: value.to_string(),
                acceptor: acceptor.parse().ok()?,
            }),
            ["DECISION", value] => Some(Message::Decision {
                value: value.to_string(),
            }),
            [token] if token.starts_with(CATCHUP_PREFIX) => Some(Message::Catchup {
                learner: token[CATCHUP_PREFIX.len()..].parse().ok()?,
            }),
            [token] if !token.starts_with("PHASE") && *token != "DECISION" => {
                Some(Message::Submission {
                    value: token.to_string(),
                })
            }
            _ => None,
        }
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        match self {
            Message::Phase1A { round } => write!(f, "PHASE1A {round}"),
            Message::Phase1B {
                round,
                acceptor,
                accepted: None,
            } => write!(f, "PHASE1B {round} {acceptor}"),
            Message::Phase1B {
                round,
                acceptor,
                accepted: Some((accepted_round, accepted_value)),
            } => write!(
                f,
                "PHASE1B {round} {acceptor} {accepted_round} {accepted_value}"
            ),
            Message::Phase2A { round, value } => write!(f, "PHASE2A {round} {value}"),
            Message::Phase2B {
                round,
                value,
                acceptor,
            } => write!(f, "PHASE2B {round} {value} {acceptor}"),
            Message::Decision { value } => write!(f, "DECISION {value}"),
            Message::Catchup { learner } => write!(f, "{CATCHUP_PREFIX}{learner}"),
            Message::Submission { value } => write!(f, "{value}"),
        }
    }
}

///////////////////////////////////////////// EndMarker ////////////////////////////////////////////

/// `END_<client>_<count>`: the client with the given id finished submitting `count` data values.
/// Proposers emit the same shape at shutdown with their own id and decided-value count.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EndMarker {
    pub client: u64,
    pub count: u64,
}

impl EndMarker {
    /// Parse `END_<client>_<count>`.  A value can carry [END_PREFIX] and still fail to parse; such
    /// a value is treated as an end marker everywhere except count accounting.
    pub fn parse(value: &str) -> Option<EndMarker> {
        let rest = value.strip_prefix(END_PREFIX)?;
        let (client, count) = rest.split_once('_')?;
        Some(EndMarker {
            client: client.parse().ok()?,
            count: count.parse().ok()?,
        })
    }
}

impl Display for EndMarker {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}{}_{}", END_PREFIX, self.client, self.count)
    }
}

/// True iff the value belongs to the end-marker sublanguage rather than the data sublanguage.
pub fn is_end_marker(value: &str) -> bool {
    value.starts_with(END_PREFIX)
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(text: &str, message: Message) {
        assert_eq!(Some(message.clone()), Message::parse(text));
        assert_eq!(text, message.to_string());
    }

    #[test]
    fn phase1a() {
        round_trip("PHASE1A 7", Message::Phase1A { round: 7 });
    }

    #[test]
    fn phase1b_without_accepted() {
        round_trip(
            "PHASE1B 7 2",
            Message::Phase1B {
                round: 7,
                acceptor: 2,
                accepted: None,
            },
        );
    }

    #[test]
    fn phase1b_with_accepted() {
        round_trip(
            "PHASE1B 9 1 5 apple",
            Message::Phase1B {
                round: 9,
                acceptor: 1,
                accepted: Some((5, "apple".to_string())),
            },
        );
    }

    #[test]
    fn phase2a() {
        round_trip(
            "PHASE2A 7 apple",
            Message::Phase2A {
                round: 7,
                value: "apple".to_string(),
            },
        );
    }

    #[test]
    fn phase2b() {
        round_trip(
            "PHASE2B 7 apple 3",
            Message::Phase2B {
                round: 7,
                value: "apple".to_string(),
                acceptor: 3,
            },
        );
    }

    #[test]
    fn decision() {
        round_trip(
            "DECISION apple",
            Message::Decision {
                value: "apple".to_string(),
            },
        );
    }

    #[test]
    fn catchup() {
        round_trip("CATCHUP_REQUEST_2", Message::Catchup { learner: 2 });
    }

    #[test]
    fn submission() {
        round_trip(
            "apple",
            Message::Submission {
                value: "apple".to_string(),
            },
        );
    }

    #[test]
    fn end_marker_is_a_submission() {
        round_trip(
            "END_1_42",
            Message::Submission {
                value: "END_1_42".to_string(),
            },
        );
    }

    #[test]
    fn malformed() {
        assert_eq!(None, Message::parse(""));
        assert_eq!(None, Message::parse("PHASE1A"));
        assert_eq!(None, Message::parse("PHASE1A seven"));
        assert_eq!(None, Message::parse("PHASE1B 7"));
        assert_eq!(None, Message::parse("PHASE1B 7 2 5"));
        assert_eq!(None, Message::parse("PHASE2A 7"));
        assert_eq!(None, Message::parse("PHASE2B 7 apple"));
        assert_eq!(None, Message::parse("DECISION"));
        assert_eq!(None, Message::parse("DECISION a b"));
        assert_eq!(None, Message::parse("CATCHUP_REQUEST_two"));
        assert_eq!(None, Message::parse("two bare tokens"));
    }

    #[test]
    fn end_marker_parse() {
        assert_eq!(
            Some(EndMarker {
                client: 1,
                count: 42
            }),
            EndMarker::parse("END_1_42")
        );
        assert_eq!(None, EndMarker::parse("END_1"));
        assert_eq!(None, EndMarker::parse("END_one_42"));
        assert_eq!(None, EndMarker::parse("apple"));
        assert_eq!("END_1_42", EndMarker { client: 1, count: 42 }.to_string());
    }

    #[test]
    fn end_marker_sublanguage() {
        assert!(is_end_marker("END_1_42"));
        assert!(is_end_marker("END_mangled"));
        assert!(!is_end_marker("apple"));
    }
}
