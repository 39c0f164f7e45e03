//! Group configuration.  The file is line-oriented: each non-empty line is `<key> <ip> <port>`,
//! where the key names a multicast group and the ip/port locate it.  Keys `proposers`,
//! `acceptors`, and `learners` are required; invalid lines are warned about and skipped.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;

use indicio::clue;

use crate::{Error, COLLECTOR};

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static INVALID_LINE: biometrics::Counter = biometrics::Counter::new("synod.config.invalid_line");

/// Registers this module's biometrics with the provided Collector.
pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&INVALID_LINE);
}

/////////////////////////////////////////// Configuration //////////////////////////////////////////

/// The three multicast groups of one deployment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Configuration {
    pub proposers: SocketAddrV4,
    pub acceptors: SocketAddrV4,
    pub learners: SocketAddrV4,
}

impl Configuration {
    /// Load the configuration from a file.  Missing or unreadable files are fatal, as is the
    /// absence of a required group.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Configuration, Error> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|err| {
            Error::ConfigError(format!(
                "could not read {}: {}",
                path.as_ref().display(),
                err
            ))
        })?;
        Self::parse(&contents)
    }

    /// Parse the configuration from its file contents.  Later lines override earlier lines with
    /// the same key.
    pub fn parse(contents: &str) -> Result<Configuration, Error> {
        let mut proposers = None;
        let mut acceptors = None;
        let mut learners = None;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let [key, ip, port] = tokens.as_slice() else {
                Self::invalid(line, "expected format: key ip port");
                continue;
            };
            let Ok(ip) = ip.parse::<Ipv4Addr>() else {
                Self::invalid(line, "ip does not parse as IPv4");
                continue;
            };
            let port = match port.parse::<u16>() {
                Ok(port) if port > 0 => port,
                _ => {
                    Self::invalid(line, "port must be in 1..=65535");
                    continue;
                }
            };
            let group = SocketAddrV4::new(ip, port);
            match *key {
                "proposers" => proposers = Some(group),
                "acceptors" => acceptors = Some(group),
                "learners" => learners = Some(group),
                _ => {
                    Self::invalid(line, "unknown key");
                }
            }
        }
        let require = |group: Option<SocketAddrV4>, key: &str| {
            group.ok_or_else(|| Error::ConfigError(format!("missing required key: {key}")))
        };
        Ok(Configuration {
            proposers: require(proposers, "proposers")?,
            acceptors: require(acceptors, "acceptors")?,
            learners: require(learners, "learners")?,
        })
    }

    fn invalid(line: &str, why: &str) {
        INVALID_LINE.click();
        clue!(COLLECTOR, indicio::WARNING, {
            invalid_config_line: line,
            why: why,
        });
    }
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    const CANONICAL: &str = "proposers 239.0.0.1 5000
acceptors 239.0.0.2 5001
learners 239.0.0.3 5002
";

    #[test]
    fn canonical() {
        let config = Configuration::parse(CANONICAL).unwrap();
        assert_eq!("239.0.0.1:5000".parse::<SocketAddrV4>().unwrap(), config.proposers);
        assert_eq!("239.0.0.2:5001".parse::<SocketAddrV4>().unwrap(), config.acceptors);
        assert_eq!("239.0.0.3:5002".parse::<SocketAddrV4>().unwrap(), config.learners);
    }

    #[test]
    fn invalid_lines_are_skipped() {
        let contents = "garbage
proposers 239.0.0.1 5000
proposers not_an_ip 5000
acceptors 239.0.0.2 0
acceptors 239.0.0.2 5001
learners 239.0.0.3 5002 extra is fine? no
learners 239.0.0.3 5002
";
        let config = Configuration::parse(contents).unwrap();
        assert_eq!("239.0.0.1:5000".parse::<SocketAddrV4>().unwrap(), config.proposers);
        assert_eq!("239.0.0.2:5001".parse::<SocketAddrV4>().unwrap(), config.acceptors);
        assert_eq!("239.0.0.3:5002".parse::<SocketAddrV4>().unwrap(), config.learners);
    }

    #[test]
    fn later_lines_override() {
        let contents = "proposers 239.0.0.1 5000
acceptors 239.0.0.2 5001
learners 239.0.0.3 5002
learners 239.0.0.4 5003
";
        let config = Configuration::parse(contents).unwrap();
        assert_eq!("239.0.0.4:5003".parse::<SocketAddrV4>().unwrap(), config.learners);
    }

    #[test]
    fn missing_key_is_fatal() {
        let contents = "proposers 239.0.0.1 5000
acceptors 239.0.0.2 5001
";
        assert!(matches!(
            Configuration::parse(contents),
            Err(Error::ConfigError(_))
        ));
    }
}
