use std::fs::File;
use std::sync::Arc;
use std::time::SystemTime;

use arrrg::CommandLine;
use biometrics::{Collector, PlainTextEmitter};
use indicio::{clue, stdio::StdioEmitter, ALWAYS};

use synod::config::Configuration;
use synod::COLLECTOR;

#[derive(Debug, Eq, PartialEq, arrrg_derive::CommandLine)]
struct Options {
    #[arrrg(optional, "Verbosity of the indicio collector (0-15).")]
    verbose: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            verbose: indicio::WARNING,
        }
    }
}

const USAGE: &str = "USAGE: synod [--verbose LEVEL] <role> <id> <config>";

fn usage() -> ! {
    eprintln!("{USAGE}");
    eprintln!("role is one of proposer, acceptor, learner, client; id is a positive integer");
    std::process::exit(1);
}

fn emit_biometrics(collector: &Collector) {
    let Ok(fout) = File::create("/dev/stderr") else {
        return;
    };
    let mut emit = PlainTextEmitter::new(fout);
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    if let Err(e) = collector.emit(&mut emit, now) {
        eprintln!("collector error: {}", e);
    }
}

fn main() {
    let (options, free) = Options::from_command_line_relaxed(USAGE);
    let [role, id, config] = free.as_slice() else {
        usage();
    };
    let id: u64 = match id.parse() {
        Ok(id) if id > 0 => id,
        _ => {
            eprintln!("id must be a positive integer");
            usage();
        }
    };
    let config = match Configuration::load(config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err:?}");
            std::process::exit(1);
        }
    };
    // indicio
    let emitter = Arc::new(StdioEmitter);
    COLLECTOR.register(emitter);
    COLLECTOR.set_verbosity(options.verbose);
    clue!(COLLECTOR, ALWAYS, {
        new_process: std::env::args().map(String::from).collect::<Vec<_>>(),
    });
    // biometrics
    let collector = Collector::new();
    synod::register_biometrics(&collector);
    // role
    let result = match role.as_str() {
        "proposer" => synod::proposer::run_proposer(id, &config),
        "acceptor" => synod::acceptor::run_acceptor(id, &config),
        "learner" => synod::learner::run_learner(id, &config),
        "client" => synod::client::run_client(id, &config),
        _ => {
            eprintln!("unknown role {role}");
            usage();
        }
    };
    if let Err(err) = result {
        clue!(COLLECTOR, indicio::ERROR, {
            fatal: indicio::Value::from(err),
        });
        emit_biometrics(&collector);
        std::process::exit(1);
    }
    emit_biometrics(&collector);
    clue!(COLLECTOR, ALWAYS, {
        goodbye: std::env::args().map(String::from).collect::<Vec<_>>(),
    });
}
