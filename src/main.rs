//! Entry point: the sandbox binary's three recognised invocations
//! (spec.md §6) — `--get-api`, `--adjust-oom-score`, and `--type=...` — plus
//! the fatal "anything else" path.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use clap::Parser;

use zypak_sandbox::broker::{Broker, BrokerStrategy};
use zypak_sandbox::bus_thread::BusThread;
use zypak_sandbox::cli::{Cli, Entry};
use zypak_sandbox::reactor::{ExitStatus, Loop};
use zypak_sandbox::strategy::Strategy;
use zypak_sandbox::supervisor::Supervisor;
use zypak_sandbox::{env, logging};

fn main() {
    let cli = Cli::parse();

    let exit_code = match cli.entry() {
        Some(Entry::GetApi) => run_get_api(),
        Some(Entry::AdjustOomScore) => 0,
        Some(Entry::Zygote { child_type, rest }) => {
            logging::init();
            match run_zygote(&child_type, rest) {
                Ok(()) => 0,
                Err(err) => {
                    logging::fatal(format_args!("zygote broker exited with an error: {err:#}"));
                    1
                }
            }
        }
        None => {
            logging::init();
            logging::fatal("no recognised entry point (expected --get-api, --adjust-oom-score, or --type=...)");
            1
        }
    };

    std::process::exit(exit_code);
}

/// `--get-api`: print the mimic sandbox API version this binary speaks.
fn run_get_api() -> i32 {
    println!("1");
    0
}

/// `--type=<child_type> ...`: become the Zygote broker.
///
/// Acquires the session bus, picks a [`Strategy`] once (honouring a forced
/// override, or probing the portal), attaches the [`Supervisor`] under the
/// spawn strategy, and then runs the broker's reactor loop until the
/// Zygote host socket closes or a fatal error occurs.
fn run_zygote(_child_type: &str, _rest: Vec<String>) -> anyhow::Result<()> {
    env::require(env::ZYPAK_BIN)?;
    env::require(env::ZYPAK_LIB)?;

    let blocking_connection = zbus::blocking::Connection::session()
        .map_err(|err| anyhow::anyhow!("failed to acquire the session bus: {err}"))?;
    let connection: zbus::Connection = blocking_connection.into();
    let bus = Arc::new(BusThread::new(connection)?);

    let strategy = strategy_probe_result(&bus)?;

    let broker_strategy = match strategy {
        Strategy::Mimic => BrokerStrategy::Mimic,
        Strategy::Spawn => BrokerStrategy::Spawn(Supervisor::attach(Arc::clone(&bus))?),
    };

    let reactor = Loop::create()?;
    let broker = Rc::new(RefCell::new(Broker::new(broker_strategy, Arc::clone(&bus))));
    Broker::attach(broker, &reactor)?;

    run_until_exit(reactor)
}

fn strategy_probe_result(bus: &Arc<BusThread>) -> anyhow::Result<Strategy> {
    zypak_sandbox::strategy::probe(bus)
}

fn run_until_exit(mut reactor: Loop) -> anyhow::Result<()> {
    loop {
        match reactor.wait(None) {
            zypak_sandbox::reactor::WaitResult::Error => {
                anyhow::bail!("event loop poll failed");
            }
            zypak_sandbox::reactor::WaitResult::Idle => continue,
            zypak_sandbox::reactor::WaitResult::Ready => match reactor.dispatch() {
                zypak_sandbox::reactor::DispatchResult::Continue => continue,
                zypak_sandbox::reactor::DispatchResult::Exit => {
                    return match reactor.exit_status() {
                        ExitStatus::Success => Ok(()),
                        ExitStatus::Failure => anyhow::bail!("broker loop exited with failure"),
                    };
                }
                zypak_sandbox::reactor::DispatchResult::Error => {
                    anyhow::bail!("event loop dispatch failed");
                }
            },
        }
    }
}
