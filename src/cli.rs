//! `objmon` command-line tool: drives the monitor under load and prints what
//! it did.
use crate::{
    config::MonitorConfig,
    error::{MonitorError, WaitOutcome},
    object::ObjectRef,
    sync::{MonitorOps, ObjectMonitor},
    threading::Timeout,
    utils::sync::{Arc, AtomicBool, AtomicU64, Ordering},
};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::{
    process::ExitCode,
    sync::Barrier,
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Stress and inspect per-object monitors")]
pub struct Args {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    pub log: String,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Hammer a set of shared objects from many threads and verify the counts
    Stress {
        #[command(flatten)]
        load: StressOptions,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one of the reference lock/wait scenarios
    Scenario {
        #[arg(value_enum)]
        which: Scenario,
    },
    /// Run a stress pass, then list the inflated locks
    Dump {
        #[command(flatten)]
        load: StressOptions,
        #[arg(long)]
        json: bool,
        /// Also list records whose lock is currently free
        #[arg(long)]
        include_unheld: bool,
    },
}

#[derive(clap::Args, Debug, Clone, Copy, Serialize)]
pub struct StressOptions {
    #[arg(short, long, default_value_t = 8)]
    pub threads: usize,
    #[arg(short, long, default_value_t = 10_000)]
    pub iterations: u64,
    #[arg(short, long, default_value_t = 4)]
    pub objects: usize,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Nested enter blocks a zero-timeout try_enter until fully exited
    A,
    /// Wait released by a pulse from another thread
    B,
    /// Concurrent identity hash requests agree
    C,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error("check failed: {0}")]
    Check(String),
    #[error("worker thread panicked")]
    WorkerPanicked,
}

fn check(condition: bool, what: impl FnOnce() -> String) -> Result<(), CliError> {
    if condition {
        Ok(())
    } else {
        Err(CliError::Check(what()))
    }
}

pub fn run_cli() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log)),
        )
        .with_writer(std::io::stderr)
        .init();

    let monitor = Arc::new(ObjectMonitor::new(MonitorConfig::from_env()));
    let result = match args.command {
        Command::Stress { load, json } => {
            run_stress(&monitor, load).and_then(|report| print_report(&report, json))
        }
        Command::Scenario { which } => run_scenario(&monitor, which).map(|()| {
            println!("scenario {:?}: ok", which);
        }),
        Command::Dump {
            load,
            json,
            include_unheld,
        } => run_stress(&monitor, load).and_then(|_report| {
            let dump = monitor.dump_locks(include_unheld);
            if json {
                print_json(&dump)
            } else {
                println!("{}", dump);
                Ok(())
            }
        }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("objmon: {}", e);
            ExitCode::from(1)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| CliError::Check(format!("serializing output: {}", e)))?;
    println!("{}", text);
    Ok(())
}

fn print_report(report: &StressReport, json: bool) -> Result<(), CliError> {
    if json {
        return print_json(report);
    }
    println!(
        "{} threads x {} iterations over {} objects in {:?}",
        report.options.threads,
        report.options.iterations,
        report.options.objects,
        Duration::from_micros(report.elapsed_us)
    );
    print!("{}", report.metrics);
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct StressReport {
    pub options: StressOptions,
    pub elapsed_us: u64,
    pub metrics: crate::metrics::MetricsSnapshot,
    /// Kept alive so a following dump still sees their records.
    #[serde(skip)]
    pub objects: Vec<ObjectRef>,
}

/// Every thread increments per-object counters under the object's lock with
/// a separate load and store, so any break in mutual exclusion loses updates.
pub fn run_stress(monitor: &Arc<ObjectMonitor>, options: StressOptions) -> Result<StressReport, CliError> {
    let object_count = options.objects.max(1);
    let objects: Vec<ObjectRef> = (0..object_count)
        .map(|i| ObjectRef::new_object(format!("Stress{}", i)))
        .collect();
    let counters: Arc<Vec<AtomicU64>> = Arc::new((0..object_count).map(|_| AtomicU64::new(0)).collect());
    let hashes = objects
        .iter()
        .map(|o| monitor.get_identity_hash(o))
        .collect::<Result<Vec<_>, _>>()?;
    let hashes = Arc::new(hashes);

    info!(
        "stress: {} threads x {} iterations over {} objects",
        options.threads, options.iterations, object_count
    );
    let started = Instant::now();
    let workers: Vec<_> = (0..options.threads)
        .map(|t| {
            let monitor = monitor.clone();
            let objects = objects.clone();
            let counters = counters.clone();
            let hashes = hashes.clone();
            thread::spawn(move || -> Result<(), CliError> {
                for i in 0..options.iterations {
                    let slot = (t + i as usize) % objects.len();
                    let obj = &objects[slot];
                    let nested = i % 7 == 0;

                    monitor.enter(obj)?;
                    if nested {
                        monitor.enter(obj)?;
                    }
                    let value = counters[slot].load(Ordering::Relaxed);
                    thread::yield_now();
                    counters[slot].store(value + 1, Ordering::Relaxed);
                    if i % 64 == 0 {
                        let hash = monitor.get_identity_hash(obj)?;
                        check(hash == hashes[slot], || {
                            format!("hash of object {} changed: {} != {}", slot, hash, hashes[slot])
                        })?;
                    }
                    if nested {
                        monitor.exit(obj)?;
                    }
                    monitor.exit(obj)?;
                }
                Ok(())
            })
        })
        .collect();

    for worker in workers {
        worker.join().map_err(|_| CliError::WorkerPanicked)??;
    }
    let elapsed = started.elapsed();

    let total: u64 = counters.iter().map(|c| c.load(Ordering::Relaxed)).sum();
    let expected = options.threads as u64 * options.iterations;
    check(total == expected, || {
        format!("lost updates: counted {} of {}", total, expected)
    })?;
    for obj in &objects {
        check(!monitor.is_entered_by_anyone(obj)?, || {
            format!("{:?} still locked after stress", obj)
        })?;
    }

    Ok(StressReport {
        options,
        elapsed_us: elapsed.as_micros() as u64,
        metrics: monitor.metrics(),
        objects,
    })
}

pub fn run_scenario(monitor: &Arc<ObjectMonitor>, which: Scenario) -> Result<(), CliError> {
    match which {
        Scenario::A => scenario_nested_try_enter(monitor),
        Scenario::B => scenario_wait_pulse(monitor),
        Scenario::C => scenario_concurrent_hash(monitor),
    }
}

fn try_enter_elsewhere(monitor: &Arc<ObjectMonitor>, obj: &ObjectRef) -> Result<bool, CliError> {
    let (monitor, obj) = (monitor.clone(), obj.clone());
    thread::spawn(move || -> Result<bool, CliError> {
        let started = Instant::now();
        let taken = monitor.try_enter(&obj, Timeout::ZERO)?;
        check(started.elapsed() < Duration::from_secs(1), || {
            "zero-timeout try_enter blocked".to_string()
        })?;
        if taken {
            monitor.exit(&obj)?;
        }
        Ok(taken)
    })
    .join()
    .map_err(|_| CliError::WorkerPanicked)?
}

fn scenario_nested_try_enter(monitor: &Arc<ObjectMonitor>) -> Result<(), CliError> {
    let x = ObjectRef::new_object("X");
    for _ in 0..3 {
        monitor.enter(&x)?;
    }
    let owner = monitor.lock_owner(&x)?;
    check(owner.map(|o| o.nest) == Some(3), || format!("expected nest 3, got {:?}", owner))?;

    check(!try_enter_elsewhere(monitor, &x)?, || {
        "try_enter succeeded on a held lock".to_string()
    })?;
    for _ in 0..3 {
        monitor.exit(&x)?;
    }
    check(try_enter_elsewhere(monitor, &x)?, || {
        "try_enter failed on a released lock".to_string()
    })
}

fn scenario_wait_pulse(monitor: &Arc<ObjectMonitor>) -> Result<(), CliError> {
    let x = ObjectRef::new_object("X");
    let ready = Arc::new(AtomicBool::new(false));

    let waiter = {
        let (monitor, x, ready) = (monitor.clone(), x.clone(), ready.clone());
        thread::spawn(move || -> Result<WaitOutcome, CliError> {
            monitor.enter(&x)?;
            ready.store(true, Ordering::Release);
            let outcome = monitor.wait(&x, Timeout::Infinite, false)?;
            check(monitor.is_entered_by_current(&x)?, || {
                "waiter returned without the lock".to_string()
            })?;
            monitor.exit(&x)?;
            Ok(outcome)
        })
    };

    while !ready.load(Ordering::Acquire) {
        thread::yield_now();
    }
    // Only succeeds once the waiter has released the lock inside `wait`.
    monitor.enter(&x)?;
    monitor.pulse(&x)?;
    monitor.exit(&x)?;

    let outcome = waiter.join().map_err(|_| CliError::WorkerPanicked)??;
    check(outcome == WaitOutcome::Pulsed, || format!("waiter saw {:?}", outcome))
}

fn scenario_concurrent_hash(monitor: &Arc<ObjectMonitor>) -> Result<(), CliError> {
    const THREADS: usize = 50;
    let x = ObjectRef::new_object("X");
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let (monitor, x, barrier) = (monitor.clone(), x.clone(), barrier.clone());
            thread::spawn(move || {
                barrier.wait();
                monitor.get_identity_hash(&x)
            })
        })
        .collect();

    let mut hashes = Vec::with_capacity(THREADS);
    for worker in workers {
        hashes.push(worker.join().map_err(|_| CliError::WorkerPanicked)??);
    }
    check(hashes.windows(2).all(|w| w[0] == w[1]), || {
        format!("threads disagree on the hash: {:?}", hashes)
    })
}
