use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{debug, info};

use crate::runtime::task::{self, Args, Channel, SchedulerConfig, Tasklet, TaskletError};
use crate::utils::logger;
use crate::version::VERSION;

#[derive(Parser, Debug)]
#[command(name = "tasklets", version = VERSION, about = "Cooperative tasklet scheduler demos")]
pub struct TaskletsCli {
    #[arg(long, global = true)]
    /// Log filter directive, e.g. `debug` or `tasklets=trace`.
    log: Option<String>,

    #[arg(long, global = true)]
    /// Coroutine stack size in bytes for every tasklet.
    stack_size: Option<usize>,

    #[arg(long, global = true)]
    /// Print scheduler metrics as JSON when the workload finishes.
    json: bool,

    #[command(subcommand)]
    command: Command,
}

impl TaskletsCli {
    pub fn command(&self) -> &Command {
        &self.command
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bounces a counter between two tasklets over a pair of channels.
    Pingpong {
        #[arg(short, long, default_value_t = 1000)]
        rounds: u64,
        /// Channel preference: -1 receiver first, 0 caller keeps running, 1 sender first.
        #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
        preference: i64,
        #[arg(long)]
        schedule_all: bool,
    },
    /// Passes a token around a ring of tasklets.
    Ring {
        #[arg(short, long, default_value_t = 100)]
        size: usize,
        #[arg(short, long, default_value_t = 10)]
        laps: u64,
    },
    /// Feeds one channel from several OS threads.
    Threads {
        #[arg(short, long, default_value_t = 4)]
        workers: usize,
        #[arg(short, long, default_value_t = 100)]
        messages: u64,
    },
}

pub fn run() -> Result<()> {
    let cli = TaskletsCli::parse();
    logger::init_logging_with(cli.log.as_deref());

    let mut config = SchedulerConfig::from_env();
    if let Some(stack_size) = cli.stack_size {
        config.stack_size = stack_size;
    }
    task::init_runtime(config).context("invalid scheduler configuration")?;
    debug!(?config, "runtime configured");

    let before = task::runtime().metrics().snapshot();
    let started = Instant::now();
    match &cli.command {
        Command::Pingpong {
            rounds,
            preference,
            schedule_all,
        } => handle_pingpong(*rounds, *preference, *schedule_all)?,
        Command::Ring { size, laps } => handle_ring(*size, *laps)?,
        Command::Threads { workers, messages } => handle_threads(*workers, *messages)?,
    }
    let elapsed = started.elapsed();
    let after = task::runtime().metrics().snapshot();

    println!(
        "{} in {:.2?} ({} switches)",
        "done".green().bold(),
        elapsed,
        after.switches.saturating_sub(before.switches)
    );
    if cli.json {
        println!("{}", after.to_json());
    }
    Ok(())
}

fn handle_pingpong(rounds: u64, preference: i64, schedule_all: bool) -> Result<()> {
    let ping = Channel::new();
    let pong = Channel::new();
    for channel in [&ping, &pong] {
        channel.set_preference(preference)?;
        channel.set_schedule_all(schedule_all)?;
    }

    let (ping_rx, pong_tx) = (ping.clone(), pong.clone());
    Tasklet::spawn(move |_| {
        for value in ping_rx {
            let value = value?.get::<u64>().unwrap_or_default();
            pong_tx.send(value + 1)?;
        }
        Ok(())
    })?;

    let mut counter = 0_u64;
    for _ in 0..rounds {
        ping.send(counter)?;
        counter = pong
            .receive()?
            .get::<u64>()
            .context("pong answered with something other than a counter")?;
    }
    ping.send_exception(TaskletError::StopIteration)?;
    task::run_all()?;

    if counter != rounds {
        bail!("expected {rounds} round trips, counted {counter}");
    }
    println!("{} {} round trips", "pingpong".cyan().bold(), counter);
    Ok(())
}

fn handle_ring(size: usize, laps: u64) -> Result<()> {
    if size == 0 {
        bail!("a ring needs at least one tasklet");
    }
    let links: Vec<Channel> = (0..=size).map(|_| Channel::new()).collect();
    for index in 0..size {
        let inbox = links[index].clone();
        let outbox = links[index + 1].clone();
        Tasklet::with_fn(move |_| {
            for token in inbox {
                outbox.send_value(token?)?;
            }
            outbox.send_exception(TaskletError::StopIteration)
        })
        .setup(Args::new())?;
    }

    let (first, last) = (&links[0], &links[size]);
    let mut hops = 0_u64;
    for lap in 0..laps {
        first.send(lap)?;
        let token = last.receive()?.get::<u64>().context("token lost in the ring")?;
        if token != lap {
            bail!("lap {lap} returned token {token}");
        }
        hops += size as u64;
    }
    first.send_exception(TaskletError::StopIteration)?;
    match last.receive() {
        Err(TaskletError::StopIteration) => {}
        other => bail!("ring did not shut down cleanly: {other:?}"),
    }
    task::run_all()?;

    info!(size, laps, hops, "ring finished");
    println!("{} {} hops across {} tasklets", "ring".cyan().bold(), hops, size);
    Ok(())
}

fn handle_threads(workers: usize, messages: u64) -> Result<()> {
    // Attach this thread first so workers never see themselves as the only scheduler.
    let here = task::current_thread_id();
    debug!(%here, workers, "feeding channel from worker threads");
    let inbox = Channel::new();
    let ready = Arc::new(Barrier::new(workers + 1));
    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let inbox = inbox.clone();
            let ready = Arc::clone(&ready);
            thread::Builder::new()
                .name(format!("tasklets-worker-{worker}"))
                .spawn(move || -> std::result::Result<(), TaskletError> {
                    task::current_thread_id();
                    ready.wait();
                    for message in 0..messages {
                        inbox.send((worker, message))?;
                    }
                    Ok(())
                })
                .context("failed to spawn worker thread")
        })
        .collect::<Result<_>>()?;
    ready.wait();

    let expected = workers as u64 * messages;
    let mut received = 0_u64;
    while received < expected {
        let value = inbox.receive()?;
        if !value.is::<(usize, u64)>() {
            bail!("unexpected message {value:?}");
        }
        received += 1;
    }
    for handle in handles {
        match handle.join() {
            Ok(result) => result?,
            Err(_) => bail!("worker thread panicked"),
        }
    }

    println!(
        "{} {} messages from {} threads",
        "threads".cyan().bold(),
        received,
        workers
    );
    print_registry();
    Ok(())
}

fn print_registry() {
    for thread in task::threads() {
        match task::get_thread_info(thread) {
            Ok(info) => println!(
                "  thread {:>8}  main #{}  current #{}  runcount {}",
                thread,
                info.main.id(),
                info.current.id(),
                info.runcount
            ),
            Err(err) => println!("  thread {:>8}  {}", thread, err.to_string().dimmed()),
        }
    }
}
