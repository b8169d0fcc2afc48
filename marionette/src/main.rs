//! # Marionette Supervisor Binary
//!
//! Runs a pre-fork master in the foreground, or talks to a running one.
//!
//! # Usage
//!
//! ```bash
//! # Foreground master from a config file
//! marionette run --config marionette.toml
//!
//! # No config: one idle main puppet with three workers
//! marionette run --workers 3 --tag demo --pid-file /tmp/demo.pid
//!
//! # Echo pool on a TCP port, production overrides
//! marionette run -c marionette.toml --listen default=127.0.0.1:9000 -e production
//!
//! # Talk to a running master
//! marionette status --pid-file /tmp/demo.pid
//! marionette restart --pid-file /tmp/demo.pid   # USR2: re-exec, then retire the old master
//! marionette reexec --pid-file /tmp/demo.pid    # USR1: re-exec alongside the old master
//! marionette stop --pid-file /tmp/demo.pid
//! marionette stats --control-port /tmp/demo.sock
//! ```

use clap::{Args, Parser, Subcommand};
use marionette::logging::{LogSink, init_tracing};
use marionette::master::Master;
use marionette::process_utils::PidFile;
use marionette::runtime::{Runtime, StartContext};
use marionette_common::config::{ConfigError, ConfigLoader, LogLevel, MasterConfig, PuppetSection};
use marionette_common::configurator::Configurator;
use marionette_common::consts::DEFAULT_LISTENER_KEY;
use nix::sys::signal::Signal;
use std::error::Error;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

/// Marionette - pre-fork process supervisor
#[derive(Parser, Debug)]
#[command(name = "marionette")]
#[command(version)]
#[command(about = "Pre-fork master/worker process supervisor with live re-exec")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a master in the foreground.
    Run(RunArgs),
    /// Stop a running master (QUIT, then KILL after the timeout).
    Stop(ControlArgs),
    /// Report whether a master is running.
    Status(ControlArgs),
    /// Re-exec the master and retire the old one once the new one is up (USR2).
    Restart(ControlArgs),
    /// Re-exec the master, keeping the old one running (USR1).
    Reexec(ControlArgs),
    /// Query a master's control port.
    Stats(StatsArgs),
}

#[derive(Args, Debug, Clone)]
struct CommonArgs {
    /// Configuration file (TOML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Pid file; the last occurrence wins.
    #[arg(long, value_name = "FILE", overrides_with = "pid_file")]
    pid_file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Process tag shown in the master's process name.
    #[arg(long)]
    tag: Option<String>,

    /// Worker staleness threshold and shutdown deadline, in seconds.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Listener, as KEY=SPEC (repeatable). SPEC is host:port, a port or a path.
    #[arg(long = "listen", value_name = "KEY=SPEC", value_parser = parse_listen)]
    listen: Vec<(String, String)>,

    /// Desired worker count of the main puppet.
    #[arg(short, long)]
    workers: Option<usize>,

    /// Environment section to apply (development, production, ...).
    #[arg(short, long)]
    environment: Option<String>,
}

#[derive(Args, Debug, Clone)]
struct ControlArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Seconds `stop` waits before KILL.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
}

#[derive(Args, Debug, Clone)]
struct StatsArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Control port socket; defaults to `[master] control_port`.
    #[arg(long, value_name = "PATH")]
    control_port: Option<PathBuf>,
}

fn parse_listen(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, spec)) if !key.is_empty() && !spec.is_empty() => Ok((key.to_string(), spec.to_string())),
        _ if !raw.is_empty() && !raw.contains('=') => Ok((DEFAULT_LISTENER_KEY.to_string(), raw.to_string())),
        _ => Err(format!("expected KEY=SPEC, got '{raw}'")),
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        // No-op when the subscriber is already installed.
        init_tracing(&LogSink::stderr(), LogLevel::Error, false, false);
        error!("FATAL: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    match cli.command {
        Command::Run(args) => run_master(&args),
        Command::Stop(args) => {
            let config = load_config(&args.common)?;
            setup_tracing(&args.common, &config)?;
            let timeout = args.timeout.map(Duration::from_secs).unwrap_or_else(|| config.timeout());
            match pid_file(&args.common, &config)?.terminate(timeout)? {
                Some(pid) => info!("master {pid} stopped"),
                None => info!("master not running"),
            }
            Ok(())
        }
        Command::Status(args) => {
            let config = load_config(&args.common)?;
            let pid_file = pid_file(&args.common, &config)?;
            match pid_file.running() {
                Some(pid) => println!("marionette is running (PID {pid})"),
                None => {
                    println!("marionette is not running");
                    std::process::exit(3);
                }
            }
            Ok(())
        }
        Command::Restart(args) => signal_master(&args, Signal::SIGUSR2),
        Command::Reexec(args) => signal_master(&args, Signal::SIGUSR1),
        Command::Stats(args) => {
            let config = load_config(&args.common)?;
            let path = args
                .control_port
                .or(config.master.control_port)
                .ok_or("no control port configured")?;
            let mut stream = UnixStream::connect(&path)?;
            stream.write_all(b"!stats\n!quit\n")?;
            let mut reply = String::new();
            stream.read_to_string(&mut reply)?;
            print!("{reply}");
            Ok(())
        }
    }
}

fn run_master(args: &RunArgs) -> Result<(), Box<dyn Error>> {
    let config = configure(load_config(&args.common)?, args)?;
    let sink = setup_tracing(&args.common, &config)?;

    info!("marionette v{} starting...", env!("CARGO_PKG_VERSION"));

    let runtime = Runtime::init(sink, StartContext::capture()?)?;
    let mut master = Master::from_config(&config, &runtime)?;
    master.start()?;
    master.join()?;

    info!("marionette shutdown complete");
    Ok(())
}

fn load_config(common: &CommonArgs) -> Result<MasterConfig, ConfigError> {
    match common.config.as_deref() {
        Some(path) => MasterConfig::load(path),
        None => Ok(MasterConfig::default()),
    }
}

/// Apply command-line overrides and the environment section, then validate.
///
/// Sections: `main` applies the command line and dispatches to the
/// environment section, which applies its overrides and includes `common`.
fn configure(mut config: MasterConfig, args: &RunArgs) -> Result<MasterConfig, ConfigError> {
    let environment = args
        .environment
        .clone()
        .or_else(|| config.master.environment.clone())
        .unwrap_or_else(|| "development".to_string());

    let mut c: Configurator<MasterConfig> = Configurator::new();

    let cli = args.clone();
    let env_name = environment.clone();
    c.define("main", move |c, cfg| {
        if cfg.puppets.is_empty() && cli.common.config.is_none() {
            cfg.puppets.push(PuppetSection::default());
        }
        if let Some(tag) = &cli.tag {
            cfg.master.proc_tag = Some(tag.clone());
        }
        if let Some(timeout) = cli.timeout {
            cfg.master.timeout = timeout;
        }
        if let Some(path) = &cli.common.pid_file {
            cfg.master.pid_file = Some(path.clone());
        }
        for (key, spec) in &cli.listen {
            cfg.listen.entry(key.clone()).or_default().push(spec.clone());
        }

        if c.include(&env_name) {
            c.call(&env_name, cfg)?;
        } else {
            c.call("common", cfg)?;
        }

        if let Some(count) = cli.workers {
            match cfg.puppet_mut(None) {
                Some(puppet) => puppet.count = count,
                None => return Err(ConfigError::ValidationError("--workers needs a main puppet".into())),
            }
        }
        Ok(())
    });

    let mut names: Vec<String> = config.environments.keys().cloned().collect();
    names.extend(["development".to_string(), "production".to_string()]);
    for name in names {
        if c.include(&name) {
            continue;
        }
        let section = name.clone();
        c.define(&name, move |c, cfg| {
            cfg.apply_environment(&section)?;
            c.call("common", cfg)
        });
    }

    c.define("common", |_, cfg| {
        cfg.validate()?;
        for puppet in &cfg.puppets {
            if puppet.payload == "echo" && puppet.listen.is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "puppet {} runs echo without a listen key",
                    puppet.key.as_deref().unwrap_or(DEFAULT_LISTENER_KEY)
                )));
            }
        }
        Ok(())
    });

    config.master.environment = Some(environment);
    c.call("main", &mut config)?;
    Ok(config)
}

/// Install the tracing subscriber on the configured sink.
fn setup_tracing(common: &CommonArgs, config: &MasterConfig) -> Result<LogSink, Box<dyn Error>> {
    let sink = match &config.master.log_file {
        Some(path) => LogSink::file(path)?,
        None => LogSink::stderr(),
    };
    init_tracing(&sink, config.master.log_level, common.verbose, common.json);
    Ok(sink)
}

fn pid_file(common: &CommonArgs, config: &MasterConfig) -> Result<PidFile, Box<dyn Error>> {
    common
        .pid_file
        .clone()
        .or_else(|| config.master.pid_file.clone())
        .map(PidFile::new)
        .ok_or_else(|| "no pid file given (--pid-file or [master] pid_file)".into())
}

fn signal_master(args: &ControlArgs, signal: Signal) -> Result<(), Box<dyn Error>> {
    let config = load_config(&args.common)?;
    setup_tracing(&args.common, &config)?;
    let pid_file = pid_file(&args.common, &config)?;
    match pid_file.running() {
        Some(pid) => {
            pid_file.send_signal(signal)?;
            info!("sent {signal} to master {pid}");
            Ok(())
        }
        None => Err(format!("no master running from {}", pid_file.path().display()).into()),
    }
}
