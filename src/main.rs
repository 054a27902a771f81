mod common;
mod daemon;
mod ipc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::config::{
    is_valid_address, normalize_address, parse_delay, ConfigStore, DEFAULT_SOURCE_APP,
};
use common::logging::{init_logging, log_file_path};
use daemon::filter::RelayFilter;
use daemon::notifier::{default_sink, is_notification_available, NotificationSink};
use daemon::probe::{ConnectivityProbe, SystemProbe};
use daemon::relay::{RelayEngine, DEFAULT_MAX_WORKERS};
use daemon::server::{running_host_pid, HostExit, RelayHost};
use daemon::slot::SubstituteSlot;
use daemon::supervisor::{run_host_process, LifecycleSignal, Supervisor, EXIT_RESTART_REQUESTED};
use ipc::client::DaemonClient;
use ipc::messages::{get_backoff_file_path, get_socket_path, NotificationEvent, NotificationId};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "companion-relay")]
#[command(about = "Re-post messenger notifications while your companion device is away")]
struct Args {
    /// Log at debug level (same as COMPANION_RELAY_DEBUG=1)
    #[arg(long, global = true)]
    debug: bool,

    /// Also write logs to the relay log file
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Supervise the relay host, restarting it whenever it dies
    Daemon {
        /// Maximum number of events the host processes at once
        #[arg(long, default_value_t = DEFAULT_MAX_WORKERS)]
        workers: usize,
    },
    /// Run the relay host in the foreground
    Run {
        /// Maximum number of events processed at once
        #[arg(long, default_value_t = DEFAULT_MAX_WORKERS)]
        workers: usize,
    },
    /// Deliver a notification event to the running host
    Post {
        /// Application that posted the notification
        #[arg(long, default_value = DEFAULT_SOURCE_APP)]
        source: String,
        /// Notification id assigned by that application
        #[arg(long)]
        id: i64,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        body: Option<String>,
        /// Action handle that opens the conversation in the source app
        #[arg(long)]
        tap: Option<String>,
    },
    /// Show or change the relay configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Check once whether the companion device is connected
    Probe {
        /// Address to probe instead of the configured one
        #[arg(long)]
        mac: Option<String>,
    },
    /// Show relay host status
    Status,
    /// Stop the relay host
    Stop,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the current configuration
    Show,
    /// Update configuration values
    Set {
        /// Companion hardware address (empty string disables relaying)
        #[arg(long)]
        mac: Option<String>,
        /// Seconds a relayed notification stays visible (blank = 3)
        #[arg(long)]
        delay: Option<String>,
        /// Application id to relay notifications from
        #[arg(long)]
        source: Option<String>,
    },
}

fn build_host(workers: usize) -> RelayHost {
    let store = ConfigStore::open_default();
    let source = match store.load() {
        Ok(config) => config.source,
        Err(err) => {
            warn!(error = %err, "Configuration unreadable at startup, watching default source");
            DEFAULT_SOURCE_APP.to_string()
        }
    };
    info!(source = %source, config = %store.path().display(), "Relay configured");

    let sink: Arc<dyn NotificationSink> = Arc::from(default_sink());
    let probe: Arc<dyn ConnectivityProbe> = Arc::new(SystemProbe::bluez());
    let engine = RelayEngine::new(
        RelayFilter::new(source),
        Arc::new(store),
        probe,
        SubstituteSlot::new(Arc::clone(&sink)),
    )
    .with_max_workers(workers);
    RelayHost::new(Arc::new(engine), sink)
}

async fn run_host(workers: usize) -> i32 {
    let host = build_host(workers);
    match host.run().await {
        Ok(HostExit::Requested) => 0,
        Ok(HostExit::Terminated) => EXIT_RESTART_REQUESTED,
        Err(err) => {
            error!(error = %err, "Relay host failed");
            1
        }
    }
}

/// Command line for the supervised host, carrying over the logging flags
/// the supervisor was started with.
fn host_command_args(debug: bool, log_file: bool, workers: usize) -> Vec<String> {
    let mut args = Vec::new();
    if debug {
        args.push("--debug".to_string());
    }
    if log_file {
        args.push("--log-file".to_string());
    }
    args.push("run".to_string());
    args.push("--workers".to_string());
    args.push(workers.to_string());
    args
}

async fn run_supervisor(host_args: Vec<String>) -> Result<()> {
    let exe = std::env::current_exe().context("Failed to locate own executable")?;
    let socket_path = get_socket_path();
    let supervisor = Supervisor::new().with_backoff(get_backoff_file_path());
    let signals = supervisor.signals();

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let shutdown_signals = signals.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        let _ = shutdown_signals.send(LifecycleSignal::Shutdown).await;
    });

    signals
        .send(LifecycleSignal::BootCompleted)
        .await
        .context("Supervisor signal channel closed")?;

    let exit = supervisor
        .run(move |stop| run_host_process(exe.clone(), host_args.clone(), socket_path.clone(), stop))
        .await;
    info!(?exit, "Supervisor exited");
    Ok(())
}

fn connect_client() -> Result<DaemonClient> {
    let mut client = DaemonClient::new();
    if !client.connect() {
        bail!("Relay host is not running (start it with `companion-relay daemon`)");
    }
    Ok(client)
}

fn print_config(store: &ConfigStore) -> Result<()> {
    let config = store.load()?;
    println!("config file: {}", store.path().display());
    println!("mac:         {}", if config.mac.is_empty() { "(unset, relay disabled)" } else { config.mac.as_str() });
    println!("delay:       {}s", config.delay);
    println!("source:      {}", config.source);
    Ok(())
}

fn probe_and_report(address: &str) {
    if SystemProbe::bluez().is_companion_connected(address) {
        println!("{}: connected (notifications will not be relayed)", address);
    } else {
        println!("{}: not connected (notifications will be relayed)", address);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_guard = init_logging(args.debug, args.log_file);

    match args.command {
        Commands::Daemon { workers } => {
            run_supervisor(host_command_args(args.debug, args.log_file, workers)).await
        }

        Commands::Run { workers } => {
            let code = run_host(workers).await;
            // Flush buffered log lines before `exit` skips destructors.
            drop(log_guard);
            std::process::exit(code);
        }

        Commands::Post {
            source,
            id,
            title,
            body,
            tap,
        } => {
            let mut client = connect_client()?;
            let event = NotificationEvent {
                source_app_id: source,
                notification_id: NotificationId(id),
                title,
                body,
                tap_action: tap,
            };
            if !client.post(event) {
                bail!("Relay host rejected the event");
            }
            Ok(())
        }

        Commands::Config { action } => {
            let store = ConfigStore::open_default();
            match action {
                ConfigAction::Show => print_config(&store),
                ConfigAction::Set { mac, delay, source } => {
                    let mut config = store.load().unwrap_or_else(|err| {
                        eprintln!("Warning: replacing unreadable configuration ({})", err);
                        Default::default()
                    });
                    if let Some(mac) = mac {
                        let mac = normalize_address(&mac);
                        if !mac.is_empty() && !is_valid_address(&mac) {
                            eprintln!("Warning: {} does not look like a hardware address", mac);
                        }
                        config.mac = mac;
                    }
                    if let Some(delay) = delay {
                        config.delay = parse_delay(&delay)
                            .with_context(|| format!("Invalid delay: {:?}", delay))?;
                    }
                    if let Some(source) = source {
                        config.source = source;
                    }
                    store.save(&config)?;
                    print_config(&store)?;
                    if config.is_enabled() {
                        probe_and_report(&config.mac);
                    }
                    if !is_notification_available() {
                        eprintln!("Warning: no desktop notification backend found; relayed messages will only be logged");
                    }
                    Ok(())
                }
            }
        }

        Commands::Probe { mac } => {
            let address = match mac {
                Some(mac) => normalize_address(&mac),
                None => ConfigStore::open_default().load()?.mac,
            };
            if address.is_empty() {
                bail!("No companion address configured (use `companion-relay config set --mac ...`)");
            }
            probe_and_report(&address);
            Ok(())
        }

        Commands::Status => {
            let mut client = DaemonClient::new();
            let status = if client.connect() && client.ping() { client.status() } else { None };
            match status {
                Some(status) => {
                    println!("running:  {} (up {}s)", status.running, status.uptime_secs);
                    match (status.substitute_displayed_at, status.substitute_expires_at) {
                        (Some(at), Some(until)) => {
                            println!("showing:  substitute since {} (until {})", at, until)
                        }
                        (Some(at), None) => println!("showing:  substitute since {}", at),
                        _ => println!("showing:  nothing"),
                    }
                    let s = status.stats;
                    println!(
                        "events:   {} received, {} ignored, {} disabled, {} suppressed, {} relayed, {} failed",
                        s.received, s.ignored, s.disabled, s.suppressed, s.relayed, s.failed
                    );
                }
                None => match running_host_pid() {
                    Some(pid) => println!("Relay host process {} exists but is not answering", pid),
                    None => println!("Relay host is not running"),
                },
            }
            if let Some(path) = log_file_path() {
                println!("log file: {}", path.display());
            }
            Ok(())
        }

        Commands::Stop => {
            let mut client = connect_client()?;
            if !client.shutdown() {
                bail!("Relay host did not acknowledge shutdown");
            }
            println!("Relay host stopped");
            Ok(())
        }
    }
}
