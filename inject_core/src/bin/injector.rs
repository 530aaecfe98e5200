use std::io::{BufRead, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{info, warn};

use inject_core::{
    load_connection_config, load_connection_config_from_env, parse_control_line, Connection,
    ConnectionState, ControlLine,
};

/// How often the command loop checks for shutdown while no line arrives.
const STATE_CHECK: Duration = Duration::from_millis(200);

/// Why the command loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Interrupted,
    ConnectionClosed,
    ListenerGone,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Feed commands to a Minecraft server through structure files", long_about = None)]
struct Args {
    /// World directory the server loads structures from
    #[arg(long)]
    world: PathBuf,

    /// Server log to watch for command output (usually logs/latest.log)
    #[arg(long)]
    log: PathBuf,

    /// Connection config JSON (defaults to $INJECT_CONFIG_PATH, then builtin)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the session identifier from the config
    #[arg(long)]
    identifier: Option<String>,

    /// Address accepting operator command lines
    #[arg(long, default_value = "127.0.0.1:41100")]
    command_bind: SocketAddr,

    /// Seconds to wait for the game to confirm the first packet (0 waits forever)
    #[arg(long, default_value_t = 60)]
    handshake_secs: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let (mut config, metadata) = match &args.config {
        Some(path) => load_connection_config(Some(path)),
        None => load_connection_config_from_env(),
    };
    if let Some(identifier) = args.identifier.clone() {
        config = config.with_identifier(identifier);
    }

    let connection = Connection::new(&args.world, args.log.clone(), config)
        .with_context(|| format!("Invalid connection config (source: {:?})", metadata.path()))?;
    connection.add_chat_listener(|chat| {
        info!(
            target: "inject::injector",
            user = %chat.user,
            message = %chat.message,
            "chat.received"
        );
    });

    info!(
        target: "inject::injector",
        bootstrap = %connection.bootstrap_command(),
        "Run the bootstrap command in game and power the block to start loading"
    );
    let timeout = (args.handshake_secs > 0).then(|| Duration::from_secs(args.handshake_secs));
    connection.open(timeout).with_context(|| {
        format!(
            "Handshake with world {} failed",
            args.world.display()
        )
    })?;

    let command_rx = spawn_command_listener(args.command_bind)
        .with_context(|| format!("Failed to bind command listener on {}", args.command_bind))?;
    info!(
        target: "inject::injector",
        identifier = connection.identifier(),
        command_bind = %args.command_bind,
        "Injector ready"
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("Failed to install the interrupt handler")?;

    let stop = serve(&connection, &command_rx, &shutdown);
    info!(target: "inject::injector", reason = ?stop, "Injector stopping");
    connection.close().context("Failed to close connection")?;
    Ok(())
}

/// Apply operator lines until interrupted or the connection closes itself.
fn serve(
    connection: &Connection,
    commands: &Receiver<ControlLine>,
    shutdown: &AtomicBool,
) -> Stop {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Stop::Interrupted;
        }
        if connection.state() == ConnectionState::Closed {
            return Stop::ConnectionClosed;
        }
        match commands.recv_timeout(STATE_CHECK) {
            Ok(line) => apply(connection, line),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Stop::ListenerGone,
        }
    }
}

fn apply(connection: &Connection, line: ControlLine) {
    match line {
        ControlLine::Inject {
            kind,
            fetch: true,
            command,
        } => {
            let command = connection.inject_with_listener(kind, command, |event| {
                info!(
                    target: "inject::injector",
                    invoker = %event.invoker,
                    output = %event.message,
                    "command.output"
                );
            });
            info!(
                target: "inject::injector",
                %kind,
                invoker = command.name().unwrap_or_default(),
                "command.queued=fetch"
            );
        }
        ControlLine::Inject { kind, command, .. } => {
            connection.inject(kind, command);
            info!(target: "inject::injector", %kind, "command.queued");
        }
        ControlLine::Pause => {
            connection.pause();
        }
        ControlLine::Resume => {
            if let Err(err) = connection.resume() {
                warn!(target: "inject::injector", error = %err, "command.rejected=resume");
            }
        }
        ControlLine::Interval { millis } => {
            match connection.set_flush_interval(Duration::from_millis(millis)) {
                Ok(()) => info!(target: "inject::injector", millis, "command.applied=interval"),
                Err(err) => {
                    warn!(target: "inject::injector", error = %err, "command.rejected=interval")
                }
            }
        }
    }
}

fn spawn_command_listener(bind_addr: SocketAddr) -> Result<Receiver<ControlLine>> {
    let listener = TcpListener::bind(bind_addr)?;
    listener.set_nonblocking(true)?;

    let (sender, receiver) = unbounded::<ControlLine>();
    thread::Builder::new()
        .name("inject-command-accept".into())
        .spawn(move || loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    info!(target: "inject::injector", %addr, "client.connected");
                    let sender = sender.clone();
                    thread::spawn(move || handle_client(stream, sender));
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(50));
                }
                Err(err) => {
                    warn!(target: "inject::injector", error = %err, "client.accept_failed");
                    thread::sleep(Duration::from_millis(200));
                }
            }
        })?;

    Ok(receiver)
}

fn handle_client(stream: TcpStream, sender: Sender<ControlLine>) {
    if let Err(err) = stream.set_nonblocking(false) {
        warn!(target: "inject::injector", error = %err, "client.setup_failed");
        return;
    }
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                if line.trim().is_empty() {
                    continue;
                }
                match parse_control_line(&line) {
                    Ok(command) => {
                        if sender.send(command).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(
                        target: "inject::injector",
                        line = line.trim_end(),
                        error = %err,
                        "command.invalid"
                    ),
                }
            }
            Err(err) => {
                warn!(target: "inject::injector", error = %err, "client.read_failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inject_core::ConnectionConfig;

    fn idle_connection(world: &std::path::Path) -> Connection {
        let config = ConnectionConfig {
            identifier: "operator".into(),
            ..ConnectionConfig::default()
        };
        Connection::new(world, world.join("latest.log"), config).unwrap()
    }

    #[test]
    fn interrupt_ends_the_loop_while_clients_stay_connected() {
        let world = tempfile::tempdir().unwrap();
        let connection = idle_connection(world.path());
        let (_client, commands) = unbounded();
        let shutdown = AtomicBool::new(true);
        assert_eq!(serve(&connection, &commands, &shutdown), Stop::Interrupted);
    }

    #[test]
    fn closed_connection_ends_the_loop() {
        let world = tempfile::tempdir().unwrap();
        let connection = idle_connection(world.path());
        let (_client, commands) = unbounded();
        let shutdown = AtomicBool::new(false);
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(serve(&connection, &commands, &shutdown), Stop::ConnectionClosed);
    }

    #[test]
    fn interval_lines_apply_and_zero_is_rejected() {
        let world = tempfile::tempdir().unwrap();
        let connection = idle_connection(world.path());
        apply(&connection, parse_control_line("interval 75").unwrap());
        assert_eq!(connection.flush_interval(), Duration::from_millis(75));
        apply(&connection, ControlLine::Interval { millis: 0 });
        assert_eq!(connection.flush_interval(), Duration::from_millis(75));
    }
}
