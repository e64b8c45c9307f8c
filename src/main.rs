//! monomux - terminal session multiplexer.
//!
//! `monomux server` runs the session-hosting daemon in the foreground.
//! Every other invocation is a client: list, create, or attach to
//! sessions, auto-spawning a server when none answers on the socket.

use clap::{Parser, Subcommand};
use monomux::client::{Client, ClientError, PumpOutcome};
use monomux::protocol::MakeSessionRequestMsg;
use monomux::server::{run_server, ServerOptions};
use monomux::{socket, terminal};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Process exit statuses, as seen by the invoking shell.
const EXIT_SUCCESS: u8 = 0;
const EXIT_SYSTEM_ERROR: u8 = 1;
const EXIT_INVOCATION_ERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "monomux", version, about = "Terminal session multiplexer", long_about = None)]
struct Args {
    /// Path of the server socket.
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the session server in the foreground.
    Server {
        /// Keep the server alive after its last session terminates.
        #[arg(long)]
        keepalive: bool,
    },
    /// List the sessions running on the server.
    List,
    /// Create a new session (and attach to it).
    New {
        /// Session name; a numeric name is assigned when omitted.
        #[arg(short, long, default_value = "")]
        name: String,

        /// Extra environment for the session, as KEY=VALUE.
        #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
        env_set: Vec<String>,

        /// Environment variables to unset in the session.
        #[arg(short = 'u', long = "unset", value_name = "KEY")]
        env_unset: Vec<String>,

        /// Program and arguments; the user's shell when omitted.
        #[arg(trailing_var_arg = true)]
        program: Vec<String>,
    },
    /// Attach to an existing session.
    Attach {
        /// Name of the session.
        name: String,
    },
    /// Print the server's statistics dump.
    Stats,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "monomux=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let socket_path = args.socket.clone().unwrap_or_else(socket::default_socket_path);

    let result = match args.command {
        Some(Command::Server { keepalive }) => {
            return match run_server(ServerOptions {
                socket_path,
                exit_on_last_session_terminate: !keepalive,
            }) {
                Ok(()) => ExitCode::from(EXIT_SUCCESS),
                Err(e) => {
                    eprintln!("monomux: server failed: {e}");
                    ExitCode::from(EXIT_SYSTEM_ERROR)
                }
            };
        }
        Some(Command::List) => cmd_list(&socket_path),
        Some(Command::Stats) => cmd_stats(&socket_path),
        Some(Command::New {
            name,
            env_set,
            env_unset,
            program,
        }) => cmd_new(&socket_path, name, env_set, env_unset, program),
        Some(Command::Attach { name }) => cmd_attach(&socket_path, &name),
        None => cmd_default(&socket_path),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("monomux: {e}");
            ExitCode::from(EXIT_SYSTEM_ERROR)
        }
    }
}

fn cmd_list(socket_path: &Path) -> Result<ExitCode, ClientError> {
    if !socket::probe(socket_path) {
        println!("no server running on {}", socket_path.display());
        return Ok(ExitCode::from(EXIT_SUCCESS));
    }
    let mut client = Client::connect_control(socket_path)?;
    let sessions = client.list_sessions()?;
    if sessions.is_empty() {
        println!("no sessions");
    }
    for session in sessions {
        let marker = if session.dead { " (dead)" } else { "" };
        println!("{}\tcreated {}{marker}", session.name, session.created_at);
    }
    Ok(ExitCode::from(EXIT_SUCCESS))
}

fn cmd_stats(socket_path: &Path) -> Result<ExitCode, ClientError> {
    let mut client = Client::connect_control(socket_path)?;
    print!("{}", client.statistics()?);
    Ok(ExitCode::from(EXIT_SUCCESS))
}

fn cmd_new(
    socket_path: &Path,
    name: String,
    env_set: Vec<String>,
    env_unset: Vec<String>,
    program: Vec<String>,
) -> Result<ExitCode, ClientError> {
    if let Some(code) = refuse_nested_session() {
        return Ok(code);
    }
    let env_set = match parse_env_pairs(&env_set) {
        Ok(pairs) => pairs,
        Err(bad) => {
            eprintln!("monomux: invalid --env value '{bad}', expected KEY=VALUE");
            return Ok(ExitCode::from(EXIT_INVOCATION_ERROR));
        }
    };

    ensure_server(socket_path)?;
    let mut client = Client::connect(socket_path)?;

    let (program, argv) = match program.split_first() {
        Some((head, tail)) => (head.clone(), tail.to_vec()),
        None => (String::new(), Vec::new()),
    };
    let resp = client.make_session(&MakeSessionRequestMsg {
        name,
        program,
        argv,
        env_set,
        env_unset,
    })?;
    if !resp.success {
        eprintln!("monomux: could not create session: {}", resp.error);
        return Ok(ExitCode::from(EXIT_INVOCATION_ERROR));
    }
    println!("created session '{}'", resp.name);

    attach_and_pump(&mut client, &resp.name)
}

fn cmd_attach(socket_path: &Path, name: &str) -> Result<ExitCode, ClientError> {
    if let Some(code) = refuse_nested_session() {
        return Ok(code);
    }
    let mut client = Client::connect(socket_path)?;
    attach_and_pump(&mut client, name)
}

/// No subcommand: attach to the most recently created session, creating a
/// default shell session when the server is empty.
fn cmd_default(socket_path: &Path) -> Result<ExitCode, ClientError> {
    if let Some(code) = refuse_nested_session() {
        return Ok(code);
    }
    ensure_server(socket_path)?;
    let mut client = Client::connect(socket_path)?;

    let mut sessions = client.list_sessions()?;
    sessions.retain(|s| !s.dead);
    let target = match sessions.iter().max_by_key(|s| s.created_at) {
        Some(session) => session.name.clone(),
        None => {
            let resp = client.make_session(&MakeSessionRequestMsg::default())?;
            if !resp.success {
                eprintln!("monomux: could not create session: {}", resp.error);
                return Ok(ExitCode::from(EXIT_SYSTEM_ERROR));
            }
            resp.name
        }
    };
    attach_and_pump(&mut client, &target)
}

fn attach_and_pump(client: &mut Client, name: &str) -> Result<ExitCode, ClientError> {
    let resp = client.attach(name)?;
    if !resp.success {
        eprintln!("monomux: could not attach to '{name}': {}", resp.error);
        return Ok(ExitCode::from(EXIT_INVOCATION_ERROR));
    }

    if let Ok((rows, cols)) = terminal::terminal_size() {
        client.window_size(rows, cols)?;
    }

    // Raw mode can fail when stdin is not a terminal; pump regardless.
    let raw_guard = terminal::RawModeGuard::new().ok();
    let outcome = client.pump();
    drop(raw_guard);

    match outcome? {
        PumpOutcome::SessionExit { name, exit_code } => {
            println!("\n[session '{name}' ended with code {exit_code}]");
            Ok(ExitCode::from(EXIT_SUCCESS))
        }
        PumpOutcome::ServerExit { reason } => {
            println!("\n[server exited: {reason}]");
            Ok(ExitCode::from(EXIT_SUCCESS))
        }
        PumpOutcome::Rejected { reason } => {
            eprintln!("\nmonomux: kicked by server: {reason}");
            Ok(ExitCode::from(EXIT_SYSTEM_ERROR))
        }
        PumpOutcome::Disconnected => {
            eprintln!("\nmonomux: connection to server lost");
            Ok(ExitCode::from(EXIT_SYSTEM_ERROR))
        }
    }
}

/// Attaching from inside a monomux session would nest byte pumps; refuse.
fn refuse_nested_session() -> Option<ExitCode> {
    if let Ok(session) = std::env::var(socket::SESSION_ENV_VAR) {
        eprintln!("monomux: already inside session '{session}'; refusing to nest");
        return Some(ExitCode::from(EXIT_INVOCATION_ERROR));
    }
    None
}

fn parse_env_pairs(pairs: &[String]) -> Result<Vec<(String, String)>, String> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| pair.clone())
        })
        .collect()
}

/// Make sure a server answers on `path`, spawning one in the background
/// when necessary. Readiness is probed on the socket, never guessed with
/// a fixed sleep.
fn ensure_server(path: &Path) -> Result<(), ClientError> {
    if socket::probe(path) {
        return Ok(());
    }

    let exe = std::env::current_exe()?;
    tracing::info!(path = %path.display(), "no server answering, spawning one");
    std::process::Command::new(exe)
        .arg("server")
        .arg("--socket")
        .arg(path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;

    if !socket::wait_until_ready(path, Duration::from_secs(5)) {
        return Err(ClientError::Handshake(format!(
            "spawned server did not come up on {}",
            path.display()
        )));
    }
    Ok(())
}
