//! remux - host daemon and control CLI.
//!
//! The same binary serves both roles: `remux daemon`/`remux supervise` run
//! the long-lived processes, everything else is a short-lived control
//! command that dials the daemon over localhost.

use std::io::{self, Write};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;

use remux::auth::AuthStore;
use remux::client::DaemonClient;
use remux::config::{DaemonConfig, Paths, DEFAULT_PORT, SESSION_PREFIX};
use remux::db::Database;
use remux::files::expand_tilde;
use remux::session::models::SessionSnapshot;
use remux::supervisor;
use remux::tls;
use remux::ws::{ClientMessage, ServerMessage};

fn main() -> ExitCode {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "Error: {err:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    match cli.command {
        Command::Attach { ref id } => handle_attach(id),
        command => run_async(command),
    }
}

#[tokio::main]
async fn run_async(command: Command) -> Result<()> {
    let paths = Paths::resolve()?;
    match command {
        Command::Start { port, foreground } => handle_start(&paths, port, foreground).await,
        Command::Stop { kill_sessions } => handle_stop(&paths, kill_sessions).await,
        Command::Status { port } => handle_status(&paths, port).await,
        Command::Token { rotate } => handle_token(&paths, rotate).await,
        Command::Qr { port } => handle_qr(&paths, port).await,
        Command::New {
            path,
            model,
            plan,
            shell,
            port,
        } => handle_new(&paths, port, path, model, plan, shell).await,
        Command::List { port } => handle_list(&paths, port).await,
        Command::Kill { id, port } => handle_kill(&paths, port, &id).await,
        Command::Install { port } => handle_install(port),
        Command::Uninstall => handle_uninstall(),
        Command::Daemon { port } => {
            let config = DaemonConfig {
                port,
                ..DaemonConfig::default()
            };
            remux::daemon::run(paths, config).await
        }
        Command::Supervise { port } => supervisor::run(&paths, port).await,
        Command::Attach { .. } => unreachable!("handled before the runtime starts"),
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "remux",
    author,
    version,
    about = "Host tmux-backed assistant sessions and serve them to remote clients."
)]
struct Cli {
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Reduce output to only errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the daemon (supervised, in the background by default)
    Start {
        /// Port to listen on
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Run in the foreground without the supervisor
        #[arg(short, long)]
        foreground: bool,
    },
    /// Stop the daemon
    Stop {
        /// Also kill every hosted tmux session
        #[arg(long)]
        kill_sessions: bool,
    },
    /// Show daemon and session status
    Status {
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Print the access token
    Token {
        /// Rotate the token, invalidating existing clients
        #[arg(short, long)]
        rotate: bool,
    },
    /// Print the connection URL as a QR code
    Qr {
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Create a new session
    New {
        /// Project directory (defaults to the current directory)
        #[arg(short, long)]
        path: Option<String>,
        /// Model for the assistant
        #[arg(short, long)]
        model: Option<String>,
        /// Start the assistant in plan mode
        #[arg(long)]
        plan: bool,
        /// Host a plain shell instead of the assistant
        #[arg(long)]
        shell: bool,
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// List sessions
    List {
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Attach the local terminal to a session
    Attach {
        /// Session id
        id: String,
    },
    /// Kill a session
    Kill {
        /// Session id
        id: String,
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Install the daemon as a user service
    Install {
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Remove the user service
    Uninstall,
    /// Run the daemon in this process (used by the supervisor)
    #[command(hide = true)]
    Daemon {
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Run the supervisor loop in this process
    #[command(hide = true)]
    Supervise {
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        LevelFilter::Error
    } else {
        match cli.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
    builder.filter_level(level);
    builder.format_timestamp_secs();
    let _ = builder.try_init();
}

async fn stored_token(paths: &Paths) -> Result<String> {
    paths.ensure()?;
    let db = Database::open(&paths.db_path()).await?;
    let token = AuthStore::new(db.clone()).token().await?;
    db.close().await;
    Ok(token)
}

async fn connect(paths: &Paths, port: u16) -> Result<DaemonClient> {
    let token = stored_token(paths).await?;
    DaemonClient::connect(port, &token).await
}

async fn handle_start(paths: &Paths, port: u16, foreground: bool) -> Result<()> {
    if foreground {
        let config = DaemonConfig {
            port,
            ..DaemonConfig::default()
        };
        return remux::daemon::run(paths.clone(), config).await;
    }

    if let Some(pid) = supervisor::running_pid(paths) {
        bail!("daemon already running (pid {pid})");
    }
    paths.ensure()?;

    let exe = std::env::current_exe().context("resolving own executable")?;
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.log_file())?;
    let log_err = log.try_clone()?;

    use std::os::unix::process::CommandExt;
    let port_arg = port.to_string();
    let child = std::process::Command::new(exe)
        .args(["supervise", "-p", port_arg.as_str()])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::from(log))
        .stderr(std::process::Stdio::from(log_err))
        .process_group(0)
        .spawn()
        .context("spawning supervisor")?;

    println!("daemon starting on port {port} (supervisor pid {})", child.id());
    println!("log: {}", paths.log_file().display());
    Ok(())
}

async fn handle_stop(paths: &Paths, kill_sessions: bool) -> Result<()> {
    let Some(pid) = supervisor::running_pid(paths) else {
        println!("daemon is not running");
        return Ok(());
    };

    let sig = if kill_sessions {
        libc::SIGUSR1
    } else {
        libc::SIGTERM
    };
    unsafe {
        libc::kill(pid as libc::pid_t, sig);
    }

    // Give the supervisor a moment to wind the daemon down.
    for _ in 0..50 {
        if !supervisor::process_alive(pid) {
            println!("daemon stopped");
            return Ok(());
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
    bail!("daemon (pid {pid}) did not exit in time");
}

async fn handle_status(paths: &Paths, port: u16) -> Result<()> {
    match supervisor::running_pid(paths) {
        Some(pid) => println!("supervisor: running (pid {pid})"),
        None => println!("supervisor: not running"),
    }

    match connect(paths, port).await {
        Ok(mut client) => {
            let reply = client
                .request(ClientMessage::GetSessions {}, |m| {
                    matches!(m, ServerMessage::SessionsList { .. })
                })
                .await?;
            if let ServerMessage::SessionsList { sessions } = reply {
                println!("daemon: reachable on port {port}, {} session(s)", sessions.len());
            }
            client.close().await;
        }
        Err(e) => println!("daemon: not reachable ({e:#})"),
    }
    Ok(())
}

async fn handle_token(paths: &Paths, rotate: bool) -> Result<()> {
    paths.ensure()?;
    let db = Database::open(&paths.db_path()).await?;
    let auth = AuthStore::new(db.clone());
    let token = if rotate {
        let t = auth.rotate().await?;
        eprintln!("token rotated; connected clients must re-authenticate");
        t
    } else {
        auth.token().await?
    };
    db.close().await;
    println!("{token}");
    Ok(())
}

async fn handle_qr(paths: &Paths, port: u16) -> Result<()> {
    let token = stored_token(paths).await?;
    let host = local_hostname();
    let scheme = tls::url_scheme(&host);
    let url = format!("{scheme}://{host}:{port}/ws?token={token}");
    println!("{url}");
    print_qr(&url);
    Ok(())
}

async fn handle_new(
    paths: &Paths,
    port: u16,
    path: Option<String>,
    model: Option<String>,
    plan: bool,
    shell: bool,
) -> Result<()> {
    let project = match path {
        Some(p) => std::path::PathBuf::from(expand_tilde(&p)),
        None => std::env::current_dir()?,
    };
    let project = project
        .canonicalize()
        .with_context(|| format!("resolving {}", project.display()))?;

    let mut client = connect(paths, port).await?;
    let reply = client
        .request(
            ClientMessage::CreateSession {
                project_path: project.display().to_string(),
                model,
                plan_mode: plan,
                session_type: Some(if shell { "shell" } else { "assistant" }.to_string()),
            },
            |m| matches!(m, ServerMessage::SessionCreated { .. }),
        )
        .await?;
    client.close().await;

    if let ServerMessage::SessionCreated { session } = reply {
        println!("created session {} ({})", session.id, session.state);
        println!("attach locally with: remux attach {}", session.id);
    }
    Ok(())
}

async fn handle_list(paths: &Paths, port: u16) -> Result<()> {
    let mut client = connect(paths, port).await?;
    let reply = client
        .request(ClientMessage::GetSessions {}, |m| {
            matches!(m, ServerMessage::SessionsList { .. })
        })
        .await?;
    client.close().await;

    if let ServerMessage::SessionsList { sessions } = reply {
        if sessions.is_empty() {
            println!("no sessions");
            return Ok(());
        }
        print_session_table(&sessions);
    }
    Ok(())
}

async fn handle_kill(paths: &Paths, port: u16, id: &str) -> Result<()> {
    let mut client = connect(paths, port).await?;
    let wanted = id.to_string();
    client
        .request(
            ClientMessage::KillSession {
                session_id: id.to_string(),
            },
            move |m| matches!(m, ServerMessage::SessionKilled { session_id } if *session_id == wanted),
        )
        .await?;
    client.close().await;
    println!("killed session {id}");
    Ok(())
}

fn handle_attach(id: &str) -> Result<()> {
    use std::os::unix::process::CommandExt;
    let target = format!("={SESSION_PREFIX}-{id}");
    let err = std::process::Command::new("tmux")
        .args(["attach-session", "-t", target.as_str()])
        .exec();
    // exec only returns on failure.
    Err(err).context("running tmux attach-session")
}

fn handle_install(port: u16) -> Result<()> {
    if !cfg!(target_os = "linux") {
        bail!("service install is only wired up for systemd hosts");
    }
    let exe = std::env::current_exe()?;
    let unit_dir = dirs::config_dir()
        .context("could not determine user config directory")?
        .join("systemd/user");
    std::fs::create_dir_all(&unit_dir)?;
    let unit_path = unit_dir.join("remux.service");

    let unit = format!(
        "[Unit]\n\
         Description=remux session daemon\n\
         After=network.target\n\n\
         [Service]\n\
         ExecStart={} daemon -p {port}\n\
         Restart=on-failure\n\
         RestartSec=2\n\n\
         [Install]\n\
         WantedBy=default.target\n",
        exe.display()
    );
    std::fs::write(&unit_path, unit)
        .with_context(|| format!("writing {}", unit_path.display()))?;

    run_systemctl(&["daemon-reload"])?;
    run_systemctl(&["enable", "--now", "remux.service"])?;
    println!("installed and started remux.service (user)");
    println!("the service manager handles restarts; the built-in supervisor is not used");
    Ok(())
}

fn handle_uninstall() -> Result<()> {
    if !cfg!(target_os = "linux") {
        bail!("service install is only wired up for systemd hosts");
    }
    let _ = run_systemctl(&["disable", "--now", "remux.service"]);
    let unit_path = dirs::config_dir()
        .context("could not determine user config directory")?
        .join("systemd/user/remux.service");
    if unit_path.exists() {
        std::fs::remove_file(&unit_path)?;
    }
    let _ = run_systemctl(&["daemon-reload"]);
    println!("removed remux.service (user)");
    Ok(())
}

fn run_systemctl(args: &[&str]) -> Result<()> {
    let status = std::process::Command::new("systemctl")
        .arg("--user")
        .args(args)
        .status()
        .context("running systemctl")?;
    if !status.success() {
        bail!("systemctl --user {} failed", args.join(" "));
    }
    Ok(())
}

fn print_session_table(sessions: &[SessionSnapshot]) {
    println!(
        "{:<14} {:<22} {:<10} {:<10} PROJECT",
        "ID", "STATE", "KIND", "MODEL"
    );
    for s in sessions {
        println!(
            "{:<14} {:<22} {:<10} {:<10} {}",
            s.id,
            s.state.to_string(),
            s.session_type.to_string(),
            s.model.as_deref().unwrap_or("-"),
            s.project_path
        );
    }
}

fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        if let Ok(name) = std::str::from_utf8(&buf[..end]) {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    "localhost".to_string()
}

/// Render a QR code with Unicode modules, two per character cell.
fn print_qr(data: &str) {
    use qrcode::QrCode;

    let code = match QrCode::new(data.as_bytes()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("(QR code generation failed: {e})");
            return;
        }
    };
    let image = code
        .render::<char>()
        .quiet_zone(true)
        .module_dimensions(2, 1)
        .build();
    println!("{image}");
}
