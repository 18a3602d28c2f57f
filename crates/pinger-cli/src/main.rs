use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use pinger::client::{PingerClient, default_socket_path};
use pinger::mail_info::MailPingInformation;
use pinger::protocol::{Request, Response};
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "pinger", about = "pinger CLI")]
struct Cli {
    /// Path to the daemon's Unix socket.
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Identifies one session.
#[derive(Args, Debug, Clone)]
struct SessionArgs {
    #[arg(long = "client")]
    client_id: String,
    #[arg(long = "context")]
    client_context: String,
    #[arg(long = "device")]
    device_id: String,
    /// Token returned by `pinger start`.
    #[arg(long)]
    token: String,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon.
    Up {
        /// Run in the foreground (default: background).
        #[arg(long)]
        foreground: bool,
        /// TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// State directory.
        #[arg(long)]
        state_dir: Option<PathBuf>,
        /// SQLite database file.
        #[arg(long)]
        db: Option<PathBuf>,
        /// Keep device records in memory only.
        #[arg(long)]
        memory_store: bool,
        /// Push relay base URL.
        #[arg(long)]
        push_relay: Option<String>,
        /// Accept registrations even when push registration fails.
        #[arg(long)]
        ignore_push_failures: bool,
        /// Debug logging.
        #[arg(long)]
        debug: bool,
    },
    /// Stop the daemon and every session.
    Down,
    /// Start polling for a device. Reads the registration JSON from FILE,
    /// or from stdin when FILE is `-`.
    Start {
        file: PathBuf,
    },
    /// Stop a session.
    Stop {
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Suspend polling; it resumes after the timeout.
    Defer {
        #[command(flatten)]
        session: SessionArgs,
        /// Milliseconds; 0 uses the session's wait-before-use.
        #[arg(long, default_value_t = 0)]
        timeout_ms: u64,
    },
    /// List live sessions.
    Sessions {
        #[arg(long = "client")]
        client_id: Option<String>,
        #[arg(long = "context")]
        client_context: Option<String>,
        #[arg(long = "device")]
        device_id: Option<String>,
        /// Limit number of results.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Health check.
    Alive,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let socket_path = cli.socket.unwrap_or_else(default_socket_path);

    match cli.command {
        Command::Up {
            foreground,
            config,
            state_dir,
            db,
            memory_store,
            push_relay,
            ignore_push_failures,
            debug,
        } => {
            let mut args = vec!["--socket".into(), socket_path.into_os_string()];
            let paths = [("--config", config), ("--state-dir", state_dir), ("--db", db)];
            for (flag, value) in paths {
                if let Some(value) = value {
                    args.push(flag.into());
                    args.push(value.into_os_string());
                }
            }
            if let Some(url) = push_relay {
                args.push("--push-relay".into());
                args.push(url.into());
            }
            let switches = [
                ("--memory-store", memory_store),
                ("--ignore-push-failures", ignore_push_failures),
                ("--debug", debug),
            ];
            for (flag, on) in switches {
                if on {
                    args.push(flag.into());
                }
            }
            cmd_up(args, foreground)
        }
        Command::Down => {
            let mut client = connect(&socket_path).await?;
            client.request(Request::Shutdown).await?;
            println!("Daemon shutting down.");
            Ok(())
        }
        Command::Start { file } => {
            let info = read_registration(&file)?;
            let mut client = connect(&socket_path).await?;
            let resp = client.call(Request::Start { info: Box::new(info) }).await?;
            report(resp)
        }
        Command::Stop { session } => {
            let mut client = connect(&socket_path).await?;
            let resp = client
                .call(Request::Stop {
                    client_id: session.client_id,
                    client_context: session.client_context,
                    device_id: session.device_id,
                    token: session.token,
                })
                .await?;
            report(resp)
        }
        Command::Defer {
            session,
            timeout_ms,
        } => {
            let mut client = connect(&socket_path).await?;
            let resp = client
                .call(Request::Defer {
                    client_id: session.client_id,
                    client_context: session.client_context,
                    device_id: session.device_id,
                    token: session.token,
                    timeout_ms,
                })
                .await?;
            report(resp)
        }
        Command::Sessions {
            client_id,
            client_context,
            device_id,
            limit,
        } => {
            let mut client = connect(&socket_path).await?;
            let resp = client
                .call(Request::FindActiveSessions {
                    client_id,
                    client_context,
                    device_id,
                    max_results: limit,
                })
                .await?;
            report(resp)
        }
        Command::Alive => {
            let mut client = connect(&socket_path).await?;
            let resp = client.call(Request::AliveCheck).await?;
            report(resp)
        }
    }
}

async fn connect(socket_path: &Path) -> Result<PingerClient> {
    PingerClient::connect(socket_path).await.with_context(|| {
        format!(
            "failed to connect to pinger at {}. Is the daemon running? Try: pinger up",
            socket_path.display()
        )
    })
}

/// Print the reply's data. Warnings go to stderr; errors fail the command.
fn report(resp: Response) -> Result<()> {
    match resp {
        Response::Ok { message, data } => {
            if data.is_none() && !message.is_empty() {
                println!("{message}");
            }
            print_json(&data)
        }
        Response::Warn { message, data } => {
            eprintln!("warning: {message}");
            print_json(&data)
        }
        Response::Error { code, message } => bail!("{message} ({code})"),
        Response::Hello { .. } => Ok(()),
    }
}

fn print_json(data: &Option<serde_json::Value>) -> Result<()> {
    if let Some(v) = data {
        println!("{}", serde_json::to_string_pretty(v)?);
    }
    Ok(())
}

fn read_registration(file: &Path) -> Result<MailPingInformation> {
    let json = if file == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read registration from stdin")?;
        buf
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("failed to read {}", file.display()))?
    };
    serde_json::from_str(&json).context("registration is not valid JSON")
}

fn cmd_up(args: Vec<std::ffi::OsString>, foreground: bool) -> Result<()> {
    let node_bin = find_node_binary();
    let mut cmd = std::process::Command::new(&node_bin);
    cmd.args(&args);

    if foreground {
        let status = cmd
            .status()
            .with_context(|| format!("failed to run {}", node_bin.display()))?;
        if !status.success() {
            bail!("daemon exited with status {status}");
        }
    } else {
        cmd.stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", node_bin.display()))?;
        println!("Daemon started (pid {}).", child.id());
    }
    Ok(())
}

fn find_node_binary() -> PathBuf {
    // Next to this binary first
    if let Some(dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        let candidate = dir.join("pinger-node");
        if candidate.exists() {
            return candidate;
        }
    }
    PathBuf::from("pinger-node")
}
