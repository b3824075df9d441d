//! authkeeper - drive an authenticated API session from the command line.
//!
//! Remembered credentials persist in the configured durable tier; anything
//! else lives only as long as the process.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use authkeeper_core::auth::{decode_expiry, Credential, CredentialStore, LoginRedirect};
use authkeeper_core::storage::MemoryStorage;
use authkeeper_core::sync::{CrossTabSync, FileChannel};
use authkeeper_core::{ApiClient, AuthState, Config};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "\
Usage: authkeeper [--log-file <path>] <command>

Commands:
  decode <token>             Show the expiry carried by a token
  status                     Show the stored session
  login <token> [--remember] Store a token and start the session
  logout                     Clear the session
  get <path>                 GET a path under the API base URL
  watch                      Keep the session renewed until Ctrl-C";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr unless a log file is given. The returned guard must be
/// held until exit so buffered file output is flushed.
fn init_tracing(log_file: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let target = log_file.and_then(|path| {
        let name = path.file_name()?.to_owned();
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        Some((dir, name))
    });

    match target {
        Some((dir, name)) => {
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

/// Tells the user where to sign in again.
struct PrintRedirect;

impl LoginRedirect for PrintRedirect {
    fn redirect_to_login(&self, login_url: &str) {
        eprintln!("Session ended. Sign in again at {}", login_url);
    }
}

enum Command {
    Decode(String),
    Session(SessionCommand),
}

/// Commands that act on the stored session
enum SessionCommand {
    Status,
    Login { token: String, remember: bool },
    Logout,
    Get(String),
    Watch,
}

struct Args {
    log_file: Option<PathBuf>,
    command: Command,
}

fn parse_args(args: &[String]) -> Result<Args> {
    let mut log_file = None;
    let mut positional = Vec::new();
    let mut remember = false;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--log-file" => {
                let path = iter.next().context("--log-file requires a path")?;
                log_file = Some(PathBuf::from(path));
            }
            "--remember" => remember = true,
            "-h" | "--help" => bail!("{}", USAGE),
            _ => positional.push(arg.as_str()),
        }
    }

    let command = match positional.as_slice() {
        ["decode", token] => Command::Decode(token.to_string()),
        ["status"] => Command::Session(SessionCommand::Status),
        ["login", token] => Command::Session(SessionCommand::Login {
            token: token.to_string(),
            remember,
        }),
        ["logout"] => Command::Session(SessionCommand::Logout),
        ["get", path] => Command::Session(SessionCommand::Get(path.to_string())),
        ["watch"] => Command::Session(SessionCommand::Watch),
        _ => bail!("{}", USAGE),
    };

    Ok(Args { log_file, command })
}

fn build_client(config: Config) -> Result<ApiClient> {
    let durable = config.durable_storage()?;
    // Other authkeeper processes of this user see logins, renewals and logouts
    let channel = Arc::new(FileChannel::in_dir(&Config::data_dir()?));
    let store = CredentialStore::new(durable, Arc::new(MemoryStorage::new()), channel);
    Ok(ApiClient::with_redirect(config, store, Arc::new(PrintRedirect))?)
}

fn print_credential(credential: &Credential) {
    let summary = serde_json::json!({
        "expires_at": credential.expires_at().map(|t| t.to_rfc3339()),
        "minutes_until_expiry": credential.minutes_until_expiry(),
        "expired": credential.is_expired(),
    });
    println!("{}", summary);
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let raw: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&raw)?;

    let _guard = init_tracing(args.log_file.as_deref());
    info!("authkeeper starting");

    match args.command {
        Command::Decode(token) => {
            if decode_expiry(&token).is_none() {
                bail!("Token carries no readable expiry");
            }
            print_credential(&Credential::new(token));
            Ok(())
        }
        Command::Session(command) => {
            let config = Config::load()?;
            let client = build_client(config)?;
            run(&client, command).await
        }
    }
}

async fn run(client: &ApiClient, command: SessionCommand) -> Result<()> {
    match command {
        SessionCommand::Status => match client.resume() {
            Some(credential) => {
                println!("authenticated ({:?} storage)", client.store().active_tier());
                print_credential(&credential);
            }
            None => println!("unauthenticated"),
        },
        SessionCommand::Login { token, remember } => {
            if decode_expiry(&token).is_none() {
                eprintln!("Warning: token carries no readable expiry, it will not be renewed ahead of time");
            }
            let credential = client.login(&token, remember);
            print_credential(&credential);
            if !remember {
                eprintln!("Not remembered: the session ends when this process exits");
            }
        }
        SessionCommand::Logout => {
            client.logout();
            println!("logged out");
        }
        SessionCommand::Get(path) => {
            if client.resume().is_none() {
                eprintln!("No stored session, sending without credentials");
            }
            let body = client.get_text(&path).await?;
            println!("{}", body);
        }
        SessionCommand::Watch => watch(client).await?,
    }

    Ok(())
}

/// Keep the session alive, reporting state changes until Ctrl-C.
async fn watch(client: &ApiClient) -> Result<()> {
    if client.resume().is_none() {
        bail!("No stored session. Run `authkeeper login <token>` first.");
    }
    let _sync = CrossTabSync::spawn(client);
    let mut state = client.subscribe_auth_state();
    let mut revision = client.subscribe_credential();

    eprintln!("Watching session, press Ctrl-C to stop");
    loop {
        tokio::select! {
            changed = state.changed() => {
                changed?;
                let current = *state.borrow_and_update();
                match current {
                    AuthState::Authenticated => println!("authenticated"),
                    AuthState::Unauthenticated => {
                        println!("unauthenticated");
                        return Ok(());
                    }
                }
            }
            changed = revision.changed() => {
                changed?;
                revision.borrow_and_update();
                if let Some(credential) = client.credential() {
                    println!("credential updated");
                    print_credential(&credential);
                }
            }
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}
