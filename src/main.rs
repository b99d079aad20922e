//! ctf-practice - command-line client for the CTF practice platform.
//!
//! Usage:
//!   ctf-practice login <username> --password <password>
//!   ctf-practice challenges <category> <subcategory>
//!   ctf-practice watch <category> <subcategory> <challenge> [--start]

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use ctf_practice::api::ChallengeInfo;
use ctf_practice::config::{
    default_credentials_path, ClientConfig, TrackerSettings, API_URL_ENV, CREDENTIALS_ENV,
    DEFAULT_API_URL,
};
use ctf_practice::timestamp::Countdown;
use ctf_practice::tracker::{ContainerTracker, TrackerEvent};
use ctf_practice::{
    ChallengeKey, Classification, Credentials, HttpClient, PlatformApi, Registration,
};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ctf-practice")]
#[command(about = "Command-line client for the CTF practice platform")]
struct Args {
    /// Platform API base URL
    #[arg(long, env = API_URL_ENV, default_value = DEFAULT_API_URL, global = true)]
    api_url: String,

    /// File holding the saved login
    #[arg(long, env = CREDENTIALS_ENV, global = true)]
    credentials: Option<PathBuf>,

    /// Per-request timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone)]
struct ChallengeArgs {
    /// Category (e.g. Web)
    category: String,
    /// Subcategory within the category
    subcategory: String,
    /// Challenge name
    name: String,
}

impl ChallengeArgs {
    fn key(&self) -> ChallengeKey {
        ChallengeKey::new(&self.category, &self.subcategory, &self.name)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log in and save the token
    Login {
        username: String,
        #[arg(long, env = "CTF_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Create an account; run without --code first to get one by mail
    Register {
        username: String,
        email: String,
        #[arg(long, env = "CTF_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        /// Verification code from the mail
        #[arg(long)]
        code: Option<String>,
    },
    /// Reset a forgotten password; run without --code first to get one by mail
    ResetPassword {
        email: String,
        #[arg(long, env = "CTF_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        /// Reset code from the mail
        #[arg(long)]
        code: Option<String>,
    },
    /// Forget the saved token
    Logout,
    /// Show the saved login
    Whoami,
    /// List challenge categories
    Categories,
    /// List subcategories of a category
    Subcategories { category: String },
    /// List challenges in a subcategory
    Challenges {
        category: String,
        subcategory: String,
        /// Only show challenges not yet solved
        #[arg(long)]
        unsolved: bool,
    },
    /// Show a challenge and its container, if any
    Show(ChallengeArgs),
    /// Submit a flag
    Submit {
        #[command(flatten)]
        challenge: ChallengeArgs,
        flag: String,
    },
    /// Manage the challenge container
    Container {
        #[command(subcommand)]
        action: ContainerCommand,
    },
    /// Follow a challenge container interactively
    Watch {
        #[command(flatten)]
        challenge: ChallengeArgs,
        /// Start a container right away
        #[arg(long)]
        start: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ContainerCommand {
    /// Show the running container, whichever challenge it belongs to
    Status,
    Start(ChallengeArgs),
    Stop(ChallengeArgs),
    Extend(ChallengeArgs),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = ClientConfig::new(&args.api_url)
        .with_timeout(args.timeout.map(Duration::from_secs));
    let creds_path = args.credentials.clone().unwrap_or_else(default_credentials_path);
    let out = Output { json: args.json };

    match args.command {
        Commands::Login { username, password } => {
            let creds = HttpClient::login(&config, &username, &password).await?;
            creds
                .save(&creds_path)
                .with_context(|| format!("saving credentials to {}", creds_path.display()))?;
            let name = creds.username.as_deref().unwrap_or(&username);
            println!("Logged in as {name}{}", if creds.is_admin() { " (admin)" } else { "" });
        }
        Commands::Register {
            username,
            email,
            password,
            code,
        } => {
            let notice = match code {
                None => HttpClient::request_register_code(&config, &email).await?,
                Some(verify_code) => {
                    let Some(password) = password else {
                        bail!("--password is required together with --code");
                    };
                    let registration = Registration {
                        username,
                        password,
                        email,
                        verify_code,
                    };
                    HttpClient::register(&config, &registration).await?
                }
            };
            println!("{notice}");
        }
        Commands::ResetPassword {
            email,
            password,
            code,
        } => {
            let notice = match (code, password) {
                (None, _) => HttpClient::request_reset_code(&config, &email).await?,
                (Some(code), Some(password)) => {
                    HttpClient::reset_password(&config, &email, &password, &code).await?
                }
                (Some(_), None) => bail!("--password is required together with --code"),
            };
            println!("{notice}");
        }
        Commands::Logout => {
            if Credentials::clear(&creds_path)? {
                println!("Logged out");
            } else {
                println!("Not logged in");
            }
        }
        Commands::Whoami => {
            let creds = load_credentials(&creds_path)?;
            println!(
                "{}{}",
                creds.username.as_deref().unwrap_or("(unknown user)"),
                if creds.is_admin() { " (admin)" } else { "" }
            );
        }
        Commands::Categories => {
            let client = client(config, &creds_path)?;
            let categories = client.categories().await?;
            out.list(&categories, |c| format!("{:>4}  {}", c.id, c.name))?;
        }
        Commands::Subcategories { category } => {
            let client = client(config, &creds_path)?;
            let subcategories = client.subcategories(&category).await?;
            out.list(&subcategories, |s| format!("{:>4}  {}", s.id, s.name))?;
        }
        Commands::Challenges {
            category,
            subcategory,
            unsolved,
        } => {
            let client = client(config, &creds_path)?;
            let mut challenges = client.challenges(&category, &subcategory).await?;
            if unsolved {
                challenges.retain(|c| !c.solved);
            }
            out.list(&challenges, |c| {
                format!(
                    "{:>4}  [{}] {}  ({} solves)",
                    c.id,
                    if c.solved { "x" } else { " " },
                    c.name,
                    c.solves
                )
            })?;
        }
        Commands::Show(challenge) => {
            let client = client(config, &creds_path)?;
            let key = challenge.key();
            let info = client.challenge_info(&key).await?;
            let container = match info.classification() {
                Classification::Dynamic => client
                    .container_status()
                    .await?
                    .filter(|report| report.matches(&key)),
                _ => None,
            };
            if out.json {
                out.value(&serde_json::json!({ "challenge": info, "container": container }))?;
            } else {
                print_challenge(&info);
                if let Some(report) = container {
                    println!(
                        "Container: {} (until {})",
                        report.endpoint.as_deref().unwrap_or("?"),
                        report
                            .end_time
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| "?".into())
                    );
                }
            }
        }
        Commands::Submit { challenge, flag } => {
            let tracker = tracker(client(config, &creds_path)?);
            tracker.load(challenge.key()).await?;
            let verdict = tracker.submit_flag(&flag).await?;
            tracker.shutdown().await;
            if out.json {
                out.value(&verdict)?;
            } else if verdict.correct {
                println!("Correct! {}", verdict.cause);
            } else {
                println!("Incorrect: {}", verdict.cause);
            }
        }
        Commands::Container { action } => {
            container_command(action, client(config, &creds_path)?, out).await?;
        }
        Commands::Watch { challenge, start } => {
            watch(tracker(client(config, &creds_path)?), challenge.key(), start).await?;
        }
    }
    Ok(())
}

async fn container_command(action: ContainerCommand, client: HttpClient, out: Output) -> Result<()> {
    let challenge = match &action {
        ContainerCommand::Status => return container_status(&client, out).await,
        ContainerCommand::Start(c) | ContainerCommand::Stop(c) | ContainerCommand::Extend(c) => {
            c.key()
        }
    };

    let tracker = tracker(client);
    tracker.load(challenge).await?;
    let result = match action {
        ContainerCommand::Start(_) => tracker.start().await.map(Some),
        ContainerCommand::Extend(_) => tracker.extend().await.map(Some),
        _ => tracker.stop().await.map(|()| None),
    };
    tracker.shutdown().await;

    match result? {
        Some(session) if out.json => out.value(&session)?,
        Some(session) => println!(
            "Container {} running until {} ({} left)",
            session.endpoint,
            session.end_time.to_rfc3339(),
            Countdown::between(Utc::now(), session.end_time)
        ),
        None => println!("Container stopped"),
    }
    Ok(())
}

async fn container_status(client: &HttpClient, out: Output) -> Result<()> {
    match client.container_status().await? {
        Some(report) if out.json => out.value(&report)?,
        Some(report) => println!(
            "{} -> {} (until {})",
            report.challenge_name.as_deref().unwrap_or("?"),
            report.endpoint.as_deref().unwrap_or("?"),
            report
                .end_time
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "?".into())
        ),
        None => println!("No running container"),
    }
    Ok(())
}

async fn watch(tracker: ContainerTracker<HttpClient>, key: ChallengeKey, start: bool) -> Result<()> {
    let mut events = tracker.subscribe();
    let info = tracker.load(key).await?;
    print_challenge(&info);
    println!("Commands: start, stop, extend, status, flag <value>, quit");
    if start {
        // The outcome arrives on the event stream.
        let _ = tracker.start().await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => render(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "dropped tracker events"),
                Err(RecvError::Closed) => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                match line.split_once(' ').unwrap_or((line, "")) {
                    ("quit" | "exit", _) => break,
                    ("start", _) => { let _ = tracker.start().await; }
                    ("stop", _) => { let _ = tracker.stop().await; }
                    ("extend", _) => { let _ = tracker.extend().await; }
                    ("status", _) => {
                        tracker.reconcile().await;
                        let snapshot = tracker.snapshot().await;
                        println!(
                            "\n{} | {}{}",
                            snapshot.classification.label(),
                            snapshot.phase,
                            snapshot
                                .remaining
                                .map(|r| format!(" | {r} left"))
                                .unwrap_or_default()
                        );
                    }
                    ("flag", flag) => { let _ = tracker.submit_flag(flag).await; }
                    ("", _) => {}
                    (other, _) => eprintln!("unknown command: {other}"),
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    tracker.shutdown().await;
    println!();
    Ok(())
}

fn render(event: &TrackerEvent) {
    match event {
        TrackerEvent::Loaded { classification, .. } => {
            println!("Challenge type: {}", classification.label());
        }
        TrackerEvent::Resumed(session) => {
            println!("Container running at {}", session.endpoint);
        }
        TrackerEvent::Started(session) => {
            println!("Container started at {}", session.endpoint);
        }
        TrackerEvent::Extended(session) => {
            println!("\nContainer extended until {}", session.end_time.to_rfc3339());
        }
        TrackerEvent::Stopped => println!("\nContainer stopped"),
        TrackerEvent::Ended { reason, .. } => println!("\nContainer ended ({reason:?})"),
        TrackerEvent::Tick { remaining } => {
            print!("\rTime left: {remaining}");
            let _ = std::io::stdout().flush();
        }
        TrackerEvent::FlagChecked(verdict) if verdict.correct => {
            println!("\nCorrect! {}", verdict.cause);
        }
        TrackerEvent::FlagChecked(verdict) => println!("\nIncorrect: {}", verdict.cause),
        TrackerEvent::Failed { action, message } => {
            eprintln!("\n{action:?} failed: {message}");
        }
    }
}

fn print_challenge(info: &ChallengeInfo) {
    println!("{}", info.key);
    println!(
        "  {} | {} solves | {}",
        info.classification().label(),
        info.solves,
        if info.solved { "solved" } else { "unsolved" }
    );
    if let Some(description) = info.description.as_deref().filter(|d| !d.is_empty()) {
        println!("\n{description}");
    }
    if let Some(hint) = info.hint.as_deref().filter(|h| !h.is_empty()) {
        println!("\nHint: {hint}");
    }
    if let Some(appendix) = info.appendix.as_deref().filter(|a| !a.is_empty()) {
        println!("\nAttachment: {appendix}");
    }
}

fn load_credentials(path: &std::path::Path) -> Result<Credentials> {
    match Credentials::load(path)
        .with_context(|| format!("reading credentials from {}", path.display()))?
    {
        Some(creds) => Ok(creds),
        None => bail!("not logged in; run `ctf-practice login` first"),
    }
}

fn client(config: ClientConfig, creds_path: &std::path::Path) -> Result<HttpClient> {
    Ok(HttpClient::new(config, load_credentials(creds_path)?)?)
}

fn tracker(client: HttpClient) -> ContainerTracker<HttpClient> {
    ContainerTracker::with_system_clock(Arc::new(client), TrackerSettings::default())
}

#[derive(Debug, Clone, Copy)]
struct Output {
    json: bool,
}

impl Output {
    fn value<T: Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    fn list<T: Serialize>(&self, items: &[T], line: impl Fn(&T) -> String) -> Result<()> {
        if self.json {
            return self.value(&items);
        }
        if items.is_empty() {
            println!("(none)");
        }
        for item in items {
            println!("{}", line(item));
        }
        Ok(())
    }
}
