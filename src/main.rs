//! `foreman` binary: run the chat server or talk to one from a terminal.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use foreman_client::{ClientConfig, ClientUpdate, EventKind, HistoryClient, Notice, TransportManager};
use foreman_core::{ClientEvent, Responder, ServerEvent, SessionId};
use foreman_llm::{ChunkConfig, EchoResponder, RetryConfig, RetryingResponder, StreamingResponder};
use foreman_ratelimit::{LimitSettings, MemoryCounterStore};
use foreman_server::{ChatConfig, ForemanServer, ServerConfig, ServerParts, StaticTokenVerifier};
use foreman_settings::{ForemanSettings, load_settings, load_settings_from_path, resolve_database_path};
use foreman_store::Database;
use foreman_telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "foreman", version, about = "Real-time project chat")]
struct Cli {
    /// Settings file (defaults to ~/.foreman/settings.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the chat server.
    Serve(ServeArgs),
    /// Chat with a running server from the terminal.
    Chat(ChatArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,
    /// Answer with the built-in echo responder.
    #[arg(long)]
    echo: bool,
}

#[derive(Args)]
struct ChatArgs {
    /// Bearer token.
    #[arg(long)]
    token: String,
    /// Server URL (defaults to client.serverUrl from settings).
    #[arg(long)]
    url: Option<String>,
    /// Resume an existing session.
    #[arg(long)]
    session: Option<String>,
    /// Project the session is about.
    #[arg(long)]
    project: Option<String>,
    /// Ask for whole answers instead of streamed fragments.
    #[arg(long)]
    no_stream: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => load_settings().context("loading settings")?,
    };
    init_telemetry(&TelemetryConfig::from_settings(&settings.logging))?;

    match cli.command {
        Command::Serve(args) => serve(settings, args).await,
        Command::Chat(args) => chat(&settings, args).await,
    }
}

async fn serve(settings: ForemanSettings, args: ServeArgs) -> Result<()> {
    if !args.echo {
        bail!("no responder configured; run with --echo for the built-in echo responder");
    }

    let mut config = ServerConfig::from_settings(&settings);
    if let Some(port) = args.port {
        config.port = port;
    }

    let db_path = resolve_database_path(&settings);
    let db = Database::open(&db_path)
        .with_context(|| format!("opening database at {}", db_path.display()))?;
    info!(path = %db_path.display(), "database opened");

    let verifier = StaticTokenVerifier::from_settings(&settings.auth);
    if verifier.is_empty() {
        warn!("no auth tokens configured; every connection will be refused");
    }

    let echo: Arc<dyn Responder> = Arc::new(EchoResponder::new(Duration::from_millis(
        settings.responder.echo_pace_ms,
    )));
    let retry = RetryConfig {
        max_retries: settings.responder.max_retries,
        base_delay: Duration::from_millis(settings.responder.base_delay_ms),
        max_delay: Duration::from_millis(settings.responder.max_delay_ms),
        ..RetryConfig::default()
    };
    let responder: Arc<dyn Responder> = Arc::new(RetryingResponder::new(echo, retry));

    let rate = &settings.rate_limit;
    let limits = LimitSettings {
        message_limit: rate.message_limit,
        message_window: Duration::from_secs(rate.message_window_secs),
        read_limit: rate.read_limit,
        read_window: Duration::from_secs(rate.read_window_secs),
    };

    let server = ForemanServer::new(
        config,
        ServerParts {
            db,
            counters: Arc::new(MemoryCounterStore::new()),
            limits,
            responder: StreamingResponder::new(responder, ChunkConfig::default()),
            verifier: Arc::new(verifier),
            chat: ChatConfig::from_settings(&settings),
        },
    )
    .with_metrics(foreman_server::metrics::install_recorder());

    let handle = server.listen().await.context("binding listener")?;
    info!(port = handle.port(), "foreman ready");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    handle.shutdown().await;
    Ok(())
}

async fn chat(settings: &ForemanSettings, args: ChatArgs) -> Result<()> {
    let mut client_settings = settings.client.clone();
    if let Some(url) = args.url {
        client_settings.server_url = url;
    }
    let mut config = ClientConfig::from_settings(&client_settings, args.token);
    if let Some(project) = args.project {
        config = config.with_project(project);
    }
    let history = HistoryClient::new(&config)?;
    let transport = TransportManager::new(config);

    transport.on(EventKind::StreamChunk, |update| {
        if let ClientUpdate::Server(ServerEvent::StreamChunk { content, .. }) = update {
            print!("{content}");
            let _ = std::io::stdout().flush();
        }
    });
    transport.on(EventKind::Assembled, |update| {
        if let ClientUpdate::Assembled(message) = update {
            if message.possibly_incomplete {
                println!("\n[answer incomplete: {}]", message.error.as_deref().unwrap_or("gap in stream"));
            } else {
                println!();
            }
        }
    });
    transport.on(EventKind::Message, |update| {
        if let ClientUpdate::Server(ServerEvent::Message { message }) = update {
            println!("{}> {}", message.role, message.content);
        }
    });
    transport.on(EventKind::Error, |update| {
        if let ClientUpdate::Server(ServerEvent::Error { code, detail }) = update {
            eprintln!("[{code}] {detail}");
        }
    });
    transport.on(EventKind::Notice, |update| {
        if let ClientUpdate::Notice(notice) = update {
            match notice {
                Notice::Disconnected { reason } => eprintln!("[disconnected: {reason}; reconnecting]"),
                Notice::Reconnected { .. } => eprintln!("[reconnected; /history shows anything missed]"),
                Notice::Failed { code, detail } => eprintln!("[{code}] {detail}"),
            }
        }
    });

    transport.connect(args.session.map(SessionId::from_raw))?;
    eprintln!("connected to {}; /history, /close, /quit", transport.config().server_url);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => {}
            "/quit" => break,
            "/history" => match transport.session_id() {
                Some(session) => match history.fetch_messages(&session, 200, 0).await {
                    Ok(page) => {
                        for message in page.messages {
                            println!("{}> {}", message.role, message.content);
                        }
                    }
                    Err(e) => eprintln!("history: {e}"),
                },
                None => eprintln!("no session yet"),
            },
            "/close" => match transport.session_id() {
                Some(session) => match history.close_session(&session).await {
                    Ok(closed) => eprintln!("session {} is {}", closed.id, closed.status),
                    Err(e) => eprintln!("close: {e}"),
                },
                None => eprintln!("no session yet"),
            },
            content => {
                let event = ClientEvent::Message {
                    content: content.to_string(),
                    attachments: Vec::new(),
                    client_message_id: None,
                    stream: !args.no_stream,
                };
                if let Err(e) = transport.send(event) {
                    eprintln!("not sent: {e}");
                }
            }
        }
    }

    transport.disconnect().await;
    Ok(())
}
