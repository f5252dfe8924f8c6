//! tunnel-cli
//!
//! Opens device tunnels from the command line.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use base64::Engine;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use tunnel::protocol::{ApiRequest, Method, RequestData, ResponseBody};
use tunnel::{
    Config, HttpController, SessionEvent, TunnelSession, WebRtcProvider, WebSocketSignalingClient,
};

/// tunnel-cli - peer-to-peer tunnels to controller-managed devices.
#[derive(Parser, Debug)]
#[command(name = "tunnel-cli")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Open an interactive session, piping stdin to the device and device output to stdout
    Shell {
        /// Device MAC address
        device: String,

        /// Reuse a session id instead of generating one
        #[arg(long)]
        session_id: Option<String>,
    },

    /// Send one framed API request over a tunnel channel
    Api {
        /// Device MAC address
        device: String,

        /// Request path, optionally with a query string
        path: String,

        #[arg(long, short, value_enum, default_value = "get")]
        method: HttpMethod,

        /// Request data: JSON if it parses as JSON, otherwise text
        #[arg(long, short)]
        data: Option<String>,

        /// Explicit content type
        #[arg(long)]
        content_type: Option<String>,

        /// Data channel name
        #[arg(long, default_value = "api")]
        channel: String,
    },

    /// Send one action request over the signaling relay
    Action {
        /// Action name
        action: String,

        /// Action arguments as JSON
        #[arg(long, short, default_value = "{}")]
        args: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => Method::Get,
            HttpMethod::Post => Method::Post,
            HttpMethod::Put => Method::Put,
            HttpMethod::Delete => Method::Delete,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    config.validate()?;

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let _guard = init_logging(level, config.logging.directory.as_deref())?;

    if let Some(path) = &cli.config {
        tracing::debug!("Using config file: {:?}", path);
    }

    match cli.command {
        Commands::Shell { device, session_id } => {
            let session = build_session(&config, device, session_id)?;
            run_shell(session).await?;
        }
        Commands::Api {
            device,
            path,
            method,
            data,
            content_type,
            channel,
        } => {
            let mut request = ApiRequest::new(method.into());
            if let Some(data) = data {
                request = request.with_data(parse_data(&data));
            }
            if let Some(content_type) = content_type {
                request = request.with_content_type(content_type);
            }

            let session = build_session(&config, device, None)?;
            let outcome = run_api(&session, &path, &request, &channel, &config).await;
            if let Err(e) = session.close().await {
                tracing::warn!("Teardown failed: {}", e);
            }
            outcome?;
        }
        Commands::Action { action, args } => {
            let args: serde_json::Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;

            let client = WebSocketSignalingClient::new(config.signaling_config());
            let response = client.action_request(&action, args).await;
            client.disconnect().await;

            println!("{}", response?.to_json()?);
        }
    }

    Ok(())
}

/// Sets up the global subscriber.
///
/// `RUST_LOG` wins over `level`. With a log directory, output goes to a daily
/// rolling file instead of stderr.
fn init_logging(level: &str, directory: Option<&Path>) -> anyhow::Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (writer, guard) = match directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "tunnel-cli.log"))
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(directory.is_none())
        .with_writer(writer)
        .init();

    Ok(guard)
}

fn build_session(
    config: &Config,
    device: String,
    session_id: Option<String>,
) -> anyhow::Result<TunnelSession> {
    let controller = HttpController::new(
        config.controller.base_url.clone(),
        config.controller.site.clone(),
        config.controller.cookie.clone(),
        config.controller.accept_invalid_certs,
    )?;

    let controller = Arc::new(controller);
    let provider = Arc::new(WebRtcProvider::new());
    let options = config.session_options();

    Ok(match session_id {
        Some(id) => TunnelSession::with_session_id(device, id, controller, provider, options),
        None => TunnelSession::new(device, controller, provider, options),
    })
}

/// JSON when it parses as JSON, otherwise text.
fn parse_data(data: &str) -> RequestData {
    serde_json::from_str(data)
        .map(RequestData::Json)
        .unwrap_or_else(|_| RequestData::Text(data.to_string()))
}

async fn run_api(
    session: &TunnelSession,
    path: &str,
    request: &ApiRequest,
    channel: &str,
    config: &Config,
) -> anyhow::Result<()> {
    session.connect().await?;
    let api = session.open_api(channel).await?;

    let timeout = Duration::from_millis(config.session.request_timeout_ms);
    let frame = api.request(path, request, timeout).await?;

    match frame.body()? {
        ResponseBody::Json(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        ResponseBody::Binary(bytes) => {
            println!("{}", base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        ResponseBody::Blob { content_type, data } => {
            tracing::info!(content_type = ?content_type, len = data.len(), "opaque response");
            println!("{}", base64::engine::general_purpose::STANDARD.encode(data));
        }
    }

    let _ = api.close().await;
    Ok(())
}

/// Pipes stdin lines into the session and session output to stdout until
/// stdin closes, the session closes or Ctrl-C.
async fn run_shell(session: TunnelSession) -> anyhow::Result<()> {
    let mut events = session.subscribe();
    session.connect().await?;
    tracing::info!(session_id = session.session_id(), "Session open");

    let shutdown = CancellationToken::new();

    let output = {
        let shutdown = shutdown.clone();
        let session = session.clone();
        tokio::spawn(async move {
            let mut stdout = tokio::io::stdout();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(SessionEvent::Data(_)) => {
                            let data = session.recv();
                            if stdout.write_all(&data).await.is_err() {
                                break;
                            }
                            let _ = stdout.flush().await;
                        }
                        Ok(SessionEvent::Closed) | Err(broadcast::error::RecvError::Closed) => {
                            shutdown.cancel();
                            break;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "output events lagged");
                        }
                    },
                }
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            line = lines.next_line() => match line? {
                Some(mut line) => {
                    line.push('\n');
                    session.send(line).await?;
                }
                None => break,
            },
        }
    }

    shutdown.cancel();
    let _ = output.await;
    session.close().await?;
    Ok(())
}
