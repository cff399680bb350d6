use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

use inbox_engine::{AskService, EventBroadcaster, PollConfig, PollLoop};
use inbox_gmail::{GmailConfig, GmailSource, GoogleAuth, GoogleAuthConfig};
use inbox_llm::{GeminiClassifier, GeminiConfig, OwnerContext};
use inbox_server::{AppState, ServerConfig};
use inbox_settings::InboxSettings;
use inbox_store::{Database, EmailRepo};
use inbox_telemetry::{init_telemetry, parse_level, TelemetryConfig};

/// Polls a Gmail inbox, triages new mail with Gemini, and serves the results.
#[derive(Debug, Parser)]
#[command(name = "inbox-buddy", version)]
struct Cli {
    /// Settings file (default: $INBOX_BUDDY_HOME/settings.json).
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// SQLite database path.
    #[arg(long)]
    db: Option<PathBuf>,
}

fn load(cli: &Cli) -> anyhow::Result<InboxSettings> {
    let mut settings = match &cli.settings {
        Some(path) => inbox_settings::load_settings_from_path(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => inbox_settings::load_settings().context("loading settings")?,
    };
    if let Some(host) = &cli.host {
        settings.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(db) = &cli.db {
        settings.storage.db_path = db.display().to_string();
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = load(&cli)?;
    let home = inbox_settings::home_dir();
    std::fs::create_dir_all(&home)
        .with_context(|| format!("creating {}", home.display()))?;
    let db_path = inbox_settings::resolve_path(&home, &settings.storage.db_path);

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: parse_level(&settings.logging.level),
        json: settings.logging.json,
        log_to_sqlite: settings.logging.db_sink,
        log_db_path: db_path.clone(),
        ..TelemetryConfig::default()
    });
    tracing::info!(home = %home.display(), "starting inbox-buddy");

    let db = Database::open(&db_path).context("opening database")?;
    tracing::info!(path = %db_path.display(), "database opened");
    let repo = EmailRepo::new(db, settings.triage.reply_needed_threshold);

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("building HTTP client")?;

    let gmail = &settings.gmail;
    let auth = Arc::new(GoogleAuth::new(
        GoogleAuthConfig::from_paths(
            &inbox_settings::resolve_path(&home, &gmail.credentials_path),
            inbox_settings::resolve_path(&home, &gmail.token_path),
            gmail.redirect_url.clone(),
        ),
        http.clone(),
    ));
    let source = Arc::new(GmailSource::new(
        GmailConfig {
            query: gmail.query.clone(),
            max_messages: gmail.max_messages,
            ..GmailConfig::default()
        },
        http,
        auth.clone(),
    ));

    let triage = &settings.triage;
    let classify_timeout = Duration::from_secs(triage.classify_timeout_secs);
    let classifier = Arc::new(
        GeminiClassifier::new(GeminiConfig {
            model: settings.gemini.model.clone(),
            api_key: settings.gemini.api_key.clone().map(SecretString::from),
            base_url: settings.gemini.base_url.clone(),
            timeout: classify_timeout,
            context_chars: triage.context_chars,
            reply_threshold: triage.reply_needed_threshold,
            owner: OwnerContext::new(triage.owner_name.as_deref(), &triage.owner_aliases),
        })
        .context("building Gemini classifier")?,
    );
    if settings.gemini.api_key.is_none() {
        tracing::warn!("GOOGLE_GENAI_API_KEY is not set; classification will fail until it is");
    }

    let broadcaster = EventBroadcaster::new(settings.server.subscriber_buffer);
    let (poll_loop, poll_handle) = PollLoop::new(
        repo.clone(),
        source,
        classifier.clone(),
        broadcaster.clone(),
        PollConfig {
            interval: Duration::from_secs(settings.poll.interval_secs),
            initial_delay: Duration::from_secs(settings.poll.initial_delay_secs),
            classify_timeout,
            auth_suppression: Duration::from_secs(settings.poll.auth_suppression_secs),
        },
    );

    let cancel = CancellationToken::new();
    let poll_task = tokio::spawn(poll_loop.run(cancel.child_token()));

    let state = AppState {
        ask: AskService::new(repo.clone(), classifier).with_default_limit(triage.ask_limit),
        repo,
        broadcaster,
        poll: poll_handle,
        authorizer: auth,
        keep_alive: Duration::from_secs(15),
        logs: telemetry.logs(),
    };
    let server = inbox_server::start(
        ServerConfig {
            host: settings.server.host.clone(),
            port: settings.server.port,
            cors_origins: settings.server.cors_origins.clone(),
        },
        state,
        cancel.child_token(),
    )
    .await
    .context("starting server")?;
    tracing::info!(port = server.port, "inbox-buddy ready");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    cancel.cancel();
    let _ = poll_task.await;
    server.stopped().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_settings() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from([
            "inbox-buddy",
            "--settings",
            dir.path().join("missing.json").to_str().unwrap(),
            "--port",
            "9123",
            "--db",
            "/tmp/other.db",
        ]);
        let settings = load(&cli).unwrap();
        assert_eq!(settings.server.port, 9123);
        assert_eq!(settings.storage.db_path, "/tmp/other.db");
        assert_eq!(settings.server.host, InboxSettings::default().server.host);
    }
}
