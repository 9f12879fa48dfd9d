use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chatsync::rest::MemoryChatBackend;
use chatsync::{
    AssistantId, ChatBackend, ConversationHistory, HttpChatBackend, HydratedHistory,
    SessionController, SessionError, SessionUpdate, SettingsStore, SubmitOutcome,
};
use chatsync_storage::{KeyValueStore, MemoryStore, SqliteStore, StorageError};
use chatsync_transport::{
    Connector, ConversationId, MemoryAcceptor, MemoryConnector, MemorySession,
    TungsteniteConnector,
};
use clap::Parser;
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const HELP: &str =
    "commands: /new, /open <id>, /delete <id>, /reconnect, /history, /help, /quit; any other line is sent";

#[derive(Debug, Snafu)]
enum DriverError {
    #[snafu(display("no assistant configured on `{stage}`; pass --assistant or set CHATSYNC_ASSISTANT_ID"))]
    MissingAssistant { stage: &'static str },
    #[snafu(display("failed to open local cache at {path:?} on `{stage}`: {source}"))]
    OpenCache {
        stage: &'static str,
        path: PathBuf,
        source: StorageError,
    },
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

/// Terminal client for streamed chat conversations.
#[derive(Parser, Debug)]
#[command(name = "chatsync", version)]
struct Cli {
    #[arg(
        long,
        action = clap::ArgAction::SetTrue,
        help = "Run against an in-process echo server instead of the configured backend"
    )]
    offline: bool,

    #[arg(long, value_name = "PATH", help = "Settings file to load instead of the default")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "ID", help = "Assistant to chat with")]
    assistant: Option<String>,

    #[arg(long, value_name = "ID", help = "Existing conversation to open")]
    conversation: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{error}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), DriverError> {
    let args = Cli::parse();
    let settings_store = match &args.config {
        Some(path) => SettingsStore::new(path.clone()),
        None => SettingsStore::load(),
    };
    let settings = settings_store.settings();

    let backend: Arc<dyn ChatBackend>;
    let store: Arc<dyn KeyValueStore>;
    let connector: Arc<dyn Connector>;
    let default_assistant: Option<AssistantId>;
    if args.offline {
        let (memory_connector, acceptor) = MemoryConnector::new();
        tokio::spawn(run_echo_server(acceptor));
        backend = Arc::new(MemoryChatBackend::new());
        store = Arc::new(MemoryStore::new());
        connector = Arc::new(memory_connector.with_auto_handshake(true));
        default_assistant = Some(AssistantId::from("echo"));
    } else {
        let cache_path = settings_store.cache_path();
        let sqlite = SqliteStore::open(&cache_path.to_string_lossy())
            .await
            .context(OpenCacheSnafu {
                stage: "open-cache",
                path: cache_path.clone(),
            })?;
        backend = Arc::new(HttpChatBackend::new(&settings.api_base_url, settings.token_pair()));
        store = Arc::new(sqlite);
        connector = Arc::new(TungsteniteConnector::new());
        default_assistant = settings.assistant();
    }

    let assistant = args
        .assistant
        .as_deref()
        .map(AssistantId::from)
        .or(default_assistant)
        .context(MissingAssistantSnafu {
            stage: "select-assistant",
        })?;

    let mut controller =
        SessionController::new(backend, store, connector, settings.transport_config());
    let conversation = args.conversation.map(ConversationId::from);
    match controller.open_conversation(assistant, conversation).await {
        Ok(hydrated) => report_hydration(&hydrated),
        Err(error) => report_error(&error),
    }
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context(ReadInputSnafu { stage: "read-stdin" })? else {
                    break;
                };
                if !handle_line(&mut controller, line.trim_end()).await {
                    break;
                }
            }
            update = controller.next_update() => {
                if let Some(update) = update {
                    render_update(&update);
                }
            }
        }
    }

    controller.close();
    Ok(())
}

/// Returns false when the driver should exit.
async fn handle_line(controller: &mut SessionController, line: &str) -> bool {
    let (command, argument) = line
        .split_once(' ')
        .map_or((line, ""), |(command, rest)| (command, rest.trim()));

    match command {
        "/quit" | "/exit" => return false,
        "/help" => println!("{HELP}"),
        "/new" => {
            controller.new_conversation();
            println!("[new conversation; the first message creates it]");
        }
        "/history" => print_history(controller.history()),
        "/reconnect" => match controller.reconnect().await {
            Ok(()) => println!("[reconnected]"),
            Err(error) => report_error(&error),
        },
        "/open" if !argument.is_empty() => {
            match controller
                .switch_conversation(ConversationId::from(argument))
                .await
            {
                Ok(hydrated) => report_hydration(&hydrated),
                Err(error) => report_error(&error),
            }
        }
        "/delete" if !argument.is_empty() => {
            match controller
                .delete_conversation(&ConversationId::from(argument))
                .await
            {
                Ok(()) => println!("[deleted conversation {argument}]"),
                Err(error) => report_error(&error),
            }
        }
        command if command.starts_with('/') => println!("unknown command {command}; {HELP}"),
        _ => match controller.submit(line).await {
            Ok(SubmitOutcome::Sent {
                conversation_id,
                created_conversation: true,
                ..
            }) => println!("[created conversation {conversation_id}]"),
            Ok(_) => {}
            Err(error) => report_error(&error),
        },
    }
    true
}

fn report_hydration(hydrated: &HydratedHistory) {
    if let Some(warning) = &hydrated.warning {
        eprintln!("[warning: {warning}]");
    }
    print_history(&hydrated.history);
}

fn report_error(error: &SessionError) {
    tracing::warn!(error = %error, "session operation failed");
    eprintln!("error: {error}");
    if error.is_retryable() {
        eprintln!("[type /reconnect to retry the connection]");
    }
    if error.is_auth() {
        eprintln!("[credentials were rejected; update the access token in the settings file]");
    }
}

fn print_history(history: &ConversationHistory) {
    for message in history.messages() {
        println!(
            "{} {:?} [{:?}]: {}",
            message.timestamp.format("%H:%M:%S"),
            message.role,
            message.status,
            message.content
        );
    }
}

fn render_update(update: &SessionUpdate) {
    match update {
        SessionUpdate::Connected { conversation_id } => {
            eprintln!("[connected to conversation {conversation_id}]");
        }
        SessionUpdate::AssistantDelta { chunk, .. } => {
            print!("{chunk}");
            let _ = std::io::stdout().flush();
        }
        SessionUpdate::TurnComplete { .. } => println!(),
        SessionUpdate::ConnectionLost {
            reason,
            interrupted,
            ..
        } => {
            if interrupted.is_some() {
                println!();
            }
            eprintln!("[connection lost: {}; type /reconnect to retry]", reason.describe());
        }
    }
}

/// Offline stand-in for the chat server: streams each message back word by word.
async fn run_echo_server(mut acceptor: MemoryAcceptor) {
    while let Some(session) = acceptor.accept().await {
        tokio::spawn(echo_session(session));
    }
}

async fn echo_session(mut session: MemorySession) {
    while let Some(frame) = session.next_sent().await {
        let text = serde_json::from_str::<serde_json::Value>(&frame)
            .ok()
            .and_then(|value| value.get("text").and_then(|text| text.as_str()).map(str::to_string))
            .unwrap_or(frame);

        for word in format!("echo: {text}").split_inclusive(' ') {
            if !session.send_text(word) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        session.complete();
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_parse_into_the_driver_options() {
        let cli = Cli::try_parse_from([
            "chatsync",
            "--offline",
            "--config",
            "/tmp/chatsync.json",
            "--assistant",
            "3",
            "--conversation",
            "42",
        ])
        .expect("parse");

        assert!(cli.offline);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/chatsync.json")));
        assert_eq!(cli.assistant.as_deref(), Some("3"));
        assert_eq!(cli.conversation.as_deref(), Some("42"));

        let defaults = Cli::try_parse_from(["chatsync"]).expect("parse defaults");
        assert!(!defaults.offline);
        assert_eq!(defaults.config, None);
    }

    #[test]
    fn missing_values_and_unknown_flags_are_rejected() {
        assert!(Cli::try_parse_from(["chatsync", "--assistant"]).is_err());
        assert!(Cli::try_parse_from(["chatsync", "--verbose"]).is_err());
    }
}
