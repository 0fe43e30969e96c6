use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use marketplace_chat::api::client::ApiClient;
use marketplace_chat::api::models::Message;
use marketplace_chat::api::realtime::RealtimeClient;
use marketplace_chat::api::{LogNotifier, MessageBackend, Session};
use marketplace_chat::storage::{self, SnapshotCache};
use marketplace_chat::utils::normalize_url;
use marketplace_chat::{AppState, ChatError, ChatOptions, ChatWindow, Collaborators, Counterpart, ViewUpdate};

#[derive(Parser, Debug)]
#[command(name = "marketplace-chat", about = "Chat with buyers and sellers about an ad")]
struct Cli {
    #[arg(long, env = "MARKET_CHAT_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "MARKET_CHAT_BASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "MARKET_CHAT_ANON_KEY")]
    anon_key: Option<String>,

    #[arg(long, env = "MARKET_CHAT_ACCESS_TOKEN")]
    access_token: Option<String>,

    #[arg(long, env = "MARKET_CHAT_USER_ID")]
    user_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and remember the session in the config file.
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "MARKET_CHAT_PASSWORD")]
        password: String,
    },
    /// List conversations, most recent first.
    Inbox,
    /// Print the total number of unread messages.
    Unread,
    /// Open a conversation about an ad.
    Chat {
        ad_id: String,
        counterpart_id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        no_cache: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            eprintln!("{}", e.user_message());
            ExitCode::FAILURE
        }
    }
}

fn load_state(cli: &Cli) -> Result<(AppState, Option<PathBuf>), ChatError> {
    let path = cli.config.clone().or_else(AppState::config_path);
    let mut state = match &path {
        Some(p) if p.exists() => AppState::load_from(p)?,
        _ => AppState::new(),
    };
    if let Some(url) = &cli.base_url {
        state.base_url = normalize_url(url);
    }
    if let Some(key) = &cli.anon_key {
        state.anon_key = key.clone();
    }
    if cli.access_token.is_some() {
        state.access_token = cli.access_token.clone();
    }
    if cli.user_id.is_some() {
        state.user_id = cli.user_id.clone();
    }
    if !state.is_configured() {
        return Err(ChatError::Config(
            "base_url and anon_key must be set in the config file or environment".into(),
        ));
    }
    Ok((state, path))
}

fn require_user(state: &AppState) -> Result<String, ChatError> {
    state.session().user_id().ok_or_else(|| ChatError::SignInRequired {
        redirect: state.sign_in_url(),
    })
}

async fn run(cli: Cli) -> Result<(), ChatError> {
    let (mut state, path) = load_state(&cli)?;
    match cli.command {
        Command::Login { email, password } => {
            let client = ApiClient::from_state(&state)?;
            let auth = client.sign_in_with_password(&email, &password).await?;
            state.access_token = Some(auth.access_token.clone());
            state.user_id = Some(auth.user_id.clone());
            match &path {
                Some(p) => state.save_to(p)?,
                None => state.save()?,
            }
            let client = client.with_access_token(auth.access_token);
            let unread = client.unread_count(&auth.user_id).await?;
            println!("Signed in as {} ({unread} unread)", auth.user_id);
        }
        Command::Inbox => {
            let user = require_user(&state)?;
            let client = ApiClient::from_state(&state)?;
            let conversations = client.inbox(&user).await?;
            if conversations.is_empty() {
                println!("No conversations yet.");
            }
            for c in conversations {
                println!(
                    "{:<12} {:<24} {:>3} unread  {}",
                    c.scope.ad_id, c.scope.counterpart_id, c.unread, c.last_message.content
                );
            }
        }
        Command::Unread => {
            let user = require_user(&state)?;
            let client = ApiClient::from_state(&state)?;
            println!("{}", client.unread_count(&user).await?);
        }
        Command::Chat {
            ad_id,
            counterpart_id,
            name,
            no_cache,
        } => {
            let name = name.unwrap_or_else(|| counterpart_id.clone());
            chat(&state, &ad_id, Counterpart::new(counterpart_id, name), no_cache).await?;
        }
    }
    Ok(())
}

fn open_cache() -> Option<SnapshotCache> {
    let path = storage::default_path()?;
    match SnapshotCache::open(&path) {
        Ok(cache) => Some(cache),
        Err(e) => {
            log::warn!("snapshot cache unavailable at {}: {e}", path.display());
            None
        }
    }
}

async fn chat(state: &AppState, ad_id: &str, counterpart: Counterpart, no_cache: bool) -> Result<(), ChatError> {
    let collab = Collaborators {
        backend: Arc::new(ApiClient::from_state(state)?),
        feed: Arc::new(RealtimeClient::from_state(state)?),
        session: Arc::new(state.session()),
        notifier: Arc::new(LogNotifier),
    };
    let cache = if no_cache { None } else { open_cache() };
    let mut window = ChatWindow::open(collab, ChatOptions::from_state(state), ad_id, counterpart, cache).await?;
    window.set_unread_badge(Box::new(|n| log::info!("{n} unread in this conversation")));

    for m in window.messages() {
        print_message(m, &window.scope().self_id);
    }
    println!("-- /reply <id>, /edit <id> <text>, /delete <id>, /confirm, /cancel, /read <id>, /quit");

    enum Input {
        Line(Option<String>),
        Update(ViewUpdate),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let input = tokio::select! {
            line = lines.next_line() => Input::Line(line.ok().flatten()),
            update = window.next_update() => Input::Update(update),
        };
        match input {
            Input::Line(None) => break,
            Input::Line(Some(line)) => match handle_line(&mut window, line.trim()).await {
                Ok(true) => {}
                Ok(false) => break,
                // already surfaced through the notifier
                Err(e) => log::debug!("command failed: {e}"),
            },
            Input::Update(update) => print_update(&window, &update),
        }
    }
    window.close().await;
    Ok(())
}

/// Runs one input line. `Ok(false)` ends the session.
async fn handle_line(window: &mut ChatWindow, line: &str) -> Result<bool, ChatError> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "" => {}
        "/quit" => return Ok(false),
        "/reply" => {
            window.reply_to(rest.trim())?;
            println!("-- replying to {}", rest.trim());
        }
        "/cancel" => {
            window.cancel_reply();
            window.cancel_edit();
            window.cancel_delete();
        }
        "/edit" => {
            let (id, text) = rest.split_once(' ').unwrap_or((rest, ""));
            window.edit(id, text).await?;
        }
        "/delete" => {
            window.request_delete(rest.trim())?;
            println!("-- type /confirm to delete {}", rest.trim());
        }
        "/confirm" => {
            window.confirm_delete().await?;
        }
        "/read" => {
            let marked = window.on_message_clicked(rest.trim()).await?;
            println!("-- marked {marked} read");
        }
        _ => {
            window.set_composer(line);
            window.send().await?;
        }
    }
    Ok(true)
}

fn print_message(m: &Message, self_id: &str) {
    let who = if m.sender_id == self_id { "you" } else { m.sender_id.as_str() };
    let time = m.created_at.with_timezone(&Local).format("%H:%M");
    let edited = if m.is_edited() { " (edited)" } else { "" };
    let read = if m.sender_id == self_id && m.is_read { " [read]" } else { "" };
    let reply = m
        .reply_to_message_id
        .as_deref()
        .map(|id| format!(" (re {id})"))
        .unwrap_or_default();
    println!("[{time}] {who}{reply}: {}{edited}{read}  #{}", m.content, m.id);
}

fn print_update(window: &ChatWindow, update: &ViewUpdate) {
    let self_id = window.scope().self_id.as_str();
    match update {
        ViewUpdate::Inserted { id, .. } | ViewUpdate::Updated { id } => {
            if let Some(m) = window.store().get(id) {
                print_message(m, self_id);
            }
        }
        ViewUpdate::Removed { id } => println!("-- #{id} was deleted"),
        ViewUpdate::TypingChanged => {
            if let Some(label) = window.typing_label(Utc::now()) {
                println!("-- {label}");
            }
        }
        ViewUpdate::Resynced => {
            println!("-- reconnected");
            for m in window.messages() {
                print_message(m, self_id);
            }
        }
        ViewUpdate::Offline => println!("-- offline, retrying"),
    }
}
