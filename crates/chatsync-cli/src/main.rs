//! Chatsync CLI
//!
//! Thin wrapper around chatsync-core for command-line usage. State (the
//! data tree, accounts, the current session and uploaded files) lives in a
//! local database, so one invocation picks up where the previous one ended.
//!
//! ## Usage
//!
//! ```bash
//! # Create an account (signs it in)
//! chatsync account register --name Alice --email alice@example.com --password secret1
//!
//! # Add a contact by email
//! chatsync contact add bob@example.com --alias Bobby
//!
//! # Send a direct message
//! chatsync chat send user:<bob_id> "Hello Bob"
//!
//! # Create a group and post to it
//! chatsync group create "Hikers" --member <bob_id>
//! chatsync chat send group:<group_id> "Sunday?"
//!
//! # Conversations, newest first
//! chatsync chat list
//!
//! # Show one conversation
//! chatsync chat open user:<bob_id>
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chatsync_core::{
    ChatConfig, ChatEngine, ConversationKey, DraftAttachment, GroupId, Message, MessageDraft,
    ProfileUpdate, SignUp, UserId,
};
use clap::{Parser, Subcommand};
use tracing::debug;

/// Chatsync - realtime chat over a shared data store
#[derive(Parser)]
#[command(name = "chatsync")]
#[command(version = "0.1.0")]
#[command(about = "Chatsync - realtime chat over a shared data store")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: ~/.chatsync)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON config file; unset fields keep their defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Account management
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },

    /// Profile of the signed-in user
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Contacts
    Contact {
        #[command(subcommand)]
        action: ContactAction,
    },

    /// Groups
    Group {
        #[command(subcommand)]
        action: GroupAction,
    },

    /// Conversations and messages
    Chat {
        #[command(subcommand)]
        action: ChatAction,
    },
}

#[derive(Subcommand)]
enum AccountAction {
    /// Create an account and sign it in
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        /// Password confirmation (defaults to --password)
        #[arg(long)]
        confirm_password: Option<String>,
        #[arg(long, default_value = "")]
        phone: String,
        /// Avatar image file
        #[arg(long)]
        avatar: Option<PathBuf>,
    },
    /// Sign in and mark yourself online
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Mark yourself offline and end the session
    Logout,
    /// Show the signed-in user
    Whoami,
    /// Request a password reset email
    ResetPassword {
        #[arg(long)]
        email: String,
    },
}

#[derive(Subcommand)]
enum ProfileAction {
    /// Show a profile (default: your own)
    Show {
        /// User ID
        user_id: Option<String>,
    },
    /// Update your profile
    Update {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        /// New avatar image file
        #[arg(long)]
        avatar: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ContactAction {
    /// Add the user registered under EMAIL
    Add {
        email: String,
        /// Name you want to see for this contact
        #[arg(long, default_value = "")]
        alias: String,
    },
    /// List your contacts
    List {
        /// Only contacts whose name or email contains this text
        #[arg(long)]
        search: Option<String>,
    },
}

#[derive(Subcommand)]
enum GroupAction {
    /// Create a group with you and the given members
    Create {
        name: String,
        /// Member user ID (repeatable)
        #[arg(long = "member", required = true)]
        members: Vec<String>,
    },
    /// List your groups
    List {
        /// Only groups whose name contains this text
        #[arg(long)]
        search: Option<String>,
    },
    /// Show the members of a group
    Members {
        /// Group ID
        group_id: String,
    },
}

#[derive(Subcommand)]
enum ChatAction {
    /// Conversations with messages, newest first
    List,
    /// Show the messages of a conversation
    Open {
        /// Conversation: a key, user:<id> or group:<id>
        conversation: String,
        /// Only show the last N messages
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Send a message
    Send {
        /// Conversation: a key, user:<id> or group:<id>
        conversation: String,
        /// Message text
        #[arg(default_value = "")]
        text: String,
        /// File to attach
        #[arg(long)]
        file: Option<PathBuf>,
        /// Share a location as "lat,lon" instead of text
        #[arg(long, allow_hyphen_values = true)]
        location: Option<String>,
    },
    /// Set or clear your typing flag
    Typing {
        /// Conversation: a key, user:<id> or group:<id>
        conversation: String,
        /// on or off
        state: String,
    },
    /// Delete every message of a conversation
    Delete {
        /// Conversation: a key, user:<id> or group:<id>
        conversation: String,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.chatsync)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chatsync")
}

fn parse_user_id(s: &str) -> Result<UserId> {
    UserId::new(s).map_err(|e| anyhow!("Invalid user ID '{}': {}", s, e))
}

fn parse_group_id(s: &str) -> Result<GroupId> {
    GroupId::new(s).map_err(|e| anyhow!("Invalid group ID '{}': {}", s, e))
}

/// Accepts `user:<id>`, `group:<id>` or a raw conversation key
fn parse_conversation(engine: &ChatEngine, s: &str) -> Result<ConversationKey> {
    if let Some(user) = s.strip_prefix("user:") {
        return Ok(engine.direct_key(&parse_user_id(user)?)?);
    }
    if let Some(group) = s.strip_prefix("group:") {
        return Ok(ConversationKey::group(&parse_group_id(group)?));
    }
    ConversationKey::parse(s).map_err(|e| anyhow!("Invalid conversation '{}': {}", s, e))
}

/// Parse "lat,lon"
fn parse_location(s: &str) -> Result<(f64, f64)> {
    let (lat, lon) = s
        .split_once(',')
        .ok_or_else(|| anyhow!("Location must be \"lat,lon\", got '{}'", s))?;
    let lat: f64 = lat.trim().parse().context("Invalid latitude")?;
    let lon: f64 = lon.trim().parse().context("Invalid longitude")?;
    Ok((lat, lon))
}

fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("mp4") => "video/mp4",
        Some("mp3") => "audio/mpeg",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

fn read_attachment(path: &Path) -> Result<DraftAttachment> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    Ok(DraftAttachment {
        bytes,
        content_type: content_type_for(path).to_string(),
        name,
    })
}

fn format_time(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms)
        .map(|dt| {
            dt.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        })
        .unwrap_or_else(|| "?".to_string())
}

/// Resume the stored session or fail with a hint
fn require_session(engine: &ChatEngine) -> Result<UserId> {
    engine
        .resume()?
        .ok_or_else(|| anyhow!("Not signed in. Run `chatsync account login` first."))
}

/// Names to show for message senders: contacts, then group members
fn sender_names(engine: &ChatEngine, me: &UserId) -> Result<HashMap<UserId, String>> {
    let mut names = HashMap::new();
    for roster in engine.groups()? {
        for member in roster.members {
            names.insert(member.id.clone(), member.label().to_string());
        }
    }
    for contact in engine.contacts()? {
        names.insert(contact.id.clone(), contact.label().to_string());
    }
    names.insert(me.clone(), "You".to_string());
    Ok(names)
}

fn print_message(message: &Message, names: &HashMap<UserId, String>) {
    let sender = names
        .get(&message.sender)
        .cloned()
        .unwrap_or_else(|| message.sender.to_string());
    let mut line = format!("[{}] {}: {}", format_time(message.timestamp), sender, message.text);
    if let Some(file) = &message.attachment {
        line.push_str(&format!(" [{}: {} {}]", file.content_type, file.name, file.uri));
    }
    println!("{}", line.trim_end());
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => ChatConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ChatConfig::default(),
    };
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    debug!(?data_dir, "Using data directory");
    let engine = ChatEngine::open(&data_dir, config)?;

    match cli.command {
        Commands::Account { action } => match action {
            AccountAction::Register {
                name,
                email,
                password,
                confirm_password,
                phone,
                avatar,
            } => {
                let avatar = avatar.as_deref().map(read_attachment).transpose()?;
                let confirm_password = confirm_password.unwrap_or_else(|| password.clone());
                let id = engine
                    .sign_up(SignUp {
                        name: name.clone(),
                        email,
                        phone,
                        password,
                        confirm_password,
                        avatar,
                    })
                    .await?;
                println!("Registered: {}", name.trim());
                println!("  ID: {}", id);
            }

            AccountAction::Login { email, password } => {
                let id = engine.sign_in(&email, &password).await?;
                println!("Signed in as {}", email.trim());
                println!("  ID: {}", id);
            }

            AccountAction::Logout => {
                if engine.resume()?.is_none() {
                    println!("Not signed in.");
                } else {
                    engine.sign_out().await?;
                    println!("Signed out.");
                }
            }

            AccountAction::Whoami => match engine.resume()? {
                Some(id) => {
                    println!("Signed in:");
                    println!("  ID: {}", id);
                    if let Some(profile) = engine.profile()? {
                        println!("  Name: {}", profile.name);
                        println!("  Email: {}", profile.email);
                    }
                }
                None => println!("Not signed in."),
            },

            AccountAction::ResetPassword { email } => {
                engine.send_password_reset(&email).await?;
                println!("Password reset requested for {}", email.trim());
            }
        },

        Commands::Profile { action } => match action {
            ProfileAction::Show { user_id } => {
                let me = require_session(&engine)?;
                let user = match user_id {
                    Some(id) => parse_user_id(&id)?,
                    None => me,
                };
                let watch = engine.watch_user(&user)?;
                match watch.snapshot() {
                    Some(profile) => {
                        println!("Profile: {}", profile.name);
                        println!("  ID: {}", user);
                        println!("  Email: {}", profile.email);
                        if !profile.phone.is_empty() {
                            println!("  Phone: {}", profile.phone);
                        }
                        if let Some(picture) = &profile.picture {
                            println!("  Picture: {}", picture);
                        }
                        println!("  Online: {}", if profile.online { "Yes" } else { "No" });
                    }
                    None => bail!("No profile for user {}", user),
                }
            }

            ProfileAction::Update {
                name,
                email,
                phone,
                avatar,
            } => {
                require_session(&engine)?;
                if let Some(path) = avatar {
                    let file = read_attachment(&path)?;
                    let uri = engine.upload_avatar(file.bytes, &file.content_type).await?;
                    println!("Avatar uploaded: {}", uri);
                }
                let update = ProfileUpdate {
                    name,
                    email,
                    phone,
                    picture: None,
                };
                if !update.is_empty() {
                    engine.update_profile(update).await?;
                    println!("Profile updated.");
                }
            }
        },

        Commands::Contact { action } => match action {
            ContactAction::Add { email, alias } => {
                require_session(&engine)?;
                let entry = engine.add_contact(&email, &alias).await?;
                println!("Added contact: {}", email.trim());
                println!("  ID: {}", entry.contact);
            }

            ContactAction::List { search } => {
                require_session(&engine)?;
                let contacts = engine.search_contacts(search.as_deref().unwrap_or(""))?;
                if contacts.is_empty() {
                    println!("No contacts found.");
                } else {
                    println!("Contacts ({}):", contacts.len());
                    println!();
                    for contact in contacts {
                        let online = if contact.online { " [online]" } else { "" };
                        let email = contact.email.as_deref().unwrap_or("-");
                        println!("  {} {} <{}>{}", contact.id, contact.label(), email, online);
                    }
                }
            }
        },

        Commands::Group { action } => match action {
            GroupAction::Create { name, members } => {
                require_session(&engine)?;
                let members = members
                    .iter()
                    .map(|m| parse_user_id(m))
                    .collect::<Result<Vec<_>>>()?;
                let group = engine.create_group(&name, &members).await?;
                println!("Created group: {}", group.name);
                println!("  ID: {}", group.id);
                println!("  Members: {}", group.members.len());
            }

            GroupAction::List { search } => {
                let me = require_session(&engine)?;
                let groups = engine.search_groups(search.as_deref().unwrap_or(""))?;
                if groups.is_empty() {
                    println!("No groups found.");
                } else {
                    println!("Groups ({}):", groups.len());
                    println!();
                    for roster in groups {
                        let online = if roster.others_online(&me) { " [online]" } else { "" };
                        println!(
                            "  {} {} ({} members){}",
                            roster.group.id,
                            roster.group.name,
                            roster.group.members.len(),
                            online
                        );
                    }
                }
            }

            GroupAction::Members { group_id } => {
                require_session(&engine)?;
                let id = parse_group_id(&group_id)?;
                let roster = engine
                    .groups()?
                    .into_iter()
                    .find(|r| r.id() == &id)
                    .ok_or_else(|| anyhow!("Group not found: {}", group_id))?;
                println!("Group: {}", roster.group.name);
                println!("  Members: {}", roster.member_names());
                for member in &roster.members {
                    let online = if member.online { " [online]" } else { "" };
                    println!("  {} {}{}", member.id, member.label(), online);
                }
            }
        },

        Commands::Chat { action } => match action {
            ChatAction::List => {
                require_session(&engine)?;
                let conversations = engine.conversations()?;
                if conversations.is_empty() {
                    println!("No conversations.");
                } else {
                    println!("Conversations ({}):", conversations.len());
                    println!();
                    for summary in conversations {
                        let kind = if summary.is_group { "group" } else { "direct" };
                        println!(
                            "  {} [{}] {} {}: {}",
                            summary.key,
                            kind,
                            format_time(summary.timestamp),
                            summary.display_name,
                            summary.preview(40)
                        );
                    }
                }
            }

            ChatAction::Open {
                conversation,
                limit,
            } => {
                let me = require_session(&engine)?;
                let key = parse_conversation(&engine, &conversation)?;
                let view = engine.open_conversation(&key).await?;
                let names = sender_names(&engine, &me)?;

                println!("Conversation: {}", engine.conversation_name(&key)?);
                println!("  Key: {}", key);
                println!();
                let messages = view.messages();
                let skip = limit.map(|n| messages.len().saturating_sub(n)).unwrap_or(0);
                if messages.is_empty() {
                    println!("No messages yet.");
                }
                for message in messages.iter().skip(skip) {
                    print_message(message, &names);
                }

                let typing: Vec<String> = view
                    .typing()
                    .typing_users()
                    .into_iter()
                    .filter(|id| id != &me)
                    .map(|id| names.get(&id).cloned().unwrap_or_else(|| id.to_string()))
                    .collect();
                if !typing.is_empty() {
                    println!();
                    println!("{} typing...", typing.join(", "));
                }
                view.close();
            }

            ChatAction::Send {
                conversation,
                text,
                file,
                location,
            } => {
                require_session(&engine)?;
                let key = parse_conversation(&engine, &conversation)?;
                let mut draft = match location {
                    Some(location) => {
                        let (lat, lon) = parse_location(&location)?;
                        MessageDraft::location(lat, lon)?
                    }
                    None => MessageDraft::text(&text),
                };
                if let Some(path) = file {
                    let file = read_attachment(&path)?;
                    draft = draft.with_attachment(file.bytes, file.content_type, file.name);
                }
                let message = engine.send_message(&key, draft).await?;
                println!("Sent message to {}", key);
                println!("  ID: {}", message.id);
            }

            ChatAction::Typing {
                conversation,
                state,
            } => {
                require_session(&engine)?;
                let key = parse_conversation(&engine, &conversation)?;
                let is_typing = match state.as_str() {
                    "on" | "true" => true,
                    "off" | "false" => false,
                    other => bail!("Typing state must be on or off, got '{}'", other),
                };
                engine.set_typing(&key, is_typing).await?;
                println!("Typing {} in {}", if is_typing { "on" } else { "off" }, key);
            }

            ChatAction::Delete { conversation } => {
                require_session(&engine)?;
                let key = parse_conversation(&engine, &conversation)?;
                engine.delete_conversation(&key).await?;
                println!("Deleted conversation {}", key);
            }
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_location() {
        assert_eq!(parse_location("48.85, 2.35").unwrap(), (48.85, 2.35));
        assert!(parse_location("48.85").is_err());
        assert!(parse_location("north,2").is_err());
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for(Path::new("a.PNG")), "image/png");
        assert_eq!(content_type_for(Path::new("notes")), "application/octet-stream");
    }
}
