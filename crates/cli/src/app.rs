//! Interactive menu loop wiring the session engines to stdin/stdout.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

use alumchat_core::{Config, NotificationKind, PresenceShow};
use alumchat_messaging::{MessagingEngine, render_group_message, truncate_body};
use alumchat_notifications::NotificationCenter;
use alumchat_roster::RosterEngine;
use alumchat_transfer::TransferEngine;
use alumchat_xmpp::{NativeTcpTransport, Session, SessionEvent, SessionManager};

pub struct App {
    config: Config,
    manager: SessionManager,
    lines: Lines<BufReader<Stdin>>,
}

/// The engines that observe the event stream and serve the menu verbs.
#[derive(Clone)]
struct Engines {
    roster: Arc<RosterEngine>,
    notifications: Arc<NotificationCenter>,
    messaging: Arc<MessagingEngine>,
    transfer: Arc<TransferEngine>,
}

impl App {
    pub fn new(config: Config) -> Self {
        let manager = SessionManager::new(config.service.clone());
        Self {
            config,
            manager,
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            println!();
            println!("=== alumchat ===");
            println!("1. Login");
            println!("2. Register");
            println!("3. Exit");
            match self.prompt("> ").await?.as_str() {
                "1" => self.login_flow().await?,
                "2" => self.register_flow().await?,
                "3" => return Ok(()),
                other => println!("Unknown option: {other}"),
            }
        }
    }

    async fn prompt(&mut self, label: &str) -> Result<String> {
        use std::io::Write;
        print!("{label}");
        std::io::stdout().flush()?;
        let line = self.lines.next_line().await?.unwrap_or_default();
        Ok(line.trim().to_string())
    }

    async fn register_flow(&mut self) -> Result<()> {
        let username = self.prompt("Username: ").await?;
        let password = self.prompt("Password: ").await?;
        let email = self.prompt("Email (optional): ").await?;
        let email = if email.is_empty() {
            None
        } else {
            Some(email.as_str())
        };
        match self
            .manager
            .register::<NativeTcpTransport>(&username, &password, email)
            .await
        {
            Ok(()) => println!("Account created. You can log in now."),
            Err(error) => println!("Registration failed: {error}"),
        }
        Ok(())
    }

    async fn login_flow(&mut self) -> Result<()> {
        let username = self.prompt("Username: ").await?;
        let password = self.prompt("Password: ").await?;
        let session = match self
            .manager
            .login::<NativeTcpTransport>(&username, &password)
            .await
        {
            Ok(session) => session,
            Err(error) => {
                println!("Login failed: {error}");
                return Ok(());
            }
        };
        println!("Logged in as {}", session.jid());

        let engines = Engines {
            roster: Arc::new(RosterEngine::new(
                session.clone(),
                self.config.presence.clone(),
            )),
            notifications: Arc::new(NotificationCenter::new(session.clone())),
            messaging: Arc::new(MessagingEngine::new(
                session.clone(),
                self.manager.conference_domain(),
            )),
            transfer: Arc::new(TransferEngine::new(
                session.clone(),
                self.config.transfer.clone(),
            )),
        };
        let pump = spawn_pump(&session, engines.clone());

        self.session_menu(&engines).await?;
        pump.abort();
        Ok(())
    }

    async fn session_menu(&mut self, engines: &Engines) -> Result<()> {
        loop {
            println!();
            println!("1. Show contacts");
            println!("2. Show contact details");
            println!("3. Add a contact");
            println!("4. Send a direct message");
            println!("5. Create a group");
            println!("6. Join a group");
            println!("7. Invite someone to a group");
            println!("8. Send a group message");
            println!("9. Change status");
            println!("10. Notifications");
            println!("11. Send a file");
            println!("12. Logout");
            println!("13. Delete my account");
            match self.prompt("> ").await?.as_str() {
                "1" => self.show_contacts(engines).await,
                "2" => self.show_contact(engines).await?,
                "3" => self.add_contact(engines).await?,
                "4" => self.direct_message(engines).await?,
                "5" => self.create_group(engines).await?,
                "6" => self.join_group(engines).await?,
                "7" => self.invite_to_group(engines).await?,
                "8" => self.group_message(engines).await?,
                "9" => self.change_status(engines).await?,
                "10" => self.notifications(engines).await?,
                "11" => self.send_file(engines).await?,
                "12" => {
                    if let Err(error) = self.manager.logout().await {
                        println!("Logout failed: {error}");
                    }
                    return Ok(());
                }
                "13" => {
                    let confirm = self
                        .prompt("This removes the account from the server. Type yes to confirm: ")
                        .await?;
                    if confirm.eq_ignore_ascii_case("yes") {
                        match self.manager.delete_account().await {
                            Ok(()) => {
                                println!("Account deleted.");
                                return Ok(());
                            }
                            Err(error) => println!("Account removal failed: {error}"),
                        }
                    }
                }
                other => println!("Unknown option: {other}"),
            }
        }
    }

    async fn show_contacts(&self, engines: &Engines) {
        match engines.roster.get_contacts().await {
            Ok(contacts) if contacts.is_empty() => println!("Your roster is empty."),
            Ok(contacts) => {
                for contact in contacts {
                    println!(
                        "{} ({}) [{}] {}{}",
                        contact.name,
                        contact.jid,
                        contact.subscription,
                        contact.presence.show,
                        contact
                            .presence
                            .status
                            .map(|status| format!(" - {status}"))
                            .unwrap_or_default(),
                    );
                }
            }
            Err(error) => println!("Could not fetch the roster: {error}"),
        }
    }

    async fn show_contact(&mut self, engines: &Engines) -> Result<()> {
        let jid = self.prompt("Contact: ").await?;
        match engines.roster.get_contact(&jid).await {
            Ok(contact) => {
                let presence = engines
                    .roster
                    .get_presence(&contact.jid)
                    .await
                    .unwrap_or(contact.presence);
                println!("Name: {}", contact.name);
                println!("Jid: {}", contact.jid);
                println!("Subscription: {}", contact.subscription);
                println!(
                    "Presence: {}{}",
                    presence.show,
                    presence
                        .status
                        .map(|status| format!(" - {status}"))
                        .unwrap_or_default(),
                );
            }
            Err(error) => println!("Could not show the contact: {error}"),
        }
        Ok(())
    }

    async fn add_contact(&mut self, engines: &Engines) -> Result<()> {
        let jid = self.prompt("Contact to add: ").await?;
        match engines.roster.add_contact(&jid).await {
            Ok(()) => println!("Request sent to {jid}."),
            Err(error) => println!("Could not add the contact: {error}"),
        }
        Ok(())
    }

    async fn direct_message(&mut self, engines: &Engines) -> Result<()> {
        let to = self.prompt("To: ").await?;
        let body = self.prompt("Message: ").await?;
        if let Err(error) = engines.messaging.direct_message(&to, &body).await {
            println!("Could not send the message: {error}");
        }
        Ok(())
    }

    async fn create_group(&mut self, engines: &Engines) -> Result<()> {
        let name = self.prompt("Group name: ").await?;
        match engines.messaging.create_group(&name).await {
            Ok(room) => println!("Group created: {room}"),
            Err(error) => println!("Could not create the group: {error}"),
        }
        Ok(())
    }

    async fn join_group(&mut self, engines: &Engines) -> Result<()> {
        let room = self.prompt("Group: ").await?;
        match engines.messaging.join_group(&room).await {
            Ok(history) => {
                for entry in history {
                    println!("[{}] {}: {}", entry.timestamp, entry.from, entry.body);
                }
                println!("Joined {room}.");
            }
            Err(error) => println!("Could not join the group: {error}"),
        }
        Ok(())
    }

    async fn invite_to_group(&mut self, engines: &Engines) -> Result<()> {
        let room = self.prompt("Group: ").await?;
        let user = self.prompt("User to invite: ").await?;
        match engines.messaging.invite_to_group(&room, &user).await {
            Ok(()) => println!("Invitation sent."),
            Err(error) => println!("Could not send the invitation: {error}"),
        }
        Ok(())
    }

    async fn group_message(&mut self, engines: &Engines) -> Result<()> {
        let room = self.prompt("Group: ").await?;
        let body = self.prompt("Message: ").await?;
        if let Err(error) = engines.messaging.group_message(&room, &body).await {
            println!("Could not send the message: {error}");
        }
        Ok(())
    }

    async fn change_status(&mut self, engines: &Engines) -> Result<()> {
        let raw = self.prompt("Status (available, away, xa, dnd, offline): ").await?;
        let show = match raw.as_str() {
            "offline" => PresenceShow::Offline,
            other => PresenceShow::from_show_text(Some(other)),
        };
        let message = self.prompt("Status message (optional): ").await?;
        let status = if message.is_empty() {
            None
        } else {
            Some(message.as_str())
        };
        match engines.roster.change_status(show, status).await {
            Ok(()) => println!("Status updated."),
            Err(error) => println!("Could not change the status: {error}"),
        }
        Ok(())
    }

    async fn notifications(&mut self, engines: &Engines) -> Result<()> {
        let pending = engines.notifications.pending();
        if pending.is_empty() {
            println!("No pending notifications.");
            return Ok(());
        }
        for (index, notification) in pending.iter().enumerate() {
            println!("{}. {notification}", index + 1);
        }
        let choice = self.prompt("Notification number (empty to go back): ").await?;
        if choice.is_empty() {
            return Ok(());
        }
        let Some(notification) = choice
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|n| pending.get(n))
        else {
            println!("No such notification.");
            return Ok(());
        };

        let answer = self.prompt("Accept or reject? (a/r): ").await?;
        let accept = answer.eq_ignore_ascii_case("a");
        let outcome = match (notification.kind, accept) {
            (NotificationKind::FriendRequest, true) => {
                engines
                    .notifications
                    .accept_contact_request(&notification.from)
                    .await
            }
            (NotificationKind::FriendRequest, false) => {
                engines
                    .notifications
                    .decline_contact_request(&notification.from)
                    .await
            }
            (NotificationKind::GroupInvite, true) => {
                engines
                    .notifications
                    .accept_group_invite(&notification.from)
                    .await
            }
            (NotificationKind::GroupInvite, false) => {
                engines
                    .notifications
                    .decline_group_invite(&notification.from)
                    .await
            }
        };
        if let Err(error) = outcome {
            println!("Could not resolve the notification: {error}");
        }
        Ok(())
    }

    async fn send_file(&mut self, engines: &Engines) -> Result<()> {
        let to = self.prompt("To: ").await?;
        let path = self.prompt("File path: ").await?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(error) => {
                println!("Could not read {path}: {error}");
                return Ok(());
            }
        };
        let file_name = Path::new(&path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());
        match engines.transfer.send_file(&to, &file_name, &bytes).await {
            Ok(()) => println!("File sent."),
            Err(error) => println!("Could not send the file: {error}"),
        }
        Ok(())
    }
}

/// Forwards session events to the engines and prints whatever the user
/// should see as it arrives.
fn spawn_pump(session: &Session, engines: Engines) -> JoinHandle<()> {
    let mut events = session.events();
    let own_nick = session.username().to_string();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event pump fell behind");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            engines.roster.observe(&event);
            engines.notifications.observe(&event);
            engines.transfer.observe(&event).await;

            match &event {
                SessionEvent::DirectMessage { from, body } => {
                    println!("[{from}] {}", truncate_body(body));
                }
                SessionEvent::GroupMessage { room, nick, body } => {
                    if let Some(line) = render_group_message(&own_nick, nick, body) {
                        println!("[{room}] {line}");
                    }
                }
                SessionEvent::SubscriptionRequest { from } => {
                    println!("New friend request from: {from}");
                }
                SessionEvent::GroupInvite { room, inviter } => match inviter {
                    Some(inviter) => println!("{inviter} invited you to {room}"),
                    None => println!("You were invited to {room}"),
                },
                SessionEvent::TransferClosed { .. } => {
                    for file in engines.transfer.take_completed() {
                        println!(
                            "Received a file from {} ({} bytes)",
                            file.from,
                            file.bytes.len()
                        );
                    }
                }
                SessionEvent::Disconnected => {
                    println!("Connection lost.");
                    break;
                }
                _ => {}
            }
        }
    })
}
