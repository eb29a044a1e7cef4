//! Direct and group messaging.
//!
//! Rooms live under the configured conference domain; bare names are
//! qualified before anything touches the wire. Group history goes through
//! service discovery first, so servers without an archive fail cleanly
//! with [`MessagingError::ArchiveUnavailable`].

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, warn};
use uuid::Uuid;
use xmpp_parsers::disco::{DiscoInfoResult, DiscoItemsResult};
use xmpp_parsers::iq::IqType;
use xmpp_parsers::ns;

use alumchat_core::{bare_jid, localpart};
use alumchat_xmpp::{builders, Session, SessionError, SessionEvent, Stanza};

const MAX_DISPLAY_BODY: usize = 40;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("no message archive service available")]
    ArchiveUnavailable,

    #[error("group setup failed: {0}")]
    GroupSetupFailed(String),

    #[error("history query failed: {0}")]
    HistoryFailed(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// One message recovered from the server archive.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryMessage {
    pub from: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

pub struct MessagingEngine {
    session: Session,
    conference_domain: String,
}

impl MessagingEngine {
    pub fn new(session: Session, conference_domain: impl Into<String>) -> Self {
        Self {
            session,
            conference_domain: conference_domain.into(),
        }
    }

    pub async fn direct_message(&self, to: &str, body: &str) -> Result<(), MessagingError> {
        let to = self.normalize_contact(to);
        self.session.send(builders::chat_message(&to, body)?).await?;
        Ok(())
    }

    pub async fn group_message(&self, room: &str, body: &str) -> Result<(), MessagingError> {
        let room = self.normalize_room(room);
        self.session
            .send(builders::groupchat_message(&room, body)?)
            .await?;
        Ok(())
    }

    /// Creates a members-only room: first join creates it, the owner
    /// config locks it down, then a welcome message opens it. The steps
    /// run in order and the first failure aborts the rest; there is no
    /// rollback for a half-created room.
    pub async fn create_group(&self, name: &str) -> Result<String, MessagingError> {
        let room = self.normalize_room(name);
        let nick = self.session.username().to_string();

        self.session.send(builders::muc_join(&room, &nick)?).await?;

        let reply = self
            .session
            .request(builders::room_members_only_config(&room)?)
            .await?;
        if let Stanza::Iq(iq) = &reply {
            if let IqType::Error(error) = &iq.payload {
                return Err(MessagingError::GroupSetupFailed(format!(
                    "{:?}",
                    error.defined_condition
                )));
            }
        }

        let local = localpart(&room).unwrap_or(&room).to_string();
        let welcome = format!("Welcome to the group {local}.");
        self.session
            .send(builders::groupchat_message(&room, &welcome)?)
            .await?;

        debug!(%room, "group created");
        Ok(room)
    }

    /// Mediated invitation; the room relays it, so no reply is awaited.
    pub async fn invite_to_group(&self, room: &str, user: &str) -> Result<(), MessagingError> {
        let room = self.normalize_room(room);
        let user = self.normalize_contact(user);
        self.session
            .send(builders::muc_invite(&room, &user, None)?)
            .await?;
        Ok(())
    }

    /// Joins under the account's username. History is fetched best
    /// effort; a missing or failing archive never blocks the join.
    pub async fn join_group(&self, room: &str) -> Result<Vec<HistoryMessage>, MessagingError> {
        let room = self.normalize_room(room);
        let nick = self.session.username().to_string();
        self.session.send(builders::muc_join(&room, &nick)?).await?;

        match self.group_history(&room).await {
            Ok(history) => Ok(history),
            Err(error) => {
                warn!(%room, %error, "history unavailable after join");
                Ok(vec![])
            }
        }
    }

    /// Fetches the room archive. Discovers an archive-capable service
    /// first and queries it filtered by the room.
    pub async fn group_history(&self, room: &str) -> Result<Vec<HistoryMessage>, MessagingError> {
        let room = self.normalize_room(room);
        self.discover_archive_service().await?;

        let queryid = Uuid::new_v4().to_string();

        // Archived messages fan out as events while the fin reply settles
        // the request, so the subscription must exist before the query.
        let mut events = self.session.events();
        let reply = self
            .session
            .request(builders::mam_query(Some(&room), &queryid, None)?)
            .await?;

        if let Stanza::Iq(iq) = &reply {
            if let IqType::Error(error) = &iq.payload {
                return Err(MessagingError::HistoryFailed(format!(
                    "{:?}",
                    error.defined_condition
                )));
            }
        }

        let mut history = Vec::new();
        loop {
            match events.try_recv() {
                Ok(SessionEvent::ArchivedMessage {
                    queryid: id,
                    from,
                    body,
                    timestamp,
                }) if id == queryid => {
                    history.push(HistoryMessage {
                        from,
                        body,
                        timestamp,
                    });
                }
                Ok(_) => {}
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "history collection lagged behind events");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        Ok(history)
    }

    async fn discover_archive_service(&self) -> Result<(), MessagingError> {
        let domain = self
            .session
            .jid()
            .split_once('@')
            .map(|(_, domain)| domain.to_string())
            .unwrap_or_else(|| self.session.jid().to_string());

        let mut candidates = vec![domain.clone()];
        if let Ok(items) = self.disco_items(&domain).await {
            candidates.extend(items);
        }

        for candidate in candidates {
            match self.advertises_archive(&candidate).await {
                Ok(true) => {
                    debug!(service = %candidate, "archive service found");
                    return Ok(());
                }
                Ok(false) => {}
                Err(error) => {
                    debug!(service = %candidate, %error, "service discovery probe failed");
                }
            }
        }
        Err(MessagingError::ArchiveUnavailable)
    }

    async fn disco_items(&self, target: &str) -> Result<Vec<String>, MessagingError> {
        let reply = self.session.request(builders::disco_items(target)?).await?;
        let Stanza::Iq(iq) = reply else {
            return Ok(vec![]);
        };
        let IqType::Result(Some(payload)) = iq.payload else {
            return Ok(vec![]);
        };
        let result = DiscoItemsResult::try_from(payload)
            .map_err(|error| MessagingError::HistoryFailed(error.to_string()))?;
        Ok(result
            .items
            .into_iter()
            .map(|item| item.jid.to_string())
            .collect())
    }

    async fn advertises_archive(&self, target: &str) -> Result<bool, MessagingError> {
        let reply = self.session.request(builders::disco_info(target)?).await?;
        let Stanza::Iq(iq) = reply else {
            return Ok(false);
        };
        let IqType::Result(Some(payload)) = iq.payload else {
            return Ok(false);
        };
        let result = DiscoInfoResult::try_from(payload)
            .map_err(|error| MessagingError::HistoryFailed(error.to_string()))?;
        Ok(result.features.iter().any(|feature| feature.var == ns::MAM))
    }

    fn normalize_contact(&self, jid: &str) -> String {
        let bare = bare_jid(jid);
        if bare.contains('@') {
            bare.to_string()
        } else {
            let domain = self
                .session
                .jid()
                .split_once('@')
                .map(|(_, domain)| domain)
                .unwrap_or("");
            format!("{bare}@{domain}")
        }
    }

    fn normalize_room(&self, room: &str) -> String {
        let bare = bare_jid(room);
        if bare.contains('@') {
            bare.to_string()
        } else {
            format!("{bare}@{}", self.conference_domain)
        }
    }
}

/// Rendering policy for live group messages: the own echo is dropped and
/// long bodies are cut at 40 characters with an ellipsis.
pub fn render_group_message(own_nick: &str, nick: &str, body: &str) -> Option<String> {
    if nick == own_nick {
        return None;
    }
    Some(format!("{nick}: {}", truncate_body(body)))
}

pub fn truncate_body(body: &str) -> String {
    if body.chars().count() <= MAX_DISPLAY_BODY {
        return body.to_string();
    }
    let cut: String = body.chars().take(MAX_DISPLAY_BODY).collect();
    format!("{cut}...")
}
