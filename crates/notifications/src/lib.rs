//! Pending friend requests and group invites.
//!
//! The queue holds everything the user has not resolved yet. Entries are
//! unique by kind and sender; resolving one sends the protocol answer and
//! drops it from the queue. Resolving an entry that is already gone is a
//! no-op, so double handling stays harmless.

use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

use alumchat_core::{Notification, NotificationKind};
use alumchat_xmpp::{builders, Session, SessionError, SessionEvent};

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error(transparent)]
    Session(#[from] SessionError),
}

pub struct NotificationCenter {
    session: Session,
    pending: Mutex<Vec<Notification>>,
}

impl NotificationCenter {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Queues notifications out of the event stream. Duplicates collapse.
    pub fn observe(&self, event: &SessionEvent) {
        let notification = match event {
            SessionEvent::SubscriptionRequest { from } => Notification::friend_request(from),
            SessionEvent::GroupInvite { room, .. } => Notification::group_invite(room),
            _ => return,
        };

        let mut pending = self.lock_pending();
        if !pending.contains(&notification) {
            debug!(%notification, "notification queued");
            pending.push(notification);
        }
    }

    /// Unresolved notifications, oldest first.
    pub fn pending(&self) -> Vec<Notification> {
        self.lock_pending().clone()
    }

    pub fn has_pending(&self) -> bool {
        !self.lock_pending().is_empty()
    }

    /// Unresolved friend requests only.
    pub fn contact_requests(&self) -> Vec<Notification> {
        self.filtered(NotificationKind::FriendRequest)
    }

    /// Unresolved group invites only.
    pub fn invite_requests(&self) -> Vec<Notification> {
        self.filtered(NotificationKind::GroupInvite)
    }

    fn filtered(&self, kind: NotificationKind) -> Vec<Notification> {
        self.lock_pending()
            .iter()
            .filter(|n| n.kind == kind)
            .cloned()
            .collect()
    }

    /// Grants the subscription and asks for the reverse one, so presence
    /// flows both ways.
    pub async fn accept_contact_request(&self, jid: &str) -> Result<(), NotificationError> {
        self.session
            .send(builders::presence_subscription_response(jid, true)?)
            .await?;
        self.session.send(builders::presence_subscribe(jid)?).await?;
        self.resolve(NotificationKind::FriendRequest, jid);
        Ok(())
    }

    pub async fn decline_contact_request(&self, jid: &str) -> Result<(), NotificationError> {
        self.session
            .send(builders::presence_subscription_response(jid, false)?)
            .await?;
        self.resolve(NotificationKind::FriendRequest, jid);
        Ok(())
    }

    /// Joins the room under the account's username.
    pub async fn accept_group_invite(&self, room: &str) -> Result<(), NotificationError> {
        let nick = self.session.username().to_string();
        self.session.send(builders::muc_join(room, &nick)?).await?;
        self.resolve(NotificationKind::GroupInvite, room);
        Ok(())
    }

    /// Tells the room the invitation was turned down, then drops the entry.
    pub async fn decline_group_invite(&self, room: &str) -> Result<(), NotificationError> {
        self.session.send(builders::muc_decline(room)?).await?;
        self.resolve(NotificationKind::GroupInvite, room);
        Ok(())
    }

    fn resolve(&self, kind: NotificationKind, from: &str) {
        self.lock_pending()
            .retain(|n| !(n.kind == kind && n.from == from));
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<Notification>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use xmpp_parsers::presence::Type as PresenceType;

    use alumchat_test_support::session_fixture;
    use alumchat_xmpp::Stanza;

    use super::*;

    fn subscription_request(from: &str) -> SessionEvent {
        SessionEvent::SubscriptionRequest {
            from: from.to_string(),
        }
    }

    fn group_invite(room: &str) -> SessionEvent {
        SessionEvent::GroupInvite {
            room: room.to_string(),
            inviter: None,
        }
    }

    #[tokio::test]
    async fn queues_requests_and_invites() {
        let (session, _wire) = session_fixture();
        let center = NotificationCenter::new(session);

        center.observe(&subscription_request("bob@alumchat.xyz"));
        center.observe(&group_invite("team@conference.alumchat.xyz"));

        let pending = center.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0], Notification::friend_request("bob@alumchat.xyz"));
        assert_eq!(
            pending[1],
            Notification::group_invite("team@conference.alumchat.xyz")
        );
    }

    #[tokio::test]
    async fn repeated_requests_collapse_into_one_entry() {
        let (session, _wire) = session_fixture();
        let center = NotificationCenter::new(session);

        center.observe(&subscription_request("bob@alumchat.xyz"));
        center.observe(&subscription_request("bob@alumchat.xyz"));
        center.observe(&subscription_request("bob@alumchat.xyz"));

        assert_eq!(center.pending().len(), 1);
    }

    #[tokio::test]
    async fn accepting_grants_and_requests_back() {
        let (session, mut wire) = session_fixture();
        let center = NotificationCenter::new(session);
        center.observe(&subscription_request("bob@alumchat.xyz"));

        center
            .accept_contact_request("bob@alumchat.xyz")
            .await
            .unwrap();

        let Stanza::Presence(granted) = wire.next_sent().await else {
            panic!("expected the subscribed presence first");
        };
        assert_eq!(granted.type_, PresenceType::Subscribed);

        let Stanza::Presence(reverse) = wire.next_sent().await else {
            panic!("expected the reverse subscribe");
        };
        assert_eq!(reverse.type_, PresenceType::Subscribe);

        assert!(!center.has_pending());
    }

    #[tokio::test]
    async fn resolving_one_entry_keeps_the_others() {
        let (session, _wire) = session_fixture();
        let center = NotificationCenter::new(session);

        center.observe(&subscription_request("bob@alumchat.xyz"));
        center.observe(&subscription_request("carol@alumchat.xyz"));

        center
            .accept_contact_request("bob@alumchat.xyz")
            .await
            .unwrap();

        let pending = center.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0], Notification::friend_request("carol@alumchat.xyz"));
    }

    #[tokio::test]
    async fn declining_sends_unsubscribed() {
        let (session, mut wire) = session_fixture();
        let center = NotificationCenter::new(session);
        center.observe(&subscription_request("bob@alumchat.xyz"));

        center
            .decline_contact_request("bob@alumchat.xyz")
            .await
            .unwrap();

        let Stanza::Presence(declined) = wire.next_sent().await else {
            panic!("expected the unsubscribed presence");
        };
        assert_eq!(declined.type_, PresenceType::Unsubscribed);
        assert!(!center.has_pending());
    }

    #[tokio::test]
    async fn accepting_an_invite_joins_under_the_username() {
        let (session, mut wire) = session_fixture();
        let center = NotificationCenter::new(session);
        center.observe(&group_invite("team@conference.alumchat.xyz"));

        center
            .accept_group_invite("team@conference.alumchat.xyz")
            .await
            .unwrap();

        let Stanza::Presence(join) = wire.next_sent().await else {
            panic!("expected the join presence");
        };
        assert_eq!(
            join.to.as_ref().map(|j| j.to_string()),
            Some("team@conference.alumchat.xyz/alice".to_string())
        );
        assert!(!center.has_pending());
    }

    #[tokio::test]
    async fn views_split_by_kind() {
        let (session, _wire) = session_fixture();
        let center = NotificationCenter::new(session);

        center.observe(&subscription_request("bob@alumchat.xyz"));
        center.observe(&group_invite("team@conference.alumchat.xyz"));

        let requests = center.contact_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].from, "bob@alumchat.xyz");

        let invites = center.invite_requests();
        assert_eq!(invites.len(), 1);
        assert_eq!(invites[0].from, "team@conference.alumchat.xyz");
    }

    #[tokio::test]
    async fn declining_an_invite_answers_the_room() {
        let (session, mut wire) = session_fixture();
        let center = NotificationCenter::new(session);
        center.observe(&group_invite("team@conference.alumchat.xyz"));

        center
            .decline_group_invite("team@conference.alumchat.xyz")
            .await
            .unwrap();

        let Stanza::Message(decline) = wire.next_sent().await else {
            panic!("expected the decline message");
        };
        assert_eq!(
            decline.to.as_ref().map(|j| j.to_string()),
            Some("team@conference.alumchat.xyz".to_string())
        );
        assert!(!center.has_pending());
    }

    #[tokio::test]
    async fn resolving_an_absent_entry_is_harmless() {
        let (session, mut wire) = session_fixture();
        let center = NotificationCenter::new(session);

        // Never queued, double declined: both are no-ops on the queue.
        center
            .decline_group_invite("team@conference.alumchat.xyz")
            .await
            .unwrap();
        center
            .decline_group_invite("team@conference.alumchat.xyz")
            .await
            .unwrap();
        assert!(!center.has_pending());

        // Accepting an absent request still answers on the wire.
        let result = center.accept_contact_request("bob@alumchat.xyz").await;
        assert_matches!(result, Ok(()));
        let mut kinds = Vec::new();
        for _ in 0..4 {
            kinds.push(wire.next_sent().await.name().to_string());
        }
        assert_eq!(kinds, ["message", "message", "presence", "presence"]);
    }
}
