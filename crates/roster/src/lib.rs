//! Roster and presence engine.
//!
//! Contact state lives on the server; this engine queries it on demand and
//! keeps a presence cache fed by [`observe`]. Presence lookups probe the
//! contact and race the answer against a timeout, then hold a short settle
//! window so a burst of answers from multiple resources lands on the most
//! recent value.
//!
//! [`observe`]: RosterEngine::observe

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use xmpp_parsers::iq::IqType;
use xmpp_parsers::presence::Show;
use xmpp_parsers::roster::{Roster, Subscription as WireSubscription};

use alumchat_core::config::PresenceConfig;
use alumchat_core::{bare_jid, Contact, Presence, PresenceShow, Subscription};
use alumchat_xmpp::{builders, Session, SessionError, SessionEvent, Stanza};

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("contact not found: {0}")]
    ContactNotFound(String),

    #[error("failed to add contact: {0}")]
    AddContactFailed(String),

    #[error("roster query failed: {0}")]
    QueryFailed(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

pub struct RosterEngine {
    session: Session,
    config: PresenceConfig,
    cache: Arc<Mutex<HashMap<String, Presence>>>,
}

impl RosterEngine {
    pub fn new(session: Session, config: PresenceConfig) -> Self {
        Self {
            session,
            config,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Feeds one session event into the presence cache. The caller's event
    /// pump invokes this for every event.
    pub fn observe(&self, event: &SessionEvent) {
        if let SessionEvent::PresenceChanged { from, presence } = event {
            self.lock_cache().insert(from.clone(), presence.clone());
        }
    }

    /// Contacts in server order, each carrying the latest cached presence.
    pub async fn get_contacts(&self) -> Result<Vec<Contact>, RosterError> {
        let reply = self.session.request(builders::roster_get()).await?;
        let items = roster_items(reply)?;

        let cache = self.lock_cache();
        Ok(items
            .into_iter()
            .map(|item| {
                let jid = item.jid.to_string();
                let mut contact = Contact::new(jid.clone());
                if let Some(name) = item.name.filter(|name| !name.is_empty()) {
                    contact.name = name;
                }
                contact.subscription = map_subscription(item.subscription);
                if let Some(presence) = cache.get(&jid) {
                    contact.presence = presence.clone();
                }
                contact
            })
            .collect())
    }

    pub async fn get_contact(&self, jid: &str) -> Result<Contact, RosterError> {
        let wanted = self.normalize(jid);
        self.get_contacts()
            .await?
            .into_iter()
            .find(|contact| contact.jid == wanted)
            .ok_or(RosterError::ContactNotFound(wanted))
    }

    /// Adds a contact: roster write first, then the subscription request,
    /// then a single greeting message.
    pub async fn add_contact(&self, jid: &str) -> Result<(), RosterError> {
        let jid = self.normalize(jid);

        let reply = self.session.request(builders::roster_add(&jid, None)?).await?;
        if let Stanza::Iq(iq) = &reply {
            if let IqType::Error(error) = &iq.payload {
                return Err(RosterError::AddContactFailed(format!(
                    "{:?}",
                    error.defined_condition
                )));
            }
        }

        self.session
            .send(builders::presence_subscribe(&jid)?)
            .await
            .map_err(|error| RosterError::AddContactFailed(error.to_string()))?;

        let greeting = format!("Hello, I am {}.", self.session.username());
        self.session
            .send(builders::chat_message(&jid, &greeting)?)
            .await
            .map_err(|error| RosterError::AddContactFailed(error.to_string()))?;

        debug!(%jid, "contact added");
        Ok(())
    }

    /// Probes a contact and waits for the answer. No answer within the
    /// probe timeout reads as Offline.
    pub async fn get_presence(&self, jid: &str) -> Result<Presence, RosterError> {
        let jid = self.normalize(jid);

        // Subscribe before the probe leaves, so a fast answer cannot be missed.
        let mut events = self.session.events();
        self.session.send(builders::presence_probe(&jid)?).await?;

        let probe_timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let first = match timeout(probe_timeout, next_presence(&mut events, &jid)).await {
            Ok(Some(presence)) => presence,
            Ok(None) | Err(_) => {
                debug!(%jid, "presence probe timed out, assuming offline");
                let offline = Presence::offline();
                self.lock_cache().insert(jid, offline.clone());
                return Ok(offline);
            }
        };

        let latest = self.settle(&mut events, &jid, first).await;
        self.lock_cache().insert(jid, latest.clone());
        Ok(latest)
    }

    /// Publishes the own availability.
    pub async fn change_status(
        &self,
        show: PresenceShow,
        status: Option<&str>,
    ) -> Result<(), RosterError> {
        let stanza = match show {
            PresenceShow::Offline => builders::presence_offline(),
            other => builders::presence_update(map_show(other), status),
        };
        self.session.send(stanza).await?;
        Ok(())
    }

    pub fn cached_presence(&self, jid: &str) -> Option<Presence> {
        self.lock_cache().get(self.normalize(jid).as_str()).cloned()
    }

    // Multiple resources answer a probe in close succession; keep
    // collecting for the settle window and take the last value.
    async fn settle(
        &self,
        events: &mut broadcast::Receiver<SessionEvent>,
        jid: &str,
        first: Presence,
    ) -> Presence {
        let mut latest = first;
        let window = sleep(Duration::from_millis(self.config.settle_delay_ms));
        tokio::pin!(window);

        loop {
            tokio::select! {
                _ = &mut window => break,
                event = events.recv() => match event {
                    Ok(SessionEvent::PresenceChanged { from, presence }) if from == jid => {
                        latest = presence;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "presence settle window lagged behind events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        latest
    }

    fn normalize(&self, jid: &str) -> String {
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

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, Presence>> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn next_presence(
    events: &mut broadcast::Receiver<SessionEvent>,
    jid: &str,
) -> Option<Presence> {
    loop {
        match events.recv().await {
            Ok(SessionEvent::PresenceChanged { from, presence }) if from == jid => {
                return Some(presence);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

fn roster_items(reply: Stanza) -> Result<Vec<xmpp_parsers::roster::Item>, RosterError> {
    let Stanza::Iq(iq) = reply else {
        return Err(RosterError::QueryFailed(
            "unexpected reply to roster query".to_string(),
        ));
    };
    match iq.payload {
        IqType::Result(Some(payload)) => {
            let roster = Roster::try_from(payload)
                .map_err(|error| RosterError::QueryFailed(error.to_string()))?;
            Ok(roster.items)
        }
        IqType::Result(None) => Ok(vec![]),
        IqType::Error(error) => Err(RosterError::QueryFailed(format!(
            "{:?}",
            error.defined_condition
        ))),
        _ => Err(RosterError::QueryFailed(
            "unexpected reply to roster query".to_string(),
        )),
    }
}

fn map_subscription(subscription: WireSubscription) -> Subscription {
    match subscription {
        WireSubscription::Both => Subscription::Both,
        WireSubscription::To => Subscription::To,
        WireSubscription::From => Subscription::From,
        _ => Subscription::None,
    }
}

fn map_show(show: PresenceShow) -> Option<Show> {
    match show {
        PresenceShow::Available => None,
        PresenceShow::Away => Some(Show::Away),
        PresenceShow::NotAvailable => Some(Show::Xa),
        PresenceShow::Busy => Some(Show::Dnd),
        PresenceShow::Offline => None,
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use xmpp_parsers::presence::Type as PresenceType;

    use alumchat_test_support::{
        iq_error, presence_available, presence_unavailable, roster_result, session_fixture,
    };

    use super::*;

    fn fast_config() -> PresenceConfig {
        PresenceConfig {
            probe_timeout_ms: 500,
            settle_delay_ms: 50,
        }
    }

    #[tokio::test]
    async fn contacts_keep_server_order_and_default_offline() {
        let (session, mut wire) = session_fixture();
        let engine = RosterEngine::new(session, fast_config());

        let responder = tokio::spawn(async move {
            let iq = wire.next_sent_iq().await;
            wire.push_xml(&roster_result(
                &iq.id,
                &[
                    ("bob@alumchat.xyz", "Bob", "both"),
                    ("carol@alumchat.xyz", "", "to"),
                    ("dave@alumchat.xyz", "Dave", "none"),
                ],
            ))
            .await;
            wire
        });

        let contacts = engine.get_contacts().await.unwrap();
        assert_eq!(contacts.len(), 3);
        assert_eq!(contacts[0].jid, "bob@alumchat.xyz");
        assert_eq!(contacts[0].name, "Bob");
        assert_eq!(contacts[0].subscription, Subscription::Both);
        // Empty roster name falls back to the jid.
        assert_eq!(contacts[1].name, "carol@alumchat.xyz");
        assert_eq!(contacts[1].subscription, Subscription::To);
        assert_eq!(contacts[2].jid, "dave@alumchat.xyz");

        for contact in &contacts {
            assert_eq!(contact.presence, Presence::offline());
        }

        responder.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_contact_is_reported_as_not_found() {
        let (session, mut wire) = session_fixture();
        let engine = RosterEngine::new(session, fast_config());

        let responder = tokio::spawn(async move {
            let iq = wire.next_sent_iq().await;
            wire.push_xml(&roster_result(&iq.id, &[("bob@alumchat.xyz", "Bob", "both")]))
                .await;
            wire
        });

        let error = engine.get_contact("nobody@alumchat.xyz").await.unwrap_err();
        assert_matches!(error, RosterError::ContactNotFound(jid) => {
            assert_eq!(jid, "nobody@alumchat.xyz");
        });

        responder.await.unwrap();
    }

    #[tokio::test]
    async fn observed_presence_shows_up_in_contacts() {
        let (session, mut wire) = session_fixture();
        let engine = RosterEngine::new(session, fast_config());

        engine.observe(&SessionEvent::PresenceChanged {
            from: "bob@alumchat.xyz".to_string(),
            presence: Presence::new(PresenceShow::Away, Some("lunch".to_string())),
        });

        let responder = tokio::spawn(async move {
            let iq = wire.next_sent_iq().await;
            wire.push_xml(&roster_result(&iq.id, &[("bob@alumchat.xyz", "Bob", "both")]))
                .await;
            wire
        });

        let contact = engine.get_contact("bob@alumchat.xyz").await.unwrap();
        assert_eq!(contact.presence.show, PresenceShow::Away);
        assert_eq!(contact.presence.status.as_deref(), Some("lunch"));

        responder.await.unwrap();
    }

    #[tokio::test]
    async fn add_contact_writes_roster_then_subscribes_then_greets_once() {
        let (session, mut wire) = session_fixture();
        let engine = RosterEngine::new(session, fast_config());

        let responder = tokio::spawn(async move {
            // 1. roster write, acked so the engine proceeds
            let iq = wire.ack_next_iq().await;
            assert_matches!(iq.payload, IqType::Set(_));

            // 2. subscription request
            let Stanza::Presence(presence) = wire.next_sent().await else {
                panic!("expected subscribe presence after the roster write");
            };
            assert_eq!(presence.type_, PresenceType::Subscribe);
            assert_eq!(
                presence.to.as_ref().map(|j| j.to_string()),
                Some("bob@alumchat.xyz".to_string())
            );

            // 3. one greeting message
            let Stanza::Message(message) = wire.next_sent().await else {
                panic!("expected the greeting message last");
            };
            assert_eq!(
                message.bodies.get("").map(|body| body.0.as_str()),
                Some("Hello, I am alice.")
            );
            wire
        });

        engine.add_contact("bob").await.unwrap();

        let mut wire = responder.await.unwrap();
        // No further frames: the greeting goes out exactly once.
        wire.sent.close();
        assert!(wire.sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn add_contact_surfaces_roster_rejection() {
        let (session, mut wire) = session_fixture();
        let engine = RosterEngine::new(session, fast_config());

        let responder = tokio::spawn(async move {
            let iq = wire.next_sent_iq().await;
            wire.push_xml(&iq_error(&iq.id, "not-allowed")).await;
            wire
        });

        let error = engine.add_contact("bob@alumchat.xyz").await.unwrap_err();
        assert_matches!(error, RosterError::AddContactFailed(_));

        let mut wire = responder.await.unwrap();
        wire.sent.close();
        assert!(
            wire.sent.try_recv().is_err(),
            "no subscribe or greeting after a rejected roster write"
        );
    }

    #[tokio::test]
    async fn probe_answer_is_mapped_and_cached() {
        let (session, mut wire) = session_fixture();
        let engine = RosterEngine::new(session, fast_config());

        let responder = tokio::spawn(async move {
            let Stanza::Presence(probe) = wire.next_sent().await else {
                panic!("expected a presence probe");
            };
            assert_eq!(probe.type_, PresenceType::Probe);
            wire.push_xml(&presence_available(
                "bob@alumchat.xyz/phone",
                Some("dnd"),
                Some("in a meeting"),
            ))
            .await;
            wire
        });

        let presence = engine.get_presence("bob@alumchat.xyz").await.unwrap();
        assert_eq!(presence.show, PresenceShow::Busy);
        assert_eq!(presence.status.as_deref(), Some("in a meeting"));
        assert_eq!(
            engine.cached_presence("bob@alumchat.xyz"),
            Some(presence)
        );

        responder.await.unwrap();
    }

    #[tokio::test]
    async fn settle_window_takes_the_latest_answer() {
        let (session, mut wire) = session_fixture();
        let engine = RosterEngine::new(session, fast_config());

        let responder = tokio::spawn(async move {
            let _probe = wire.next_sent().await;
            wire.push_xml(&presence_available(
                "bob@alumchat.xyz/phone",
                Some("away"),
                None,
            ))
            .await;
            wire.push_xml(&presence_available(
                "bob@alumchat.xyz/laptop",
                Some("dnd"),
                None,
            ))
            .await;
            wire
        });

        let presence = engine.get_presence("bob@alumchat.xyz").await.unwrap();
        assert_eq!(presence.show, PresenceShow::Busy);

        responder.await.unwrap();
    }

    #[tokio::test]
    async fn silent_probe_reads_as_offline() {
        let (session, _wire) = session_fixture();
        let engine = RosterEngine::new(
            session,
            PresenceConfig {
                probe_timeout_ms: 100,
                settle_delay_ms: 10,
            },
        );

        let presence = engine.get_presence("ghost@alumchat.xyz").await.unwrap();
        assert_eq!(presence, Presence::offline());
        assert_eq!(
            engine.cached_presence("ghost@alumchat.xyz"),
            Some(Presence::offline())
        );
    }

    #[tokio::test]
    async fn unavailable_answer_reads_as_offline() {
        let (session, mut wire) = session_fixture();
        let engine = RosterEngine::new(session, fast_config());

        let responder = tokio::spawn(async move {
            let _probe = wire.next_sent().await;
            wire.push_xml(&presence_unavailable("bob@alumchat.xyz")).await;
            wire
        });

        let presence = engine.get_presence("bob@alumchat.xyz").await.unwrap();
        assert_eq!(presence.show, PresenceShow::Offline);

        responder.await.unwrap();
    }

    #[tokio::test]
    async fn change_status_maps_show_values() {
        let (session, mut wire) = session_fixture();
        let engine = RosterEngine::new(session, fast_config());

        engine
            .change_status(PresenceShow::Busy, Some("focus time"))
            .await
            .unwrap();
        let Stanza::Presence(presence) = wire.next_sent().await else {
            panic!("expected a presence update");
        };
        assert_eq!(presence.show, Some(Show::Dnd));
        assert_eq!(
            presence.statuses.get("").map(String::as_str),
            Some("focus time")
        );

        engine.change_status(PresenceShow::Offline, None).await.unwrap();
        let Stanza::Presence(presence) = wire.next_sent().await else {
            panic!("expected an unavailable presence");
        };
        assert_eq!(presence.type_, PresenceType::Unavailable);
    }
}
