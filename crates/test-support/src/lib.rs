//! Scripted transport and session fixtures for engine tests.
//!
//! [`FakeTransport`] stands in for the TCP transport: the test holds the
//! other end as a [`FakeWire`], reads the frames the driver writes and
//! pushes server stanzas back.

use std::time::Duration;

use tokio::sync::mpsc;
use xmpp_parsers::iq::Iq;

use alumchat_xmpp::transport::{ConnectionConfig, XmppTransport};
use alumchat_xmpp::{ConnectionError, Session, Stanza};

const REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

pub struct FakeTransport {
    inbound: mpsc::Receiver<Vec<u8>>,
    sent: mpsc::UnboundedSender<Vec<u8>>,
}

/// Test-side handle: `sent` yields frames the client wrote, `inbound`
/// feeds server stanzas to the client.
pub struct FakeWire {
    pub inbound: mpsc::Sender<Vec<u8>>,
    pub sent: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub fn fake_pair() -> (FakeTransport, FakeWire) {
    let (inbound_tx, inbound_rx) = mpsc::channel(32);
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    (
        FakeTransport {
            inbound: inbound_rx,
            sent: sent_tx,
        },
        FakeWire {
            inbound: inbound_tx,
            sent: sent_rx,
        },
    )
}

impl XmppTransport for FakeTransport {
    // Fixtures hand the transport to Session::start directly; the dial
    // path is never scripted here.
    async fn connect(_config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        Err(ConnectionError::TransportError(
            "scripted transports are created with fake_pair".to_string(),
        ))
    }

    async fn connect_unauthenticated(config: &ConnectionConfig) -> Result<Self, ConnectionError> {
        Self::connect(config).await
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.sent
            .send(data.to_vec())
            .map_err(|_| ConnectionError::TransportError("wire closed".to_string()))
    }

    async fn recv(&mut self) -> Result<Vec<u8>, ConnectionError> {
        self.inbound
            .recv()
            .await
            .ok_or_else(|| ConnectionError::TransportError("wire closed".to_string()))
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.inbound.close();
        Ok(())
    }
}

/// A live session driven over a scripted wire, for engine tests that do
/// not need the manager.
pub fn session_fixture() -> (Session, FakeWire) {
    session_fixture_for("alice")
}

pub fn session_fixture_for(username: &str) -> (Session, FakeWire) {
    let (transport, wire) = fake_pair();
    let session = Session::start(
        transport,
        format!("{username}@alumchat.xyz"),
        username.to_string(),
        REQUEST_TIMEOUT,
    );
    (session, wire)
}

impl FakeWire {
    pub async fn push_xml(&self, xml: &str) {
        self.inbound
            .send(xml.as_bytes().to_vec())
            .await
            .expect("session driver should still be reading");
    }

    pub async fn next_sent(&mut self) -> Stanza {
        let bytes = self
            .sent
            .recv()
            .await
            .expect("session driver should have written a frame");
        Stanza::parse(&bytes).expect("sent frame should parse")
    }

    pub async fn next_sent_iq(&mut self) -> Iq {
        loop {
            if let Stanza::Iq(iq) = self.next_sent().await {
                return *iq;
            }
        }
    }

    /// Replies with an empty iq result to the next iq the client sends,
    /// returning the request for assertions.
    pub async fn ack_next_iq(&mut self) -> Iq {
        let iq = self.next_sent_iq().await;
        self.push_xml(&iq_result(&iq.id)).await;
        iq
    }
}

pub fn iq_result(id: &str) -> String {
    format!("<iq xmlns='jabber:client' type='result' id='{id}'/>")
}

pub fn iq_result_with(id: &str, payload_xml: &str) -> String {
    format!("<iq xmlns='jabber:client' type='result' id='{id}'>{payload_xml}</iq>")
}

pub fn iq_error(id: &str, condition: &str) -> String {
    format!(
        "<iq xmlns='jabber:client' type='error' id='{id}'>\
         <error type='cancel'>\
         <{condition} xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
         </error></iq>"
    )
}

pub fn presence_available(from: &str, show: Option<&str>, status: Option<&str>) -> String {
    let show = show.map(|s| format!("<show>{s}</show>")).unwrap_or_default();
    let status = status
        .map(|s| format!("<status>{s}</status>"))
        .unwrap_or_default();
    format!("<presence xmlns='jabber:client' from='{from}'>{show}{status}</presence>")
}

pub fn presence_unavailable(from: &str) -> String {
    format!("<presence xmlns='jabber:client' type='unavailable' from='{from}'/>")
}

pub fn chat_message(from: &str, body: &str) -> String {
    format!(
        "<message xmlns='jabber:client' type='chat' from='{from}'><body>{body}</body></message>"
    )
}

pub fn groupchat_message(occupant: &str, body: &str) -> String {
    format!(
        "<message xmlns='jabber:client' type='groupchat' from='{occupant}'>\
         <body>{body}</body></message>"
    )
}

pub fn roster_result(id: &str, items: &[(&str, &str, &str)]) -> String {
    let items: String = items
        .iter()
        .map(|(jid, name, subscription)| {
            format!("<item jid='{jid}' name='{name}' subscription='{subscription}'/>")
        })
        .collect();
    iq_result_with(id, &format!("<query xmlns='jabber:iq:roster'>{items}</query>"))
}

pub fn mam_result_message(queryid: &str, archive_id: &str, from: &str, body: &str, stamp: &str) -> String {
    format!(
        "<message xmlns='jabber:client'>\
         <result xmlns='urn:xmpp:mam:2' queryid='{queryid}' id='{archive_id}'>\
         <forwarded xmlns='urn:xmpp:forward:0'>\
         <delay xmlns='urn:xmpp:delay' stamp='{stamp}'/>\
         <message xmlns='jabber:client' type='chat' from='{from}'><body>{body}</body></message>\
         </forwarded></result></message>"
    )
}

pub fn mam_fin(id: &str) -> String {
    iq_result_with(
        id,
        "<fin xmlns='urn:xmpp:mam:2' complete='true'>\
         <set xmlns='http://jabber.org/protocol/rsm'/></fin>",
    )
}

pub fn disco_items_result(id: &str, jids: &[&str]) -> String {
    let items: String = jids
        .iter()
        .map(|jid| format!("<item jid='{jid}'/>"))
        .collect();
    iq_result_with(
        id,
        &format!("<query xmlns='http://jabber.org/protocol/disco#items'>{items}</query>"),
    )
}

pub fn disco_info_result(id: &str, features: &[&str]) -> String {
    let features: String = features
        .iter()
        .map(|var| format!("<feature var='{var}'/>"))
        .collect();
    iq_result_with(
        id,
        &format!(
            "<query xmlns='http://jabber.org/protocol/disco#info'>\
             <identity category='conference' type='text' name='rooms'/>{features}</query>"
        ),
    )
}
