//! Inbound stanza classification.
//!
//! The session driver strips correlated iq replies first; everything else
//! flows through [`classify`] and out to subscribers as a [`SessionEvent`].
//! Classification is pure so the mapping rules stay unit-testable.

use chrono::{DateTime, Utc};
use xmpp_parsers::ibb;
use xmpp_parsers::iq::IqType;
use xmpp_parsers::mam;
use xmpp_parsers::message::{Message, MessageType as XmppMessageType};
use xmpp_parsers::ns;
use xmpp_parsers::presence::{Presence as XmppPresence, Show, Type as PresenceType};

use alumchat_core::{bare_jid, Presence as CorePresence, PresenceShow};

use crate::stanza::Stanza;

/// What the stream produced, translated out of wire terms.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    DirectMessage {
        from: String,
        body: String,
    },
    GroupMessage {
        room: String,
        nick: String,
        body: String,
    },
    PresenceChanged {
        from: String,
        presence: CorePresence,
    },
    SubscriptionRequest {
        from: String,
    },
    GroupInvite {
        room: String,
        inviter: Option<String>,
    },
    ArchivedMessage {
        queryid: String,
        from: String,
        body: String,
        timestamp: DateTime<Utc>,
    },
    TransferOpened {
        from: String,
        iq_id: String,
        sid: String,
        block_size: u16,
    },
    TransferChunk {
        from: String,
        iq_id: String,
        sid: String,
        seq: u16,
        data: Vec<u8>,
    },
    TransferClosed {
        from: String,
        iq_id: String,
        sid: String,
    },
    Disconnected,
}

/// Maps one uncorrelated inbound stanza to an event. Stanzas with no
/// user-visible meaning (acks, probes, occupant presence) map to `None`.
pub fn classify(stanza: &Stanza) -> Option<SessionEvent> {
    match stanza {
        Stanza::Message(message) => classify_message(message),
        Stanza::Presence(presence) => classify_presence(presence),
        Stanza::Iq(iq) => {
            let from = iq.from.as_ref()?.to_string();
            let iq_id = iq.id.clone();
            let IqType::Set(payload) = &iq.payload else {
                return None;
            };

            if let Ok(open) = ibb::Open::try_from(payload.clone()) {
                return Some(SessionEvent::TransferOpened {
                    from,
                    iq_id,
                    sid: open.sid.0,
                    block_size: open.block_size,
                });
            }
            if let Ok(data) = ibb::Data::try_from(payload.clone()) {
                return Some(SessionEvent::TransferChunk {
                    from,
                    iq_id,
                    sid: data.sid.0,
                    seq: data.seq,
                    data: data.data,
                });
            }
            if let Ok(close) = ibb::Close::try_from(payload.clone()) {
                return Some(SessionEvent::TransferClosed {
                    from,
                    iq_id,
                    sid: close.sid.0,
                });
            }
            None
        }
    }
}

fn classify_message(message: &Message) -> Option<SessionEvent> {
    if let Some(result) = message
        .payloads
        .iter()
        .find_map(|el| mam::Result_::try_from(el.clone()).ok())
    {
        let archived = result.forwarded.stanza.as_ref()?;
        let timestamp = result
            .forwarded
            .delay
            .as_ref()
            .map(|delay| delay.stamp.0.to_utc())
            .unwrap_or_else(Utc::now);
        let body = archived
            .get_best_body(vec![])
            .map(|(_, body)| body.0.clone())
            .unwrap_or_default();
        return Some(SessionEvent::ArchivedMessage {
            queryid: result
                .queryid
                .as_ref()
                .map(|q| q.0.clone())
                .unwrap_or_default(),
            from: archived
                .from
                .as_ref()
                .map(|jid| jid.to_string())
                .unwrap_or_default(),
            body,
            timestamp,
        });
    }

    if let Some(inviter) = mediated_inviter(message) {
        let from = message.from.as_ref()?.to_string();
        return Some(SessionEvent::GroupInvite {
            room: bare_jid(&from).to_string(),
            inviter,
        });
    }

    if let Some(room) = direct_invite_room(message) {
        let inviter = message
            .from
            .as_ref()
            .map(|jid| bare_jid(&jid.to_string()).to_string());
        return Some(SessionEvent::GroupInvite { room, inviter });
    }

    let from = message.from.as_ref()?.to_string();
    let body = message.get_best_body(vec![]).map(|(_, body)| body.0.clone())?;
    if body.is_empty() {
        return None;
    }

    match message.type_ {
        XmppMessageType::Groupchat => {
            let (room, nick) = match from.split_once('/') {
                Some((room, nick)) => (room.to_string(), nick.to_string()),
                // Subject changes and history markers come from the bare room.
                None => (from, String::new()),
            };
            Some(SessionEvent::GroupMessage { room, nick, body })
        }
        XmppMessageType::Error => None,
        _ => Some(SessionEvent::DirectMessage { from, body }),
    }
}

fn mediated_inviter(message: &Message) -> Option<Option<String>> {
    let x = message
        .payloads
        .iter()
        .find(|el| el.is("x", ns::MUC_USER))?;
    let invite = x.get_child("invite", ns::MUC_USER)?;
    Some(invite.attr("from").map(String::from))
}

// Direct invitations name the room in the payload instead of the sender.
fn direct_invite_room(message: &Message) -> Option<String> {
    let x = message
        .payloads
        .iter()
        .find(|el| el.is("x", "jabber:x:conference"))?;
    x.attr("jid").map(String::from)
}

fn classify_presence(presence: &XmppPresence) -> Option<SessionEvent> {
    let from = presence.from.as_ref()?.to_string();

    // Occupant presence from a room carries the muc#user payload and is
    // not a contact availability change.
    if presence.payloads.iter().any(|el| el.is("x", ns::MUC_USER)) {
        return None;
    }

    match presence.type_ {
        PresenceType::Subscribe => Some(SessionEvent::SubscriptionRequest {
            from: bare_jid(&from).to_string(),
        }),
        PresenceType::Unavailable | PresenceType::Error => Some(SessionEvent::PresenceChanged {
            from: bare_jid(&from).to_string(),
            presence: CorePresence::offline(),
        }),
        PresenceType::None => {
            let show = PresenceShow::from_show_text(presence.show.clone().map(show_text));
            let status = presence
                .statuses
                .get("")
                .or_else(|| presence.statuses.values().next())
                .cloned();
            Some(SessionEvent::PresenceChanged {
                from: bare_jid(&from).to_string(),
                presence: CorePresence { show, status },
            })
        }
        _ => None,
    }
}

fn show_text(show: Show) -> &'static str {
    match show {
        Show::Away => "away",
        Show::Chat => "chat",
        Show::Dnd => "dnd",
        Show::Xa => "xa",
    }
}
