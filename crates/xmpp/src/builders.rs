//! Outbound stanza builders.
//!
//! Every builder returns a fully addressed [`Stanza`]; iq builders mint a
//! fresh uuid so callers can correlate the reply via [`Stanza::iq_id`].

use uuid::Uuid;
use xmpp_parsers::disco::{DiscoInfoQuery, DiscoItemsQuery};
use xmpp_parsers::ibb::{Close, Data, Open, Stanza as IbbStanza, StreamId};
use xmpp_parsers::iq::{Iq, IqType};
use xmpp_parsers::jid;
use xmpp_parsers::message::{Body, Message, MessageType as XmppMessageType};
use xmpp_parsers::minidom::Element;
use xmpp_parsers::muc::Muc;
use xmpp_parsers::ns;
use xmpp_parsers::presence::{Presence, Show, Type as PresenceType};
use xmpp_parsers::roster;

use crate::error::SessionError;
use crate::stanza::Stanza;

fn parse_jid(raw: &str) -> Result<jid::Jid, SessionError> {
    raw.parse()
        .map_err(|_| SessionError::InvalidJid(raw.to_string()))
}

fn parse_bare_jid(raw: &str) -> Result<jid::BareJid, SessionError> {
    raw.parse()
        .map_err(|_| SessionError::InvalidJid(raw.to_string()))
}

fn fresh_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn roster_get() -> Stanza {
    let query = roster::Roster {
        ver: None,
        items: vec![],
    };
    Stanza::Iq(Box::new(Iq::from_get(fresh_id(), query)))
}

pub fn roster_add(jid_str: &str, name: Option<&str>) -> Result<Stanza, SessionError> {
    let item = roster::Item {
        jid: parse_bare_jid(jid_str)?,
        name: name.map(String::from),
        subscription: roster::Subscription::None,
        ask: roster::Ask::None,
        groups: vec![],
    };
    let query = roster::Roster {
        ver: None,
        items: vec![item],
    };
    Ok(Stanza::Iq(Box::new(Iq::from_set(fresh_id(), query))))
}

pub fn presence_probe(to: &str) -> Result<Stanza, SessionError> {
    let mut presence = Presence::new(PresenceType::Probe);
    presence.to = Some(parse_jid(to)?);
    Ok(Stanza::Presence(Box::new(presence)))
}

pub fn presence_subscribe(to: &str) -> Result<Stanza, SessionError> {
    let mut presence = Presence::new(PresenceType::Subscribe);
    presence.to = Some(parse_jid(to)?);
    Ok(Stanza::Presence(Box::new(presence)))
}

/// Answer to an inbound subscription request: `subscribed` accepts,
/// `unsubscribed` declines.
pub fn presence_subscription_response(to: &str, accept: bool) -> Result<Stanza, SessionError> {
    let mut presence = Presence::new(if accept {
        PresenceType::Subscribed
    } else {
        PresenceType::Unsubscribed
    });
    presence.to = Some(parse_jid(to)?);
    Ok(Stanza::Presence(Box::new(presence)))
}

pub fn presence_update(show: Option<Show>, status: Option<&str>) -> Stanza {
    let mut presence = Presence::new(PresenceType::None);
    presence.show = show;
    if let Some(text) = status {
        presence.statuses.insert(String::new(), text.to_string());
    }
    Stanza::Presence(Box::new(presence))
}

/// Broadcast to the server that this resource is going away.
pub fn presence_offline() -> Stanza {
    Stanza::Presence(Box::new(Presence::new(PresenceType::Unavailable)))
}

pub fn chat_message(to: &str, body: &str) -> Result<Stanza, SessionError> {
    let mut msg = Message::new_with_type(XmppMessageType::Chat, Some(parse_jid(to)?));
    msg.id = Some(fresh_id());
    msg.bodies.insert(String::new(), Body(body.to_string()));
    Ok(Stanza::Message(Box::new(msg)))
}

pub fn groupchat_message(room: &str, body: &str) -> Result<Stanza, SessionError> {
    let mut msg = Message::new_with_type(XmppMessageType::Groupchat, Some(parse_jid(room)?));
    msg.id = Some(fresh_id());
    msg.bodies.insert(String::new(), Body(body.to_string()));
    Ok(Stanza::Message(Box::new(msg)))
}

pub fn muc_join(room: &str, nick: &str) -> Result<Stanza, SessionError> {
    let occupant = format!("{room}/{nick}");
    let mut presence = Presence::new(PresenceType::None);
    presence.to = Some(parse_jid(&occupant)?);
    presence.payloads.push(Muc::new().into());
    Ok(Stanza::Presence(Box::new(presence)))
}

/// Mediated invite, delivered through the room itself.
pub fn muc_invite(room: &str, invitee: &str, reason: Option<&str>) -> Result<Stanza, SessionError> {
    let room_jid = parse_jid(room)?;
    parse_jid(invitee)?;

    let mut invite = Element::builder("invite", ns::MUC_USER).attr("to", invitee);
    if let Some(text) = reason {
        invite = invite.append(
            Element::builder("reason", ns::MUC_USER)
                .append(text)
                .build(),
        );
    }
    let x = Element::builder("x", ns::MUC_USER)
        .append(invite.build())
        .build();

    let mut msg = Message::new(Some(room_jid));
    msg.payloads.push(x);
    Ok(Stanza::Message(Box::new(msg)))
}

/// Tells the room a mediated invitation was turned down.
pub fn muc_decline(room: &str) -> Result<Stanza, SessionError> {
    let room_jid = parse_jid(room)?;

    let x = Element::builder("x", ns::MUC_USER)
        .append(Element::builder("decline", ns::MUC_USER).build())
        .build();

    let mut msg = Message::new(Some(room_jid));
    msg.payloads.push(x);
    Ok(Stanza::Message(Box::new(msg)))
}

fn form_field(var: &str, type_: Option<&str>, value: &str) -> Element {
    let mut field = Element::builder("field", ns::DATA_FORMS).attr("var", var);
    if let Some(type_) = type_ {
        field = field.attr("type", type_);
    }
    field
        .append(
            Element::builder("value", ns::DATA_FORMS)
                .append(value)
                .build(),
        )
        .build()
}

/// Owner configuration submit that locks the room down to members only.
pub fn room_members_only_config(room: &str) -> Result<Stanza, SessionError> {
    let form = Element::builder("x", ns::DATA_FORMS)
        .attr("type", "submit")
        .append(form_field(
            "FORM_TYPE",
            Some("hidden"),
            "http://jabber.org/protocol/muc#roomconfig",
        ))
        .append(form_field("muc#roomconfig_membersonly", None, "1"))
        .build();
    let query = Element::builder("query", "http://jabber.org/protocol/muc#owner")
        .append(form)
        .build();

    let iq = Iq {
        from: None,
        to: Some(parse_jid(room)?),
        id: fresh_id(),
        payload: IqType::Set(query),
    };
    Ok(Stanza::Iq(Box::new(iq)))
}

pub fn register_submit(
    domain: &str,
    username: &str,
    password: &str,
    email: Option<&str>,
) -> Result<Stanza, SessionError> {
    let mut query = Element::builder("query", ns::REGISTER)
        .append(
            Element::builder("username", ns::REGISTER)
                .append(username)
                .build(),
        )
        .append(
            Element::builder("password", ns::REGISTER)
                .append(password)
                .build(),
        );
    if let Some(address) = email {
        query = query.append(
            Element::builder("email", ns::REGISTER)
                .append(address)
                .build(),
        );
    }
    let query = query.build();
    let iq = Iq {
        from: None,
        to: Some(parse_jid(domain)?),
        id: fresh_id(),
        payload: IqType::Set(query),
    };
    Ok(Stanza::Iq(Box::new(iq)))
}

/// Asks the server to delete the authenticated account.
pub fn unregister_request() -> Stanza {
    let query = Element::builder("query", ns::REGISTER)
        .append(Element::builder("remove", ns::REGISTER).build())
        .build();
    let iq = Iq {
        from: None,
        to: None,
        id: fresh_id(),
        payload: IqType::Set(query),
    };
    Stanza::Iq(Box::new(iq))
}

pub fn ibb_open(to: &str, sid: &str, block_size: u16) -> Result<Stanza, SessionError> {
    let open = Open {
        block_size,
        sid: StreamId(sid.to_string()),
        stanza: IbbStanza::Iq,
    };
    let mut iq = Iq::from_set(fresh_id(), open);
    iq.to = Some(parse_jid(to)?);
    Ok(Stanza::Iq(Box::new(iq)))
}

pub fn ibb_data(to: &str, sid: &str, seq: u16, chunk: Vec<u8>) -> Result<Stanza, SessionError> {
    let data = Data {
        seq,
        sid: StreamId(sid.to_string()),
        data: chunk,
    };
    let mut iq = Iq::from_set(fresh_id(), data);
    iq.to = Some(parse_jid(to)?);
    Ok(Stanza::Iq(Box::new(iq)))
}

pub fn ibb_close(to: &str, sid: &str) -> Result<Stanza, SessionError> {
    let close = Close {
        sid: StreamId(sid.to_string()),
    };
    let mut iq = Iq::from_set(fresh_id(), close);
    iq.to = Some(parse_jid(to)?);
    Ok(Stanza::Iq(Box::new(iq)))
}

/// Empty result acknowledging an inbound iq set, addressed back to its
/// sender with the same id.
pub fn iq_ack(to: &str, id: &str) -> Result<Stanza, SessionError> {
    let iq = Iq {
        from: None,
        to: Some(parse_jid(to)?),
        id: id.to_string(),
        payload: IqType::Result(None),
    };
    Ok(Stanza::Iq(Box::new(iq)))
}

pub fn disco_items(to: &str) -> Result<Stanza, SessionError> {
    let mut iq = Iq::from_get(fresh_id(), DiscoItemsQuery { node: None, rsm: None });
    iq.to = Some(parse_jid(to)?);
    Ok(Stanza::Iq(Box::new(iq)))
}

pub fn disco_info(to: &str) -> Result<Stanza, SessionError> {
    let mut iq = Iq::from_get(fresh_id(), DiscoInfoQuery { node: None });
    iq.to = Some(parse_jid(to)?);
    Ok(Stanza::Iq(Box::new(iq)))
}

/// Archive query, optionally filtered to one conversation partner. Sent
/// to the room JID for groupchat history, addressless for the own archive.
pub fn mam_query(to: Option<&str>, queryid: &str, with: Option<&str>) -> Result<Stanza, SessionError> {
    let mut form = Element::builder("x", ns::DATA_FORMS)
        .attr("type", "submit")
        .append(form_field("FORM_TYPE", Some("hidden"), ns::MAM));
    if let Some(partner) = with {
        form = form.append(form_field("with", None, partner));
    }

    let query = Element::builder("query", ns::MAM)
        .attr("queryid", queryid)
        .append(form.build())
        .build();

    let to = match to {
        Some(raw) => Some(parse_jid(raw)?),
        None => None,
    };
    let iq = Iq {
        from: None,
        to,
        id: fresh_id(),
        payload: IqType::Set(query),
    };
    Ok(Stanza::Iq(Box::new(iq)))
}
