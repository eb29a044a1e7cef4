use std::str::FromStr;

use xmpp_parsers::{iq::Iq, message::Message, minidom::Element, presence::Presence};

use crate::error::SessionError;

/// One parsed protocol unit: message, presence, or iq.
#[derive(Debug, Clone, PartialEq)]
pub enum Stanza {
    Message(Box<Message>),
    Presence(Box<Presence>),
    Iq(Box<Iq>),
}

impl Stanza {
    pub fn parse(raw: &[u8]) -> Result<Self, SessionError> {
        let xml = std::str::from_utf8(raw)
            .map_err(|error| SessionError::Malformed(format!("invalid UTF-8 bytes: {error}")))?;
        let trimmed = xml.trim();
        if trimmed.is_empty() {
            return Err(SessionError::Malformed("empty stanza payload".to_string()));
        }

        let element = Element::from_str(trimmed)
            .map_err(|error| SessionError::Malformed(format!("invalid stanza XML: {error}")))?;
        Self::try_from(element)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SessionError> {
        let element = self.to_element();
        let mut payload = Vec::new();
        element.write_to(&mut payload).map_err(|error| {
            SessionError::Malformed(format!(
                "failed to serialize <{}/> stanza: {error}",
                self.name()
            ))
        })?;
        Ok(payload)
    }

    pub fn to_element(&self) -> Element {
        match self {
            Stanza::Message(message) => (**message).clone().into(),
            Stanza::Presence(presence) => (**presence).clone().into(),
            Stanza::Iq(iq) => (**iq).clone().into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stanza::Message(_) => "message",
            Stanza::Presence(_) => "presence",
            Stanza::Iq(_) => "iq",
        }
    }

    /// Correlation id, when the stanza carries one. Only iq ids take part
    /// in request/reply matching.
    pub fn iq_id(&self) -> Option<&str> {
        match self {
            Stanza::Iq(iq) => Some(iq.id.as_str()),
            _ => None,
        }
    }
}

impl TryFrom<Element> for Stanza {
    type Error = SessionError;

    fn try_from(element: Element) -> Result<Self, Self::Error> {
        match element.name() {
            "message" => Message::try_from(element)
                .map(|message| Stanza::Message(Box::new(message)))
                .map_err(|error| {
                    SessionError::Malformed(format!("bad <message/> stanza: {error}"))
                }),
            "presence" => Presence::try_from(element)
                .map(|presence| Stanza::Presence(Box::new(presence)))
                .map_err(|error| {
                    SessionError::Malformed(format!("bad <presence/> stanza: {error}"))
                }),
            "iq" => Iq::try_from(element)
                .map(|iq| Stanza::Iq(Box::new(iq)))
                .map_err(|error| SessionError::Malformed(format!("bad <iq/> stanza: {error}"))),
            other => Err(SessionError::Malformed(format!(
                "unsupported stanza element <{other}/>"
            ))),
        }
    }
}

impl From<Stanza> for Element {
    fn from(value: Stanza) -> Self {
        match value {
            Stanza::Message(message) => (*message).into(),
            Stanza::Presence(presence) => (*presence).into(),
            Stanza::Iq(iq) => (*iq).into(),
        }
    }
}
