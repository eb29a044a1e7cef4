use std::fmt;
use std::str::FromStr;

/// Availability of a contact as shown to the user.
///
/// The wire `<show/>` values map onto this set; anything the server sends
/// that is not recognized counts as plain availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PresenceShow {
    #[default]
    Available,
    Away,
    NotAvailable,
    Busy,
    Offline,
}

impl PresenceShow {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceShow::Available => "Available",
            PresenceShow::Away => "Away",
            PresenceShow::NotAvailable => "Not Available",
            PresenceShow::Busy => "Busy",
            PresenceShow::Offline => "Offline",
        }
    }

    /// Maps a raw `<show/>` text to the display value. Empty or missing
    /// show text means the contact is plainly available.
    pub fn from_show_text(raw: Option<&str>) -> Self {
        match raw.map(str::trim).unwrap_or("") {
            "away" => PresenceShow::Away,
            "xa" => PresenceShow::NotAvailable,
            "dnd" => PresenceShow::Busy,
            "unavailable" => PresenceShow::Offline,
            _ => PresenceShow::Available,
        }
    }
}

impl fmt::Display for PresenceShow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One presence snapshot for a bare JID.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Presence {
    pub show: PresenceShow,
    pub status: Option<String>,
}

impl Presence {
    pub fn new(show: PresenceShow, status: Option<String>) -> Self {
        Self { show, status }
    }

    pub fn offline() -> Self {
        Self {
            show: PresenceShow::Offline,
            status: None,
        }
    }
}

/// Roster subscription state between the local account and a contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Subscription {
    #[default]
    None,
    To,
    From,
    Both,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
        }
    }
}

impl FromStr for Subscription {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Subscription::None),
            "to" => Ok(Subscription::To),
            "from" => Ok(Subscription::From),
            "both" => Ok(Subscription::Both),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One roster entry enriched with the last known presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub jid: String,
    pub name: String,
    pub subscription: Subscription,
    pub presence: Presence,
}

impl Contact {
    /// A fresh contact defaults its display name to the jid and its
    /// presence to Offline until a probe or broadcast says otherwise.
    pub fn new(jid: impl Into<String>) -> Self {
        let jid = jid.into();
        Self {
            name: jid.clone(),
            jid,
            subscription: Subscription::None,
            presence: Presence::offline(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    FriendRequest,
    GroupInvite,
}

/// A pending action the user has not resolved yet.
///
/// Uniqueness is by kind + sender, so repeated subscription requests from
/// the same contact collapse into one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Notification {
    pub kind: NotificationKind,
    pub from: String,
}

impl Notification {
    pub fn friend_request(from: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::FriendRequest,
            from: from.into(),
        }
    }

    pub fn group_invite(from: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::GroupInvite,
            from: from.into(),
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            NotificationKind::FriendRequest => {
                write!(f, "New friend request from: {}", self.from)
            }
            NotificationKind::GroupInvite => {
                write!(f, "New group invite from: {}", self.from)
            }
        }
    }
}

/// Strips the resource part, leaving the bare jid.
pub fn bare_jid(jid: &str) -> &str {
    jid.split('/').next().unwrap_or(jid)
}

/// The local part of a jid, when it has one.
pub fn localpart(jid: &str) -> Option<&str> {
    let bare = bare_jid(jid);
    let (local, _) = bare.split_once('@')?;
    if local.is_empty() { None } else { Some(local) }
}
