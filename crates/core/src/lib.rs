//! Shared data model and configuration for the alumchat client.

pub mod config;
pub mod model;

pub use config::{Config, ConfigError};
pub use model::{
    bare_jid, localpart, Contact, Notification, NotificationKind, Presence, PresenceShow,
    Subscription,
};
