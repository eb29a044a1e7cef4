//! XMPP session core: transport, SASL, stanza builders, the session
//! driver with its correlation table, and the inbound dispatcher.

pub mod builders;
pub mod dispatcher;
pub mod error;
pub mod sasl;
pub mod session;
pub mod stanza;
pub mod transport;

pub use dispatcher::SessionEvent;
pub use error::{ConnectionError, SessionError};
pub use session::{Session, SessionManager};
pub use stanza::Stanza;
pub use transport::{ConnectionConfig, NativeTcpTransport, XmppTransport};
