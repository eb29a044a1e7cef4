//! Session lifecycle and the driver task that owns the transport.
//!
//! A [`Session`] is a cheap handle: engines clone it freely, send stanzas
//! through it and subscribe to [`SessionEvent`]s. The driver task is the
//! only owner of the transport; iq replies are routed to whoever installed
//! the matching correlation waiter, everything else is classified and
//! broadcast.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use xmpp_parsers::iq::IqType;
use xmpp_parsers::stanza_error::DefinedCondition;

use alumchat_core::config::ServiceConfig;

use crate::builders;
use crate::dispatcher::{classify, SessionEvent};
use crate::error::{ConnectionError, SessionError};
use crate::stanza::Stanza;
use crate::transport::{ConnectionConfig, XmppTransport};

const OUTBOUND_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 256;
const RESOURCE: &str = "alumchat";

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Stanza>>>>;

enum OutboundFrame {
    Stanza {
        stanza: Stanza,
        ack: oneshot::Sender<Result<(), SessionError>>,
    },
    Shutdown,
}

/// Handle to one authenticated stream.
#[derive(Clone, Debug)]
pub struct Session {
    outbound: mpsc::Sender<OutboundFrame>,
    pending: PendingMap,
    events: broadcast::Sender<SessionEvent>,
    jid: String,
    username: String,
    request_timeout: Duration,
}

impl Session {
    /// Spawns the driver task around an already connected transport.
    /// [`SessionManager::login`] is the usual entry point; this is public
    /// for embedding and for test harnesses with scripted transports.
    pub fn start<T: XmppTransport>(
        transport: T,
        jid: String,
        username: String,
        request_timeout: Duration,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (events_tx, _) = broadcast::channel(EVENT_QUEUE);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(drive(
            transport,
            outbound_rx,
            Arc::clone(&pending),
            events_tx.clone(),
        ));

        Self {
            outbound: outbound_tx,
            pending,
            events: events_tx,
            jid,
            username,
            request_timeout,
        }
    }

    /// Bare JID of the authenticated account.
    pub fn jid(&self) -> &str {
        &self.jid
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_active(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Fire-and-forget delivery; resolves once the driver has written the
    /// frame to the wire.
    pub async fn send(&self, stanza: Stanza) -> Result<(), SessionError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.outbound
            .send(OutboundFrame::Stanza {
                stanza,
                ack: ack_tx,
            })
            .await
            .map_err(|_| SessionError::NotConnected)?;
        ack_rx.await.map_err(|_| SessionError::NotConnected)?
    }

    /// Sends an iq and waits for the correlated reply. The waiter is
    /// installed before the frame hits the wire, so a fast answer cannot
    /// slip past.
    pub async fn request(&self, stanza: Stanza) -> Result<Stanza, SessionError> {
        let id = stanza
            .iq_id()
            .ok_or_else(|| {
                SessionError::Malformed("request stanza carries no iq id".to_string())
            })?
            .to_string();

        let (reply_tx, reply_rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id.clone(), reply_tx);

        if let Err(error) = self.send(stanza).await {
            lock_pending(&self.pending).remove(&id);
            return Err(error);
        }

        match timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SessionError::NotConnected),
            Err(_) => {
                lock_pending(&self.pending).remove(&id);
                Err(SessionError::Connection(ConnectionError::Timeout))
            }
        }
    }

    /// Stops the driver and closes the transport. Pending requests fail
    /// with [`SessionError::NotConnected`].
    pub async fn close(&self) {
        let _ = self.outbound.send(OutboundFrame::Shutdown).await;
    }
}

fn lock_pending(pending: &PendingMap) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Stanza>>> {
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn take_waiter(pending: &PendingMap, stanza: &Stanza) -> Option<oneshot::Sender<Stanza>> {
    let Stanza::Iq(iq) = stanza else {
        return None;
    };
    if !matches!(iq.payload, IqType::Result(_) | IqType::Error(_)) {
        return None;
    }
    lock_pending(pending).remove(&iq.id)
}

fn fail_pending(pending: &PendingMap) {
    // Dropping the senders wakes every waiter with a recv error, which
    // surfaces as NotConnected.
    lock_pending(pending).clear();
}

async fn drive<T: XmppTransport>(
    mut transport: T,
    mut outbound_rx: mpsc::Receiver<OutboundFrame>,
    pending: PendingMap,
    events: broadcast::Sender<SessionEvent>,
) {
    loop {
        tokio::select! {
            frame = outbound_rx.recv() => match frame {
                Some(OutboundFrame::Stanza { stanza, ack }) => {
                    let written = match stanza.to_bytes() {
                        Ok(bytes) => transport
                            .send(&bytes)
                            .await
                            .map_err(|error| SessionError::SendFailed(error.to_string())),
                        Err(error) => Err(error),
                    };
                    let wire_failed = matches!(written, Err(SessionError::SendFailed(_)));
                    let _ = ack.send(written);
                    if wire_failed {
                        break;
                    }
                }
                Some(OutboundFrame::Shutdown) | None => {
                    let _ = transport.close().await;
                    break;
                }
            },
            inbound = transport.recv() => match inbound {
                Ok(bytes) => {
                    let stanza = match Stanza::parse(&bytes) {
                        Ok(stanza) => stanza,
                        Err(error) => {
                            warn!(%error, "dropping malformed inbound stanza");
                            continue;
                        }
                    };

                    if let Some(waiter) = take_waiter(&pending, &stanza) {
                        let _ = waiter.send(stanza);
                        continue;
                    }

                    if let Some(event) = classify(&stanza) {
                        let _ = events.send(event);
                    }
                }
                Err(error) => {
                    debug!(%error, "transport closed, stopping session driver");
                    break;
                }
            },
        }
    }

    fail_pending(&pending);
    let _ = events.send(SessionEvent::Disconnected);
}

/// Owns the single active session and the account lifecycle operations.
pub struct SessionManager {
    service: ServiceConfig,
    active: tokio::sync::Mutex<Option<Session>>,
}

impl SessionManager {
    pub fn new(service: ServiceConfig) -> Self {
        Self {
            service,
            active: tokio::sync::Mutex::new(None),
        }
    }

    pub fn domain(&self) -> &str {
        &self.service.domain
    }

    pub fn conference_domain(&self) -> &str {
        &self.service.conference_domain
    }

    fn connection_config(&self, jid: String, password: &str) -> ConnectionConfig {
        ConnectionConfig {
            jid,
            password: password.to_string(),
            server: self.service.server.clone(),
            port: Some(self.service.port),
            timeout_seconds: self.service.timeout_seconds,
        }
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.service.timeout_seconds).max(1))
    }

    /// Authenticates and brings up the session driver. Fails with
    /// [`SessionError::ConnectionConflict`] while another session is live.
    pub async fn login<T: XmppTransport>(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Session, SessionError> {
        let mut slot = self.active.lock().await;
        if slot.as_ref().is_some_and(Session::is_active) {
            return Err(SessionError::ConnectionConflict);
        }

        let bare_jid = format!("{username}@{}", self.service.domain);
        let full_jid = format!("{bare_jid}/{RESOURCE}");
        let config = self.connection_config(full_jid, password);

        let transport = T::connect(&config).await.map_err(map_login_error)?;
        let session = Session::start(
            transport,
            bare_jid,
            username.to_string(),
            self.request_timeout(),
        );

        // Announce availability so the server starts delivering presence
        // and offline messages.
        session.send(builders::presence_update(None, None)).await?;

        info!(jid = %session.jid(), "session established");
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Creates the account in band, then disconnects. The caller logs in
    /// explicitly afterwards.
    pub async fn register<T: XmppTransport>(
        &self,
        username: &str,
        password: &str,
        email: Option<&str>,
    ) -> Result<(), SessionError> {
        {
            let slot = self.active.lock().await;
            if slot.as_ref().is_some_and(Session::is_active) {
                return Err(SessionError::ConnectionConflict);
            }
        }

        let bare_jid = format!("{username}@{}", self.service.domain);
        let config = self.connection_config(bare_jid, password);

        let mut transport = T::connect_unauthenticated(&config)
            .await
            .map_err(map_login_error)?;

        let request = builders::register_submit(&self.service.domain, username, password, email)?;
        let request_id = request
            .iq_id()
            .ok_or_else(|| {
                SessionError::Malformed("registration request carries no iq id".to_string())
            })?
            .to_string();

        let frame = request.to_bytes()?;
        transport
            .send(&frame)
            .await
            .map_err(|error| SessionError::SendFailed(error.to_string()))?;

        let outcome = timeout(
            self.request_timeout(),
            await_registration_reply(&mut transport, &request_id),
        )
        .await
        .map_err(|_| SessionError::Connection(ConnectionError::Timeout))
        .and_then(|result| result);

        let _ = transport.close().await;
        outcome?;

        info!(username, "account registered");
        Ok(())
    }

    pub async fn current(&self) -> Result<Session, SessionError> {
        let slot = self.active.lock().await;
        match slot.as_ref() {
            Some(session) if session.is_active() => Ok(session.clone()),
            _ => Err(SessionError::NotConnected),
        }
    }

    /// Announces unavailability and tears the session down.
    pub async fn logout(&self) -> Result<(), SessionError> {
        let session = {
            let mut slot = self.active.lock().await;
            slot.take().ok_or(SessionError::NotConnected)?
        };

        // Best effort: the server drops presence on disconnect anyway.
        let _ = session.send(builders::presence_offline()).await;
        session.close().await;
        info!(jid = %session.jid(), "session closed");
        Ok(())
    }

    /// Deletes the authenticated account on the server, then disconnects.
    pub async fn delete_account(&self) -> Result<(), SessionError> {
        let session = self.current().await?;

        let reply = session.request(builders::unregister_request()).await?;
        let Stanza::Iq(iq) = reply else {
            return Err(SessionError::RemovalFailed(
                "unexpected reply to account removal".to_string(),
            ));
        };

        match iq.payload {
            IqType::Result(_) => {
                let mut slot = self.active.lock().await;
                slot.take();
                drop(slot);
                session.close().await;
                info!(jid = %session.jid(), "account deleted");
                Ok(())
            }
            IqType::Error(error) => Err(SessionError::RemovalFailed(format!(
                "{:?}",
                error.defined_condition
            ))),
            _ => Err(SessionError::RemovalFailed(
                "unexpected reply to account removal".to_string(),
            )),
        }
    }
}

fn map_login_error(error: ConnectionError) -> SessionError {
    match error {
        ConnectionError::AuthenticationFailed(message) => {
            SessionError::AuthenticationFailed(message)
        }
        other => SessionError::Connection(other),
    }
}

async fn await_registration_reply<T: XmppTransport>(
    transport: &mut T,
    request_id: &str,
) -> Result<(), SessionError> {
    loop {
        let bytes = transport
            .recv()
            .await
            .map_err(SessionError::Connection)?;
        let stanza = match Stanza::parse(&bytes) {
            Ok(stanza) => stanza,
            Err(error) => {
                warn!(%error, "dropping malformed stanza during registration");
                continue;
            }
        };

        let Stanza::Iq(iq) = stanza else {
            continue;
        };
        if iq.id != request_id {
            continue;
        }

        return match iq.payload {
            IqType::Result(_) => Ok(()),
            IqType::Error(error) => {
                if error.defined_condition == DefinedCondition::Conflict {
                    Err(SessionError::RegistrationConflict)
                } else {
                    Err(SessionError::RegistrationFailed(format!(
                        "{:?}",
                        error.defined_condition
                    )))
                }
            }
            _ => Err(SessionError::RegistrationFailed(
                "unexpected reply to registration".to_string(),
            )),
        };
    }
}
