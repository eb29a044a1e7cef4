//! SASL negotiation and resource binding for a freshly opened stream.

use std::collections::HashSet;
use std::str::FromStr;

use futures::StreamExt;
use sasl::client::mechanisms::{Plain, Scram};
use sasl::client::Mechanism;
use sasl::common::scram::{Sha1, Sha256};
use sasl::common::{ChannelBinding, Credentials};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_xmpp::parsers::{
    bind::{BindQuery, BindResponse},
    iq::{Iq, IqType},
    sasl::{Auth, Challenge, Failure, Mechanism as SaslMechanism, Response, Success},
};
use tokio_xmpp::xmpp_stream::XMPPStream;
use tokio_xmpp::Packet;
use tracing::{debug, warn};

use crate::error::ConnectionError;

const BIND_REQUEST_ID: &str = "resource-bind";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedMechanism {
    ScramSha256,
    ScramSha1,
    Plain,
}

impl SelectedMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            SelectedMechanism::ScramSha256 => "SCRAM-SHA-256",
            SelectedMechanism::ScramSha1 => "SCRAM-SHA-1",
            SelectedMechanism::Plain => "PLAIN",
        }
    }
}

const MECHANISM_PREFERENCE: &[SelectedMechanism] = &[
    SelectedMechanism::ScramSha256,
    SelectedMechanism::ScramSha1,
    SelectedMechanism::Plain,
];

pub fn select_mechanism(server_mechanisms: &HashSet<String>) -> Option<SelectedMechanism> {
    MECHANISM_PREFERENCE
        .iter()
        .find(|m| server_mechanisms.contains(m.name()))
        .copied()
}

fn build_mechanism(
    selected: SelectedMechanism,
    credentials: &Credentials,
) -> Result<Box<dyn Mechanism + Send>, ConnectionError> {
    let failed = |name: &str, e| {
        ConnectionError::AuthenticationFailed(format!("failed to initialize {name}: {e:?}"))
    };
    match selected {
        SelectedMechanism::ScramSha256 => Scram::<Sha256>::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>)
            .map_err(|e| failed("SCRAM-SHA-256", format!("{e:?}"))),
        SelectedMechanism::ScramSha1 => Scram::<Sha1>::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>)
            .map_err(|e| failed("SCRAM-SHA-1", format!("{e:?}"))),
        SelectedMechanism::Plain => Plain::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>)
            .map_err(|e| failed("PLAIN", format!("{e:?}"))),
    }
}

pub(crate) fn map_failure(failure: &Failure) -> ConnectionError {
    let condition = format!("{:?}", failure.defined_condition);
    let text = failure.texts.values().next().cloned().unwrap_or_default();

    if text.is_empty() {
        ConnectionError::AuthenticationFailed(condition)
    } else {
        ConnectionError::AuthenticationFailed(format!("{condition}: {text}"))
    }
}

async fn restart_and_bind<S>(stream: XMPPStream<S>) -> Result<XMPPStream<S>, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = stream.restart().await.map_err(|error| {
        ConnectionError::StreamError(format!(
            "failed to restart stream after SASL authentication: {error}"
        ))
    })?;

    if !stream.stream_features.can_bind() {
        return Ok(stream);
    }

    let resource = stream.jid.resource().map(|resource| resource.to_string());
    let bind_iq = Iq::from_set(BIND_REQUEST_ID, BindQuery::new(resource));
    stream.send_stanza(bind_iq).await.map_err(|error| {
        ConnectionError::StreamError(format!("failed to send resource bind request: {error}"))
    })?;

    loop {
        match stream.next().await {
            Some(Ok(Packet::Stanza(stanza))) => {
                if let Ok(iq) = Iq::try_from(stanza) {
                    if iq.id != BIND_REQUEST_ID {
                        continue;
                    }

                    match iq.payload {
                        IqType::Result(payload) => {
                            if let Some(payload) = payload {
                                let bind = BindResponse::try_from(payload).map_err(|error| {
                                    ConnectionError::StreamError(format!(
                                        "invalid resource bind response payload: {error}"
                                    ))
                                })?;
                                stream.jid = bind.into();
                            }
                            return Ok(stream);
                        }
                        _ => {
                            return Err(ConnectionError::StreamError(
                                "invalid response to resource binding".to_string(),
                            ));
                        }
                    }
                }
            }
            Some(Ok(_)) => {}
            Some(Err(error)) => {
                return Err(ConnectionError::StreamError(format!(
                    "stream error during resource binding: {error}"
                )));
            }
            None => {
                return Err(ConnectionError::TransportError(
                    "connection closed during resource binding".to_string(),
                ));
            }
        }
    }
}

/// Runs SASL against the server, restarts the stream and binds a
/// resource, then hands back the raw byte stream.
pub async fn authenticate<S>(
    mut stream: XMPPStream<S>,
    username: &str,
    password: &str,
) -> Result<S, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_mechanisms: HashSet<String> = stream
        .stream_features
        .sasl_mechanisms()
        .map_err(|_| {
            ConnectionError::AuthenticationFailed(
                "server did not advertise any SASL mechanisms".to_string(),
            )
        })?
        .collect();

    debug!(mechanisms = ?server_mechanisms, "server advertised SASL mechanisms");

    let selected = select_mechanism(&server_mechanisms).ok_or_else(|| {
        ConnectionError::AuthenticationFailed(format!(
            "no supported SASL mechanism found; server offers: {}",
            server_mechanisms
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        ))
    })?;

    debug!(mechanism = selected.name(), "selected SASL mechanism");

    let credentials = Credentials::default()
        .with_username(username)
        .with_password(password)
        .with_channel_binding(ChannelBinding::Unsupported);

    let mut mechanism = build_mechanism(selected, &credentials)?;
    let initial_data = mechanism.initial();

    let mechanism_name = SaslMechanism::from_str(mechanism.name()).map_err(|e| {
        ConnectionError::AuthenticationFailed(format!("invalid SASL mechanism name: {e}"))
    })?;

    stream
        .send_stanza(Auth {
            mechanism: mechanism_name,
            data: initial_data,
        })
        .await
        .map_err(|e| ConnectionError::StreamError(format!("failed to send SASL auth: {e}")))?;

    loop {
        match stream.next().await {
            Some(Ok(Packet::Stanza(stanza))) => {
                if let Ok(challenge) = Challenge::try_from(stanza.clone()) {
                    let response_data = mechanism.response(&challenge.data).map_err(|e| {
                        ConnectionError::AuthenticationFailed(format!(
                            "SASL challenge-response failed: {e:?}"
                        ))
                    })?;

                    stream
                        .send_stanza(Response {
                            data: response_data,
                        })
                        .await
                        .map_err(|e| {
                            ConnectionError::StreamError(format!(
                                "failed to send SASL response: {e}"
                            ))
                        })?;
                } else if let Ok(success) = Success::try_from(stanza.clone()) {
                    if let Err(e) = mechanism.success(&success.data) {
                        warn!(error = ?e, "server signature verification failed");
                        return Err(ConnectionError::AuthenticationFailed(format!(
                            "server signature verification failed: {e:?}"
                        )));
                    }

                    debug!("SASL authentication succeeded");
                    let stream = restart_and_bind(stream).await?;
                    return Ok(stream.into_inner());
                } else if let Ok(failure) = Failure::try_from(stanza) {
                    debug!(condition = ?failure.defined_condition, "SASL authentication failed");
                    return Err(map_failure(&failure));
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                return Err(ConnectionError::StreamError(format!(
                    "stream error during SASL negotiation: {e}"
                )));
            }
            None => {
                return Err(ConnectionError::TransportError(
                    "connection closed during SASL negotiation".to_string(),
                ));
            }
        }
    }
}
