//! In-band file transfer.
//!
//! Files travel inside the stream as base64 iq chunks: an open stanza
//! negotiates the block size, data stanzas carry sequential chunks and a
//! close stanza ends the stream. Every stanza is awaited before the next
//! one leaves, so chunks arrive strictly ordered.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;
use xmpp_parsers::iq::IqType;

use alumchat_core::bare_jid;
use alumchat_core::config::TransferConfig;
use alumchat_xmpp::{builders, Session, SessionError, SessionEvent, Stanza};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer rejected by the receiver")]
    Rejected,

    #[error("transfer aborted: {0}")]
    Aborted(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// A fully received in-band stream.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingFile {
    pub from: String,
    pub sid: String,
    pub bytes: Vec<u8>,
}

struct IncomingStream {
    from: String,
    next_seq: u16,
    bytes: Vec<u8>,
}

pub struct TransferEngine {
    session: Session,
    config: TransferConfig,
    incoming: Mutex<HashMap<String, IncomingStream>>,
    completed: Mutex<Vec<IncomingFile>>,
}

impl TransferEngine {
    pub fn new(session: Session, config: TransferConfig) -> Self {
        Self {
            session,
            config,
            incoming: Mutex::new(HashMap::new()),
            completed: Mutex::new(Vec::new()),
        }
    }

    /// Streams a file to a contact: the open handshake, an announcement
    /// message once the receiver accepts, one awaited chunk per block,
    /// then the close.
    pub async fn send_file(
        &self,
        to: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<(), TransferError> {
        let to = self.normalize(to);
        let sid = Uuid::new_v4().to_string();
        let block_size = self.config.block_size.max(1);

        let reply = self
            .session
            .request(builders::ibb_open(&to, &sid, block_size)?)
            .await?;
        if is_error_reply(&reply) {
            return Err(TransferError::Rejected);
        }

        // Announce only after the open is accepted, so a rejected stream
        // never leaves the receiver waiting for a file.
        self.session
            .send(builders::chat_message(
                &to,
                &format!("File sent: {file_name}"),
            )?)
            .await?;

        for (seq, chunk) in bytes.chunks(usize::from(block_size)).enumerate() {
            let seq = u16::try_from(seq)
                .map_err(|_| TransferError::Aborted("file exceeds the sequence space".to_string()))?;
            let reply = self
                .session
                .request(builders::ibb_data(&to, &sid, seq, chunk.to_vec())?)
                .await?;
            if is_error_reply(&reply) {
                return Err(TransferError::Aborted(format!(
                    "receiver refused chunk {seq}"
                )));
            }
        }

        let reply = self.session.request(builders::ibb_close(&to, &sid)?).await?;
        if is_error_reply(&reply) {
            return Err(TransferError::Aborted("receiver refused the close".to_string()));
        }

        debug!(%to, %sid, size = bytes.len(), "file sent");
        Ok(())
    }

    /// Handles the receiving half of an in-band stream. Each stanza is
    /// acknowledged back to the sender; a chunk out of sequence kills the
    /// stream.
    pub async fn observe(&self, event: &SessionEvent) {
        match event {
            SessionEvent::TransferOpened {
                from,
                iq_id,
                sid,
                block_size,
            } => {
                debug!(%from, %sid, block_size, "incoming transfer opened");
                self.lock_incoming().insert(
                    sid.clone(),
                    IncomingStream {
                        from: from.clone(),
                        next_seq: 0,
                        bytes: Vec::new(),
                    },
                );
                self.ack(from, iq_id).await;
            }
            SessionEvent::TransferChunk {
                from,
                iq_id,
                sid,
                seq,
                data,
            } => {
                let accepted = {
                    let mut incoming = self.lock_incoming();
                    match incoming.get_mut(sid) {
                        Some(stream) if stream.next_seq == *seq => {
                            stream.bytes.extend_from_slice(data);
                            stream.next_seq = stream.next_seq.wrapping_add(1);
                            true
                        }
                        Some(stream) => {
                            warn!(
                                %sid,
                                expected = stream.next_seq,
                                got = seq,
                                "chunk out of sequence, dropping stream"
                            );
                            incoming.remove(sid);
                            false
                        }
                        None => {
                            warn!(%sid, "chunk for an unknown stream");
                            false
                        }
                    }
                };
                if accepted {
                    self.ack(from, iq_id).await;
                }
            }
            SessionEvent::TransferClosed { from, iq_id, sid } => {
                let finished = self.lock_incoming().remove(sid);
                if let Some(stream) = finished {
                    debug!(%sid, size = stream.bytes.len(), "incoming transfer complete");
                    self.lock_completed().push(IncomingFile {
                        from: stream.from,
                        sid: sid.clone(),
                        bytes: stream.bytes,
                    });
                }
                self.ack(from, iq_id).await;
            }
            _ => {}
        }
    }

    /// Drains the finished incoming transfers.
    pub fn take_completed(&self) -> Vec<IncomingFile> {
        std::mem::take(&mut *self.lock_completed())
    }

    async fn ack(&self, to: &str, iq_id: &str) {
        let ack = match builders::iq_ack(to, iq_id) {
            Ok(ack) => ack,
            Err(error) => {
                warn!(%to, %error, "cannot build transfer ack");
                return;
            }
        };
        if let Err(error) = self.session.send(ack).await {
            warn!(%to, %error, "transfer ack not delivered");
        }
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

    fn lock_incoming(&self) -> std::sync::MutexGuard<'_, HashMap<String, IncomingStream>> {
        self.incoming
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_completed(&self) -> std::sync::MutexGuard<'_, Vec<IncomingFile>> {
        self.completed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn is_error_reply(reply: &Stanza) -> bool {
    matches!(reply, Stanza::Iq(iq) if matches!(iq.payload, IqType::Error(_)))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use xmpp_parsers::ibb::{Close, Data, Open};
    use xmpp_parsers::iq::Iq;

    use alumchat_test_support::{iq_error, session_fixture};

    use super::*;

    fn config() -> TransferConfig {
        TransferConfig { block_size: 4096 }
    }

    fn iq_set_payload(iq: &Iq) -> xmpp_parsers::minidom::Element {
        match &iq.payload {
            IqType::Set(payload) => payload.clone(),
            other => panic!("expected iq set, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ten_kilobytes_split_into_three_ordered_chunks() {
        let (session, mut wire) = session_fixture();
        let engine = TransferEngine::new(session, config());

        let responder = tokio::spawn(async move {
            let open_iq = wire.ack_next_iq().await;
            let open = Open::try_from(iq_set_payload(&open_iq)).unwrap();
            assert_eq!(open.block_size, 4096);
            let sid = open.sid.0;

            // Announcement follows the accepted open.
            let Stanza::Message(announce) = wire.next_sent().await else {
                panic!("expected the announcement message");
            };
            assert_eq!(
                announce.bodies.get("").map(|body| body.0.as_str()),
                Some("File sent: report.pdf")
            );

            let mut sizes = Vec::new();
            for expected_seq in 0..3u16 {
                let data_iq = wire.ack_next_iq().await;
                let data = Data::try_from(iq_set_payload(&data_iq)).unwrap();
                assert_eq!(data.seq, expected_seq);
                assert_eq!(data.sid.0, sid);
                sizes.push(data.data.len());
            }
            assert_eq!(sizes, vec![4096, 4096, 1808]);

            let close_iq = wire.ack_next_iq().await;
            let close = Close::try_from(iq_set_payload(&close_iq)).unwrap();
            assert_eq!(close.sid.0, sid);

            wire
        });

        let payload = vec![7_u8; 10_000];
        engine
            .send_file("bob@alumchat.xyz", "report.pdf", &payload)
            .await
            .unwrap();

        let mut wire = responder.await.unwrap();
        wire.sent.close();
        assert!(wire.sent.try_recv().is_err(), "no frames beyond the close");
    }

    #[tokio::test]
    async fn rejected_open_stops_the_transfer() {
        let (session, mut wire) = session_fixture();
        let engine = TransferEngine::new(session, config());

        let responder = tokio::spawn(async move {
            let open_iq = wire.next_sent_iq().await;
            wire.push_xml(&iq_error(&open_iq.id, "not-acceptable")).await;
            wire
        });

        let error = engine
            .send_file("bob@alumchat.xyz", "report.pdf", &[0_u8; 64])
            .await
            .unwrap_err();
        assert_matches!(error, TransferError::Rejected);

        // The open is the only frame: the receiver declined, so no
        // announcement message and no data chunks ever go out.
        let mut wire = responder.await.unwrap();
        wire.sent.close();
        assert!(
            wire.sent.try_recv().is_err(),
            "no announcement or chunks after a rejected open"
        );
    }

    #[tokio::test]
    async fn empty_payload_sends_open_and_close_only() {
        let (session, mut wire) = session_fixture();
        let engine = TransferEngine::new(session, config());

        let responder = tokio::spawn(async move {
            let open_iq = wire.ack_next_iq().await;
            assert!(Open::try_from(iq_set_payload(&open_iq)).is_ok());
            let _announce = wire.next_sent().await;
            let close_iq = wire.ack_next_iq().await;
            assert!(Close::try_from(iq_set_payload(&close_iq)).is_ok());
            wire
        });

        engine
            .send_file("bob@alumchat.xyz", "empty.txt", &[])
            .await
            .unwrap();

        responder.await.unwrap();
    }

    #[tokio::test]
    async fn incoming_stream_is_acked_and_reassembled() {
        let (session, mut wire) = session_fixture();
        let engine = TransferEngine::new(session, config());

        let sid = "stream-1".to_string();
        let from = "bob@alumchat.xyz/phone".to_string();

        engine
            .observe(&SessionEvent::TransferOpened {
                from: from.clone(),
                iq_id: "o1".to_string(),
                sid: sid.clone(),
                block_size: 4096,
            })
            .await;
        engine
            .observe(&SessionEvent::TransferChunk {
                from: from.clone(),
                iq_id: "d1".to_string(),
                sid: sid.clone(),
                seq: 0,
                data: b"hello ".to_vec(),
            })
            .await;
        engine
            .observe(&SessionEvent::TransferChunk {
                from: from.clone(),
                iq_id: "d2".to_string(),
                sid: sid.clone(),
                seq: 1,
                data: b"world".to_vec(),
            })
            .await;
        engine
            .observe(&SessionEvent::TransferClosed {
                from: from.clone(),
                iq_id: "c1".to_string(),
                sid: sid.clone(),
            })
            .await;

        // One ack per stanza, addressed back with the original id.
        for expected_id in ["o1", "d1", "d2", "c1"] {
            let iq = wire.next_sent_iq().await;
            assert_eq!(iq.id, expected_id);
            assert_matches!(iq.payload, IqType::Result(None));
        }

        let completed = engine.take_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].from, from);
        assert_eq!(completed[0].bytes, b"hello world");
        assert!(engine.take_completed().is_empty());
    }

    #[tokio::test]
    async fn out_of_sequence_chunk_drops_the_stream() {
        let (session, _wire) = session_fixture();
        let engine = TransferEngine::new(session, config());

        engine
            .observe(&SessionEvent::TransferOpened {
                from: "bob@alumchat.xyz".to_string(),
                iq_id: "o1".to_string(),
                sid: "s".to_string(),
                block_size: 4096,
            })
            .await;
        engine
            .observe(&SessionEvent::TransferChunk {
                from: "bob@alumchat.xyz".to_string(),
                iq_id: "d1".to_string(),
                sid: "s".to_string(),
                seq: 5,
                data: b"late".to_vec(),
            })
            .await;
        engine
            .observe(&SessionEvent::TransferClosed {
                from: "bob@alumchat.xyz".to_string(),
                iq_id: "c1".to_string(),
                sid: "s".to_string(),
            })
            .await;

        assert!(engine.take_completed().is_empty());
    }
}
