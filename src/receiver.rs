//! Receiver-side reliability.
//!
//! The server holds one session: `expected_seq` plus the map of accepted
//! chunks. Each query is handled inside a single critical section that also
//! computes the ACK it answers with, so an ACK can never lag behind the state
//! it was derived from. The receiver keeps no timers and no per-sender
//! identity; liveness is entirely the sender's problem.

use crate::cipher::{Cipher, Packet};
use crate::codec::{encode_ack, LabelCodec, RESET_ACK, RESET_SEQ};
use crate::config::TunnelConfig;
use crate::error::Result;
use crate::reassembly::{assemble, TransferReport};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tokio::sync::Mutex;

/// Session state, mutated only under the server's lock.
#[derive(Debug, Default)]
struct ReceiverSession {
    expected_seq: u32,
    received_chunks: HashMap<u32, Vec<u8>>,
    stats: SessionStats,
}

/// Counters exposed for observability and the shutdown report.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub expected_seq: u32,
    pub accepted: u64,
    pub duplicates: u64,
    pub stale: u64,
    pub auth_failures: u64,
    pub format_errors: u64,
    pub resets: u64,
}

impl ReceiverSession {
    fn reset(&mut self) {
        self.received_chunks.clear();
        self.expected_seq = 0;
        self.stats.resets += 1;
    }

    fn accept(&mut self, seq: u32, plaintext: Vec<u8>) {
        self.received_chunks.insert(seq, plaintext);
        while self.received_chunks.contains_key(&self.expected_seq) {
            self.expected_seq += 1;
        }
        self.stats.accepted += 1;
    }

    fn ack(&self) -> Ipv4Addr {
        encode_ack(self.expected_seq as u16)
    }
}

/// The reliability endpoint behind the DNS listener.
pub struct TunnelServer {
    codec: LabelCodec,
    cipher: Cipher,
    session: Mutex<ReceiverSession>,
}

impl TunnelServer {
    pub fn new(config: &TunnelConfig) -> Result<Self> {
        let key = config.key_bytes()?;
        Ok(Self {
            codec: LabelCodec::new(&config.domain),
            cipher: Cipher::new(&key),
            session: Mutex::new(ReceiverSession::default()),
        })
    }

    pub fn codec(&self) -> &LabelCodec {
        &self.codec
    }

    /// Handle one tunnel query and produce the A-record answer for it.
    ///
    /// Always answers: malformed, stale, duplicate and corrupted chunks all
    /// get the current cumulative ACK, so from the sender's side a rejected
    /// chunk looks exactly like a lost one that was overtaken.
    pub async fn handle_query(&self, qname: &str) -> Ipv4Addr {
        let mut session = self.session.lock().await;

        let (seq, raw_packet) = match self.codec.decode(qname) {
            Ok(decoded) => decoded,
            Err(err) => {
                session.stats.format_errors += 1;
                warn!("discarding malformed query {:?}: {}", qname, err);
                return session.ack();
            }
        };

        if seq == RESET_SEQ {
            session.reset();
            info!("session reset, all chunks dropped");
            return RESET_ACK;
        }

        let seq = match u32::try_from(seq).ok().filter(|&s| s <= u32::from(u16::MAX)) {
            Some(seq) => seq,
            None => {
                session.stats.format_errors += 1;
                warn!("sequence {} outside the protocol range", seq);
                return session.ack();
            }
        };

        if seq < session.expected_seq {
            // Already absorbed into the cumulative ACK; not worth decrypting.
            session.stats.stale += 1;
            debug!("stale chunk {} (expected {})", seq, session.expected_seq);
            return session.ack();
        }

        let packet = match Packet::parse(&raw_packet) {
            Ok(packet) => packet,
            Err(err) => {
                session.stats.format_errors += 1;
                warn!("chunk {}: {}", seq, err);
                return session.ack();
            }
        };

        let plaintext = match self.cipher.open(&packet) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                session.stats.auth_failures += 1;
                warn!("chunk {} failed authentication, discarded", seq);
                return session.ack();
            }
        };

        if session.received_chunks.contains_key(&seq) {
            session.stats.duplicates += 1;
            debug!("duplicate chunk {} ignored", seq);
            return session.ack();
        }

        let len = plaintext.len();
        session.accept(seq, plaintext);
        info!(
            "accepted chunk {} ({} bytes), expecting {}",
            seq, len, session.expected_seq
        );
        session.ack()
    }

    /// Snapshot of the session counters.
    pub async fn stats(&self) -> SessionStats {
        let session = self.session.lock().await;
        let mut stats = session.stats.clone();
        stats.expected_seq = session.expected_seq;
        stats
    }

    /// Reassemble whatever has arrived so far.
    pub async fn report(&self) -> TransferReport {
        let session = self.session.lock().await;
        assemble(&session.received_chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::KEY_LEN;
    use crate::codec::decode_ack;

    const DOMAIN: &str = "tunnel.example.com";

    fn test_config() -> TunnelConfig {
        TunnelConfig {
            key: "00".repeat(KEY_LEN),
            domain: DOMAIN.to_string(),
            ..TunnelConfig::default()
        }
    }

    fn server() -> TunnelServer {
        TunnelServer::new(&test_config()).unwrap()
    }

    fn chunk_qname(server: &TunnelServer, seq: u32, plaintext: &[u8]) -> String {
        let packet = server.cipher.seal(plaintext).unwrap();
        server.codec.encode(i64::from(seq), &packet).unwrap()
    }

    async fn ack_of(server: &TunnelServer, qname: &str) -> u16 {
        decode_ack(server.handle_query(qname).await).unwrap()
    }

    #[tokio::test]
    async fn in_order_chunks_advance_the_ack() {
        let server = server();

        assert_eq!(ack_of(&server, &chunk_qname(&server, 0, b"one")).await, 1);
        assert_eq!(ack_of(&server, &chunk_qname(&server, 1, b"two")).await, 2);
        assert_eq!(ack_of(&server, &chunk_qname(&server, 2, b"three")).await, 3);

        let report = server.report().await;
        assert_eq!(report.message, b"onetwothree");
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn out_of_order_chunk_is_held_until_the_gap_fills() {
        let server = server();

        // Chunk 1 arrives first: stored, but the ACK stays at 0.
        assert_eq!(ack_of(&server, &chunk_qname(&server, 1, b"world")).await, 0);
        // Chunk 0 fills the gap and the ACK jumps past both.
        assert_eq!(ack_of(&server, &chunk_qname(&server, 0, b"hello ")).await, 2);

        assert_eq!(server.report().await.message, b"hello world");
    }

    #[tokio::test]
    async fn duplicates_never_regress_or_duplicate_bytes() {
        let server = server();

        // Chunk 1 sits above the gap; a replay of it is a duplicate and the
        // first-arrived plaintext wins.
        assert_eq!(ack_of(&server, &chunk_qname(&server, 1, b"world")).await, 0);
        assert_eq!(ack_of(&server, &chunk_qname(&server, 1, b"WORLD")).await, 0);
        assert_eq!(server.stats().await.duplicates, 1);

        // Chunk 0 fills the gap; replaying it afterwards is merely stale.
        let first = chunk_qname(&server, 0, b"hello ");
        assert_eq!(ack_of(&server, &first).await, 2);
        assert_eq!(ack_of(&server, &first).await, 2);

        let stats = server.stats().await;
        assert_eq!(stats.stale, 1);
        assert_eq!(stats.expected_seq, 2);
        assert_eq!(server.report().await.message, b"hello world");
    }

    #[tokio::test]
    async fn tampered_chunk_leaves_state_untouched() {
        let server = server();
        assert_eq!(ack_of(&server, &chunk_qname(&server, 0, b"good")).await, 1);

        let mut qname = chunk_qname(&server, 1, b"evil");
        // Swap one payload character for a different Base32 character.
        let payload_start = qname.find('.').unwrap() + 1;
        let replacement = if qname.as_bytes()[payload_start] == b'a' { "b" } else { "a" };
        qname.replace_range(payload_start..payload_start + 1, replacement);

        assert_eq!(ack_of(&server, &qname).await, 1);
        let stats = server.stats().await;
        assert_eq!(stats.auth_failures, 1);
        assert_eq!(stats.expected_seq, 1);
        assert_eq!(server.report().await.message, b"good");
    }

    #[tokio::test]
    async fn malformed_queries_answer_the_current_ack() {
        let server = server();
        assert_eq!(ack_of(&server, &chunk_qname(&server, 0, b"base")).await, 1);

        for qname in [
            format!("not-a-seq.aaaa.{}", DOMAIN),
            format!("seq0.11118888.{}", DOMAIN),
            // Valid Base32 but far too short to hold nonce and tag.
            format!("seq1.aaaa.{}", DOMAIN),
        ] {
            assert_eq!(ack_of(&server, &qname).await, 1, "qname {:?}", qname);
        }
        assert_eq!(server.stats().await.format_errors, 3);
    }

    #[tokio::test]
    async fn reset_is_idempotent() {
        let server = server();
        assert_eq!(ack_of(&server, &chunk_qname(&server, 0, b"stale data")).await, 1);

        let reset = server.codec.encode(RESET_SEQ, &[]).unwrap();
        assert_eq!(server.handle_query(&reset).await, RESET_ACK);
        assert_eq!(server.handle_query(&reset).await, RESET_ACK);

        let stats = server.stats().await;
        assert_eq!(stats.expected_seq, 0);
        assert_eq!(stats.resets, 2);
        assert!(server.report().await.received.is_empty());
    }

    #[tokio::test]
    async fn contiguous_prefix_invariant_holds_under_shuffled_arrival() {
        let server = server();

        for seq in [4u32, 1, 3, 0, 2] {
            let data = format!("chunk-{}", seq);
            server
                .handle_query(&chunk_qname(&server, seq, data.as_bytes()))
                .await;
        }

        // expected_seq is exactly one past the contiguous prefix from 0.
        let stats = server.stats().await;
        assert_eq!(stats.expected_seq, 5);
        let report = server.report().await;
        assert_eq!(report.received, vec![0, 1, 2, 3, 4]);
        assert_eq!(report.message, b"chunk-0chunk-1chunk-2chunk-3chunk-4");
    }
}
