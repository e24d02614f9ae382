//! Sender-side reliability and congestion control.
//!
//! The agent chunks the message, keeps a window of in-flight chunks and
//! drives the whole protocol; the receiver only ever reacts. Each
//! transmission gets its own worker task that performs the DNS round trip
//! and pushes the outcome into a queue; the driver consumes outcomes in
//! arrival order, so duplicate-ACK counting sees the network's ordering
//! faithfully. The window follows TCP Reno: slow start, congestion
//! avoidance, fast retransmit on the third duplicate ACK, fast recovery,
//! and a collapse to one chunk on timeout.

use crate::carrier::{Carrier, DnsCarrier};
use crate::cipher::Cipher;
use crate::codec::{decode_ack, LabelCodec, RESET_ACK, RESET_SEQ};
use crate::config::{TunnelConfig, MAX_CHUNKS};
use crate::error::{Result, TunnelError};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const INITIAL_CWND: f64 = 2.0;
const INITIAL_SSTHRESH: f64 = 8.0;
const DUP_ACK_THRESHOLD: u32 = 3;

/// Idle sleep between driver iterations, so an empty queue never busy-loops.
const PACING_INTERVAL: Duration = Duration::from_millis(10);

/// TCP-Reno-style window arithmetic, kept apart from the I/O so the growth
/// and collapse rules are testable on their own.
#[derive(Debug)]
pub struct CongestionController {
    cwnd: f64,
    ssthresh: f64,
    dup_ack_count: u32,
    in_fast_recovery: bool,
}

impl Default for CongestionController {
    fn default() -> Self {
        Self::new()
    }
}

impl CongestionController {
    pub fn new() -> Self {
        Self {
            cwnd: INITIAL_CWND,
            ssthresh: INITIAL_SSTHRESH,
            dup_ack_count: 0,
            in_fast_recovery: false,
        }
    }

    /// Admission budget in whole chunks.
    pub fn window(&self) -> u32 {
        (self.cwnd.floor() as u32).max(1)
    }

    pub fn cwnd(&self) -> f64 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> f64 {
        self.ssthresh
    }

    pub fn in_fast_recovery(&self) -> bool {
        self.in_fast_recovery
    }

    /// A new cumulative ACK arrived: leave fast recovery if it was active,
    /// otherwise grow the window (exponentially below `ssthresh`, by
    /// `1/cwnd` per ACK above it).
    pub fn on_new_ack(&mut self) {
        self.dup_ack_count = 0;
        if self.in_fast_recovery {
            self.cwnd = self.ssthresh;
            self.in_fast_recovery = false;
        } else if self.cwnd < self.ssthresh {
            self.cwnd += 1.0;
        } else {
            self.cwnd += 1.0 / self.cwnd;
        }
    }

    /// A duplicate ACK for the current base. Returns true exactly when this
    /// is the third consecutive duplicate and the caller must fast-retransmit
    /// the base chunk.
    pub fn on_duplicate_ack(&mut self) -> bool {
        if self.in_fast_recovery {
            // Window inflation: another duplicate means another chunk left
            // the network.
            self.cwnd += 1.0;
            return false;
        }
        self.dup_ack_count += 1;
        if self.dup_ack_count < DUP_ACK_THRESHOLD {
            return false;
        }
        self.ssthresh = (self.cwnd / 2.0).floor().max(2.0);
        self.cwnd = self.ssthresh + f64::from(DUP_ACK_THRESHOLD);
        self.in_fast_recovery = true;
        true
    }

    /// Retransmission timeout: collapse to one chunk and restart slow start.
    pub fn on_timeout(&mut self) {
        self.ssthresh = (self.cwnd / 2.0).floor().max(2.0);
        self.cwnd = 1.0;
        self.in_fast_recovery = false;
        self.dup_ack_count = 0;
    }
}

/// Bookkeeping for one unacknowledged chunk.
#[derive(Debug)]
struct InFlight {
    send_time: Instant,
    retransmits: u32,
}

/// What a worker task reports back for one transmission attempt.
#[derive(Debug)]
struct QueryOutcome {
    seq: u32,
    /// `retransmits` value of the transmission this outcome belongs to;
    /// outcomes from superseded transmissions are ignored.
    attempt: u32,
    result: Result<Ipv4Addr>,
}

/// Transfer statistics reported on success.
#[derive(Debug, Default, Clone)]
pub struct SendReport {
    pub chunks: u32,
    pub retransmissions: u32,
    pub timeouts: u32,
    pub fast_retransmits: u32,
    pub duplicate_acks: u32,
    pub elapsed: Duration,
}

/// Sends one message through the tunnel, then reports.
pub struct Sender {
    carrier: Arc<dyn Carrier>,
    cipher: Cipher,
    codec: LabelCodec,
    chunks: Vec<Vec<u8>>,
    timeout: Duration,
    max_retx: u32,

    base: u32,
    next_seq: u32,
    last_ack: i64,
    cc: CongestionController,
    in_flight: HashMap<u32, InFlight>,

    outcome_tx: mpsc::UnboundedSender<QueryOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<QueryOutcome>,
    report: SendReport,
}

impl Sender {
    /// Build a sender over an arbitrary carrier. `config` must already
    /// validate; the message additionally has to fit the 16-bit sequence
    /// space.
    pub fn new(config: &TunnelConfig, carrier: Arc<dyn Carrier>, message: &[u8]) -> Result<Self> {
        config.validate()?;
        let chunks = split_message(message, config.chunk_size)?;
        let key = config.key_bytes()?;
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        Ok(Self {
            carrier,
            cipher: Cipher::new(&key),
            codec: LabelCodec::new(&config.domain),
            chunks,
            timeout: config.timeout(),
            max_retx: config.max_retries,
            base: 0,
            next_seq: 0,
            last_ack: -1,
            cc: CongestionController::new(),
            in_flight: HashMap::new(),
            outcome_tx,
            outcome_rx,
            report: SendReport::default(),
        })
    }

    /// Convenience constructor wiring up the real TCP DNS carrier.
    pub fn from_config(config: &TunnelConfig, message: &[u8]) -> Result<Self> {
        let carrier = Arc::new(DnsCarrier::new(config.server_addr, config.timeout()));
        Self::new(config, carrier, message)
    }

    /// Run the transfer to completion.
    pub async fn run(mut self) -> Result<SendReport> {
        let started = Instant::now();
        self.reset_handshake().await?;

        let total = self.chunks.len() as u32;
        info!(
            "sending {} chunks of at most {} bytes each",
            total,
            self.chunks.first().map_or(0, Vec::len)
        );

        while self.base < total {
            self.admit()?;
            self.scan_timeouts()?;

            // Wait for the next outcome, but never longer than one pacing
            // interval, so the timeout scan keeps running during silence.
            let polled = tokio::time::timeout(PACING_INTERVAL, self.outcome_rx.recv()).await;
            if let Ok(Some(outcome)) = polled {
                self.process_outcome(outcome)?;
                while let Ok(outcome) = self.outcome_rx.try_recv() {
                    self.process_outcome(outcome)?;
                }
            }
        }

        self.report.chunks = total;
        self.report.elapsed = started.elapsed();
        info!(
            "transfer complete: {} chunks, {} retransmissions, {:.2?}",
            total, self.report.retransmissions, self.report.elapsed
        );
        Ok(self.report)
    }

    /// Clear any previous session on the server. Without the `1.2.0.0`
    /// answer there is no peer worth sending to.
    async fn reset_handshake(&self) -> Result<()> {
        let qname = self.codec.encode(RESET_SEQ, &[])?;

        for attempt in 1..=self.max_retx {
            match self.carrier.query(&qname).await {
                Ok(answer) if answer == RESET_ACK => {
                    info!("reset acknowledged, session is clean");
                    return Ok(());
                }
                Ok(answer) => warn!("reset attempt {}: unexpected answer {}", attempt, answer),
                Err(err) => warn!("reset attempt {}: {}", attempt, err),
            }
        }
        Err(TunnelError::NoPeer)
    }

    /// Admit new chunks while the window has room.
    fn admit(&mut self) -> Result<()> {
        let total = self.chunks.len() as u32;
        while self.next_seq < self.base + self.cc.window() && self.next_seq < total {
            let seq = self.next_seq;
            self.in_flight.insert(
                seq,
                InFlight {
                    send_time: Instant::now(),
                    retransmits: 0,
                },
            );
            self.transmit(seq, 0)?;
            self.next_seq += 1;
        }
        Ok(())
    }

    /// Seal and ship one transmission on its own worker task.
    fn transmit(&self, seq: u32, attempt: u32) -> Result<()> {
        let packet = self.cipher.seal(&self.chunks[seq as usize])?;
        let qname = self.codec.encode(i64::from(seq), &packet)?;
        debug!("chunk {} transmission {} ({} octets)", seq, attempt + 1, qname.len());

        let carrier = Arc::clone(&self.carrier);
        let outcome_tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let result = carrier.query(&qname).await;
            // The driver may have finished; a closed queue is fine.
            let _ = outcome_tx.send(QueryOutcome {
                seq,
                attempt,
                result,
            });
        });
        Ok(())
    }

    /// Backstop for chunks whose answer never produced an outcome in time:
    /// anything older than the per-query timeout is treated as lost.
    fn scan_timeouts(&mut self) -> Result<()> {
        let now = Instant::now();
        let overdue: Vec<u32> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.send_time) >= self.timeout)
            .map(|(&seq, _)| seq)
            .collect();

        for seq in overdue {
            warn!("chunk {} timed out, collapsing window", seq);
            self.report.timeouts += 1;
            self.cc.on_timeout();
            self.retransmit(seq)?;
        }
        Ok(())
    }

    fn process_outcome(&mut self, outcome: QueryOutcome) -> Result<()> {
        match outcome.result {
            Ok(answer) => match decode_ack(answer) {
                Some(ack) => self.handle_ack(u32::from(ack)),
                None => {
                    warn!(
                        "chunk {}: answer {} is not an ACK, ignoring",
                        outcome.seq, answer
                    );
                    Ok(())
                }
            },
            Err(err) => self.handle_loss(outcome.seq, outcome.attempt, err),
        }
    }

    /// Apply one cumulative ACK in the order it came off the network.
    fn handle_ack(&mut self, ack: u32) -> Result<()> {
        if ack > self.base {
            // New cumulative ACK: everything below it leaves the window.
            self.in_flight.retain(|&seq, _| seq >= ack);
            self.base = ack;
            self.last_ack = i64::from(ack);
            self.cc.on_new_ack();
            debug!(
                "ack {} (cwnd {:.2}, ssthresh {}, in flight {})",
                ack,
                self.cc.cwnd(),
                self.cc.ssthresh(),
                self.in_flight.len()
            );
        } else if ack == self.base && i64::from(ack) == self.last_ack {
            self.report.duplicate_acks += 1;
            debug!("duplicate ack {}", ack);
            if self.cc.on_duplicate_ack() {
                info!(
                    "fast retransmit of chunk {} after {} duplicate acks",
                    self.base, DUP_ACK_THRESHOLD
                );
                self.report.fast_retransmits += 1;
                self.retransmit(self.base)?;
            }
        } else if i64::from(ack) >= self.last_ack {
            // First sighting of this value; remember it, nothing else moves.
            self.last_ack = i64::from(ack);
        }
        // Anything older than base is stale and ignored outright.
        Ok(())
    }

    /// A transmission failed (carrier timeout or network error). Both feed
    /// the congestion controller through the same path as silent loss.
    fn handle_loss(&mut self, seq: u32, attempt: u32, err: TunnelError) -> Result<()> {
        let Some(entry) = self.in_flight.get(&seq) else {
            // Acknowledged while the failure was in flight; nothing to do.
            debug!("late failure for acked chunk {}: {}", seq, err);
            return Ok(());
        };
        if entry.retransmits != attempt {
            debug!("stale failure for chunk {} attempt {}", seq, attempt);
            return Ok(());
        }

        warn!("chunk {} lost ({}), collapsing window", seq, err);
        self.report.timeouts += 1;
        self.cc.on_timeout();
        self.retransmit(seq)
    }

    /// Retransmit one chunk, enforcing the per-chunk budget.
    fn retransmit(&mut self, seq: u32) -> Result<()> {
        let max_retx = self.max_retx;
        let attempt = {
            let Some(entry) = self.in_flight.get_mut(&seq) else {
                return Ok(());
            };
            if entry.retransmits + 1 > max_retx {
                return Err(TunnelError::PermanentLoss { seq });
            }
            entry.retransmits += 1;
            entry.send_time = Instant::now();
            entry.retransmits
        };
        self.report.retransmissions += 1;
        self.transmit(seq, attempt)
    }
}

/// Cut the message into chunks of at most `chunk_size` bytes.
fn split_message(message: &[u8], chunk_size: usize) -> Result<Vec<Vec<u8>>> {
    let chunks: Vec<Vec<u8>> = message.chunks(chunk_size).map(<[u8]>::to_vec).collect();
    if chunks.len() > MAX_CHUNKS {
        return Err(TunnelError::Config(format!(
            "message needs {} chunks, the ACK encoding caps a transfer at {}",
            chunks.len(),
            MAX_CHUNKS
        )));
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_message_respects_chunk_size() {
        let chunks = split_message(&[7u8; 95], 30).unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].len(), 30);
        assert_eq!(chunks[3].len(), 5);
    }

    #[test]
    fn split_message_enforces_sequence_ceiling() {
        let message = vec![0u8; MAX_CHUNKS + 1];
        assert!(matches!(
            split_message(&message, 1),
            Err(TunnelError::Config(_))
        ));
        assert!(split_message(&message, 2).is_ok());
    }

    #[test]
    fn empty_message_has_no_chunks() {
        assert!(split_message(&[], 30).unwrap().is_empty());
    }

    #[test]
    fn slow_start_grows_exponentially_until_ssthresh() {
        let mut cc = CongestionController::new();
        assert_eq!(cc.cwnd(), 2.0);

        // One increment per ACK doubles the window each round trip.
        for expected in [3.0, 4.0, 5.0, 6.0, 7.0, 8.0] {
            cc.on_new_ack();
            assert_eq!(cc.cwnd(), expected);
        }

        // At ssthresh growth turns additive: +1/cwnd per ACK.
        cc.on_new_ack();
        assert!((cc.cwnd() - 8.125).abs() < 1e-9);
        cc.on_new_ack();
        assert!(cc.cwnd() < 8.26);
    }

    #[test]
    fn timeout_collapses_the_window() {
        let mut cc = CongestionController::new();
        for _ in 0..6 {
            cc.on_new_ack();
        }
        assert_eq!(cc.cwnd(), 8.0);

        cc.on_timeout();
        assert_eq!(cc.cwnd(), 1.0);
        assert_eq!(cc.ssthresh(), 4.0);
        assert!(!cc.in_fast_recovery());
        assert_eq!(cc.window(), 1);
    }

    #[test]
    fn timeout_ssthresh_never_drops_below_two() {
        let mut cc = CongestionController::new();
        cc.on_timeout();
        assert_eq!(cc.ssthresh(), 2.0);
        cc.on_timeout();
        assert_eq!(cc.ssthresh(), 2.0);
    }

    #[test]
    fn third_duplicate_ack_triggers_fast_retransmit_exactly_once() {
        let mut cc = CongestionController::new();
        for _ in 0..4 {
            cc.on_new_ack();
        }
        assert_eq!(cc.cwnd(), 6.0);

        assert!(!cc.on_duplicate_ack());
        assert!(!cc.on_duplicate_ack());
        assert!(cc.on_duplicate_ack());

        assert!(cc.in_fast_recovery());
        assert_eq!(cc.ssthresh(), 3.0);
        assert_eq!(cc.cwnd(), 6.0); // ssthresh + 3

        // Further duplicates only inflate the window.
        assert!(!cc.on_duplicate_ack());
        assert_eq!(cc.cwnd(), 7.0);
    }

    #[test]
    fn new_ack_deflates_the_window_and_exits_recovery() {
        let mut cc = CongestionController::new();
        for _ in 0..4 {
            cc.on_new_ack();
        }
        for _ in 0..3 {
            cc.on_duplicate_ack();
        }
        assert!(cc.in_fast_recovery());

        cc.on_new_ack();
        assert!(!cc.in_fast_recovery());
        assert_eq!(cc.cwnd(), cc.ssthresh());
    }

    #[test]
    fn window_never_reports_zero() {
        let mut cc = CongestionController::new();
        cc.on_timeout();
        assert_eq!(cc.window(), 1);
    }
}
