//! dnsdrop: covert message transport over DNS
//!
//! dnsdrop carries an arbitrary byte message from an agent to a server by
//! hiding it inside ordinary-looking DNS traffic: each chunk is sealed with
//! AES-256-GCM, Base32-coded into the QNAME of an A query, and acknowledged
//! through the IPv4 literal in the A answer. Delivery is reliable and
//! in-order over a lossy path: cumulative ACKs, retransmission on timeout,
//! fast retransmit on duplicate ACKs, and a TCP-Reno-style congestion window
//! pace the transfer.
//!
//! ## Quick Start
//!
//! ### As a Library
//!
//! ```rust,no_run
//! use dnsdrop::{Sender, TunnelConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = TunnelConfig::default();
//!     config.key = "0123456789abcdef".repeat(4);
//!
//!     let sender = Sender::from_config(&config, b"meet at the usual place")?;
//!     let report = sender.run().await?;
//!     println!("delivered {} chunks", report.chunks);
//!     Ok(())
//! }
//! ```
//!
//! ### As a Command-Line Tool
//!
//! ```bash
//! # Receiver: run until interrupted, then print the reassembled message
//! dnsdrop serve --bind 127.0.0.1:5354 --key $KEY
//!
//! # Agent: send a file (or stdin) through the tunnel
//! dnsdrop send --server 127.0.0.1:5354 --key $KEY message.txt
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  message ──▶ Sender ──▶ Cipher ──▶ LabelCodec ──▶ DnsCarrier ─┐
//!                ▲                                              │ TCP DNS
//!                └──────────── ACK in A rdata ◀─────────────────┤
//!                                                               ▼
//!              TunnelServer ◀── Cipher ◀── LabelCodec ◀── TunnelListener
//!                    │
//!                    └──▶ reassembled message on shutdown
//! ```

pub mod carrier;
pub mod cipher;
pub mod codec;
pub mod config;
pub mod dns;
pub mod error;
pub mod reassembly;
pub mod receiver;
pub mod sender;

// Re-export core types
pub use carrier::{Carrier, DnsCarrier, TunnelListener};
pub use cipher::{Cipher, Packet};
pub use codec::LabelCodec;
pub use config::TunnelConfig;
pub use error::{Result, TunnelError};
pub use reassembly::TransferReport;
pub use receiver::{SessionStats, TunnelServer};
pub use sender::{CongestionController, SendReport, Sender};
