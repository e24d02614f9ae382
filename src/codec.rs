//! QNAME label codec and ACK address mapping.
//!
//! Upstream, a sealed packet becomes `seq{N}.{frag1}.{frag2}….{domain}`: the
//! packet is Base32-encoded (RFC 4648, padding stripped, lowercase on the
//! wire) and cut into labels of at most 63 characters. Downstream, the
//! receiver's state rides in an A record: `1.2.A.B` carries the cumulative
//! ACK `A*256 + B`, and `1.2.0.0` acknowledges a reset.

use crate::error::{Result, TunnelError};
use base32::Alphabet;
use std::net::Ipv4Addr;

/// Maximum bytes per DNS label (RFC 1035).
pub const MAX_LABEL_LEN: usize = 63;

/// Maximum QNAME length in presentation form (255 octets on the wire).
pub const MAX_QNAME_LEN: usize = 253;

/// Longest sequence label the protocol can produce ("seq65535").
pub const SEQ_LABEL_MAX_LEN: usize = 8;

/// Sequence number of the reset control message.
pub const RESET_SEQ: i64 = -1;

/// Answer acknowledging a reset (and the cumulative ACK for sequence 0).
pub const RESET_ACK: Ipv4Addr = Ipv4Addr::new(1, 2, 0, 0);

const BASE32: Alphabet = Alphabet::RFC4648 { padding: false };
const BASE32_PADDED: Alphabet = Alphabet::RFC4648 { padding: true };

/// Encode a cumulative ACK into A-record rdata.
pub fn encode_ack(expected_seq: u16) -> Ipv4Addr {
    Ipv4Addr::new(1, 2, (expected_seq >> 8) as u8, (expected_seq & 0xff) as u8)
}

/// Decode A-record rdata back into an ACK value, if it carries one.
pub fn decode_ack(addr: Ipv4Addr) -> Option<u16> {
    let octets = addr.octets();
    if octets[0] != 1 || octets[1] != 2 {
        return None;
    }
    Some(u16::from(octets[2]) << 8 | u16::from(octets[3]))
}

/// Packs sealed packets into QNAMEs under a fixed base domain.
pub struct LabelCodec {
    domain: String,
}

impl LabelCodec {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.trim_end_matches('.').to_ascii_lowercase(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Whether a query name belongs to this tunnel.
    pub fn matches(&self, qname: &str) -> bool {
        let name = qname.trim_end_matches('.').to_ascii_lowercase();
        name == self.domain || name.ends_with(&format!(".{}", self.domain))
    }

    /// Compose the QNAME for one packet. The reset message (`seq = -1`) has
    /// an empty packet and yields `seq-1.{domain}`.
    ///
    /// A QNAME over the 255-octet budget means the chunk size was
    /// misconfigured; this refuses rather than truncating.
    pub fn encode(&self, seq: i64, packet: &[u8]) -> Result<String> {
        let encoded = base32::encode(BASE32, packet).to_ascii_lowercase();

        let mut qname = format!("seq{}", seq);
        for fragment in encoded.as_bytes().chunks(MAX_LABEL_LEN) {
            qname.push('.');
            // Base32 output is ASCII, fixed-width cuts cannot split a char.
            qname.push_str(std::str::from_utf8(fragment).expect("base32 output is ASCII"));
        }
        qname.push('.');
        qname.push_str(&self.domain);

        if qname.len() > MAX_QNAME_LEN {
            return Err(TunnelError::Config(format!(
                "QNAME for seq {} is {} octets, maximum is {}; lower chunk_size",
                seq,
                qname.len(),
                MAX_QNAME_LEN
            )));
        }
        Ok(qname)
    }

    /// Recover `(seq, packet)` from a query name. The packet comes back raw;
    /// splitting off nonce and tag is the cipher layer's business.
    pub fn decode(&self, qname: &str) -> Result<(i64, Vec<u8>)> {
        let name = qname.trim_end_matches('.').to_ascii_lowercase();
        let prefix = name
            .strip_suffix(&self.domain)
            .filter(|rest| rest.is_empty() || rest.ends_with('.'))
            .ok_or_else(|| TunnelError::Format(format!("{:?} is outside the tunnel domain", qname)))?
            .trim_end_matches('.');

        let mut labels = prefix.split('.');
        let seq_label = labels
            .next()
            .filter(|label| !label.is_empty())
            .ok_or_else(|| TunnelError::Format("missing sequence label".into()))?;
        let seq = parse_seq_label(seq_label)?;

        let body: String = labels.collect();
        let packet = decode_base32(&body)?;
        Ok((seq, packet))
    }
}

/// Parse a `seq-?\d+` label.
fn parse_seq_label(label: &str) -> Result<i64> {
    let digits = label
        .strip_prefix("seq")
        .ok_or_else(|| TunnelError::Format(format!("{:?} is not a sequence label", label)))?;
    let unsigned = digits.strip_prefix('-').unwrap_or(digits);
    if unsigned.is_empty() || !unsigned.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TunnelError::Format(format!(
            "{:?} is not a sequence number",
            digits
        )));
    }
    digits
        .parse()
        .map_err(|_| TunnelError::Format(format!("sequence number {:?} out of range", digits)))
}

/// Uppercase, restore `=` padding to a multiple of 8, then decode.
fn decode_base32(text: &str) -> Result<Vec<u8>> {
    let mut padded = text.to_ascii_uppercase();
    while padded.len() % 8 != 0 {
        padded.push('=');
    }
    base32::decode(BASE32_PADDED, &padded)
        .ok_or_else(|| TunnelError::Format("invalid Base32 payload".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = "tunnel.example.com";

    fn codec() -> LabelCodec {
        LabelCodec::new(DOMAIN)
    }

    #[test]
    fn encode_decode_round_trip() {
        let packet: Vec<u8> = (0u8..62).collect();
        let qname = codec().encode(7, &packet).unwrap();

        assert!(qname.starts_with("seq7."));
        assert!(qname.ends_with(DOMAIN));
        for label in qname.split('.') {
            assert!(label.len() <= MAX_LABEL_LEN, "label too long: {}", label);
        }

        let (seq, decoded) = codec().decode(&qname).unwrap();
        assert_eq!(seq, 7);
        assert_eq!(decoded, packet);
    }

    #[test]
    fn reset_qname_has_empty_body() {
        let qname = codec().encode(RESET_SEQ, &[]).unwrap();
        assert_eq!(qname, format!("seq-1.{}", DOMAIN));

        let (seq, packet) = codec().decode(&qname).unwrap();
        assert_eq!(seq, RESET_SEQ);
        assert!(packet.is_empty());
    }

    #[test]
    fn decode_is_case_insensitive() {
        let packet = b"The quick brown fox".to_vec();
        let qname = codec().encode(3, &packet).unwrap();
        let shouted = qname.to_ascii_uppercase();

        let (seq, decoded) = codec().decode(&shouted).unwrap();
        assert_eq!(seq, 3);
        assert_eq!(decoded, packet);
    }

    #[test]
    fn trailing_root_dot_is_accepted() {
        let qname = format!("{}.", codec().encode(0, b"dotted").unwrap());
        let (seq, decoded) = codec().decode(&qname).unwrap();
        assert_eq!(seq, 0);
        assert_eq!(decoded, b"dotted");
    }

    #[test]
    fn foreign_domain_is_rejected() {
        let other = LabelCodec::new("other.example.net");
        let qname = other.encode(0, b"hello").unwrap();
        assert!(codec().decode(&qname).is_err());
        assert!(!codec().matches(&qname));
    }

    #[test]
    fn malformed_sequence_labels_are_rejected() {
        for qname in [
            format!("nosuchprefix0.aaaa.{}", DOMAIN),
            format!("seq.aaaa.{}", DOMAIN),
            format!("seq+1.aaaa.{}", DOMAIN),
            format!("seqxyz.aaaa.{}", DOMAIN),
            DOMAIN.to_string(),
        ] {
            assert!(codec().decode(&qname).is_err(), "should reject {:?}", qname);
        }
    }

    #[test]
    fn invalid_base32_is_rejected() {
        let qname = format!("seq0.11118888.{}", DOMAIN);
        assert!(codec().decode(&qname).is_err());
    }

    #[test]
    fn oversized_packet_is_refused() {
        let packet = vec![0u8; 400];
        assert!(matches!(
            codec().encode(0, &packet),
            Err(TunnelError::Config(_))
        ));
    }

    #[test]
    fn ack_round_trip() {
        for value in [0u16, 1, 255, 256, 4097, u16::MAX] {
            let addr = encode_ack(value);
            assert_eq!(addr.octets()[0], 1);
            assert_eq!(addr.octets()[1], 2);
            assert_eq!(decode_ack(addr), Some(value));
        }
    }

    #[test]
    fn ack_literal_shapes() {
        assert_eq!(encode_ack(1), Ipv4Addr::new(1, 2, 0, 1));
        assert_eq!(encode_ack(5), Ipv4Addr::new(1, 2, 0, 5));
        assert_eq!(encode_ack(0), RESET_ACK);
        assert_eq!(encode_ack(770), Ipv4Addr::new(1, 2, 3, 2));
    }

    #[test]
    fn unrelated_addresses_are_not_acks() {
        assert_eq!(decode_ack(Ipv4Addr::new(127, 0, 0, 1)), None);
        assert_eq!(decode_ack(Ipv4Addr::new(1, 3, 0, 0)), None);
    }
}
