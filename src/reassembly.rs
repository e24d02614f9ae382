//! Message reassembly at shutdown.

use std::collections::HashMap;

/// Outcome of reassembling the receiver's stored chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    /// Stored plaintexts concatenated in ascending sequence order.
    pub message: Vec<u8>,
    /// Sequence numbers that were received, sorted.
    pub received: Vec<u32>,
    /// Gaps below the highest received sequence, sorted.
    pub missing: Vec<u32>,
}

impl TransferReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Concatenate stored chunks in sequence order and report any gaps.
/// Never waits for missing chunks; it renders whatever is there.
pub fn assemble(chunks: &HashMap<u32, Vec<u8>>) -> TransferReport {
    let mut received: Vec<u32> = chunks.keys().copied().collect();
    received.sort_unstable();

    let mut message = Vec::new();
    for seq in &received {
        message.extend_from_slice(&chunks[seq]);
    }

    let missing = match received.last() {
        Some(&highest) => (0..highest)
            .filter(|seq| !chunks.contains_key(seq))
            .collect(),
        None => Vec::new(),
    };

    TransferReport {
        message,
        received,
        missing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_map(entries: &[(u32, &[u8])]) -> HashMap<u32, Vec<u8>> {
        entries
            .iter()
            .map(|(seq, data)| (*seq, data.to_vec()))
            .collect()
    }

    #[test]
    fn complete_message_reassembles_in_order() {
        let chunks = chunk_map(&[(2, b"sea."), (0, b"all "), (1, b"at ")]);
        let report = assemble(&chunks);

        assert_eq!(report.message, b"all at sea.");
        assert_eq!(report.received, vec![0, 1, 2]);
        assert!(report.is_complete());
    }

    #[test]
    fn gaps_are_reported_sorted() {
        let chunks = chunk_map(&[(0, b"a"), (3, b"d"), (5, b"f")]);
        let report = assemble(&chunks);

        assert_eq!(report.message, b"adf");
        assert_eq!(report.received, vec![0, 3, 5]);
        assert_eq!(report.missing, vec![1, 2, 4]);
        assert!(!report.is_complete());
    }

    #[test]
    fn empty_session_is_trivially_complete() {
        let report = assemble(&HashMap::new());
        assert!(report.message.is_empty());
        assert!(report.received.is_empty());
        assert!(report.is_complete());
    }
}
