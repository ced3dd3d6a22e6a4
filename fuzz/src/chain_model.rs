//! Segmentation and reassembly without a transport.
//!
//! Each payload is checked against the send limit, segmented into a chain of
//! dataroom-sized descriptors exactly as `send` does, and fed through a
//! `Reassembler`. The packets that come out must be the payloads that went
//! in.

use memif::{tx, ConnectionState, PacketSink, Reassembler, StateError, TxDescriptor, MAX_SEGMENTS};

/// Smallest dataroom the harness uses.
pub const MIN_DATAROOM: u32 = 1;
/// Largest dataroom the harness uses.
pub const MAX_DATAROOM: u32 = 4096;

fn chain(segments: usize, dataroom: u32) -> Vec<TxDescriptor> {
    (0..segments)
        .map(|_| TxDescriptor::new(vec![0u8; dataroom as usize].into_boxed_slice()))
        .collect()
}

fn payload(seq: usize, len: usize) -> Vec<u8> {
    (0..len).map(|j| (seq.wrapping_mul(31) + j) as u8).collect()
}

/// Segment and reassemble each length in turn.
pub fn execute_and_verify(dataroom: u32, lens: &[u16]) -> Result<(), String> {
    let limit = MAX_SEGMENTS * dataroom as usize;
    let mut sent = Vec::new();
    let mut received = Vec::new();

    {
        let mut reassembler = Reassembler::new(limit, |p: &[u8]| received.push(p.to_vec()));

        for (seq, &len) in lens.iter().enumerate() {
            let len = usize::from(len);
            let segments = match tx::check(ConnectionState::Up, len, dataroom) {
                Ok(n) => usize::from(n),
                Err(StateError::PacketTooLarge { max, .. }) => {
                    if len < limit {
                        return Err(format!("op {}: {} bytes rejected below limit {}", seq, len, limit));
                    }
                    if max != limit.saturating_sub(1) {
                        return Err(format!("op {}: reported max {} for limit {}", seq, max, limit));
                    }
                    continue;
                }
                Err(e) => return Err(format!("op {}: unexpected rejection: {}", seq, e)),
            };

            // INVARIANT: a packet occupies ceil(len / dataroom) slots, at least one
            if len >= limit {
                return Err(format!("op {}: {} bytes accepted at limit {}", seq, len, limit));
            }
            let expected = len.div_ceil(dataroom as usize).max(1);
            if segments != expected || segments > MAX_SEGMENTS {
                return Err(format!(
                    "op {}: {} bytes -> {} segments, expected {}",
                    seq, len, segments, expected
                ));
            }

            let data = payload(seq, len);

            // INVARIANT: a chain one slot short is refused
            if segments > 1 && tx::fill_chain(&mut chain(segments - 1, dataroom), &data).is_ok() {
                return Err(format!("op {}: short chain accepted", seq));
            }

            let mut descs = chain(segments, dataroom);
            tx::fill_chain(&mut descs, &data).map_err(|e| format!("op {}: fill failed: {}", seq, e))?;

            // INVARIANT: only the last descriptor ends the packet; all others are full
            let last = descs.len() - 1;
            for (k, d) in descs.iter().enumerate() {
                if d.has_more() != (k < last) {
                    return Err(format!("op {}: segment {} has more={}", seq, k, d.has_more()));
                }
                if k < last && d.len() != dataroom as usize {
                    return Err(format!("op {}: inner segment {} holds {} bytes", seq, k, d.len()));
                }
            }

            for d in &descs {
                reassembler.deliver(d.data(), d.has_more());
            }
            if reassembler.pending_len() != 0 {
                return Err(format!("op {}: reassembler left {} bytes pending", seq, reassembler.pending_len()));
            }
            sent.push(data);
        }
    }

    // INVARIANT: concatenated segments reproduce each payload, in order
    if received != sent {
        return Err(format!(
            "reassembled {} packets, sent {}",
            received.len(),
            sent.len()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundaries() {
        let lens = [0, 1, 2047, 2048, 2049, 3000, 5000, 16383, 16384, 20000];
        execute_and_verify(2048, &lens).unwrap();
    }

    #[test]
    fn test_tiny_dataroom() {
        let lens: Vec<u16> = (0..12).collect();
        execute_and_verify(MIN_DATAROOM, &lens).unwrap();
    }

    #[test]
    fn test_odd_dataroom() {
        let lens: Vec<u16> = (0..2000).step_by(37).collect();
        execute_and_verify(200, &lens).unwrap();
    }

    #[test]
    fn test_zero_dataroom_rejects_every_length() {
        execute_and_verify(0, &[0, 1, 2048, u16::MAX]).unwrap();
    }

    #[test]
    fn test_large_dataroom() {
        execute_and_verify(MAX_DATAROOM, &[u16::MAX, 0, 32767, 32768]).unwrap();
    }
}
