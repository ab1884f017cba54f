//! Append guard: the only place the store checks that a pulse extends the chain.

use super::ChainError;
use crate::types::Pulse;

/// Check that `pulse` may follow `last`, the most recently stored pulse.
///
/// A pulse on the same chain must take the next index and anchor the last
/// output value. A pulse on a higher chain must open that chain with index 0
/// and sentinel anchors. Appending to an older chain is rejected.
pub fn assert_next_in_chain(last: Option<&Pulse>, pulse: &Pulse) -> Result<(), ChainError> {
    if pulse.skip_list_anchors.len() != pulse.skip_list_num_layers as usize {
        return Err(ChainError::Continuity(format!(
            "pulse {} carries {} anchors for {} layers",
            pulse.pulse_index,
            pulse.skip_list_anchors.len(),
            pulse.skip_list_num_layers
        )));
    }

    let Some(last) = last else {
        return expect_chain_start(pulse);
    };

    if pulse.chain_index > last.chain_index {
        return expect_chain_start(pulse);
    }
    if pulse.chain_index < last.chain_index {
        return Err(ChainError::Continuity(format!(
            "chain {} is closed, latest chain is {}",
            pulse.chain_index, last.chain_index
        )));
    }

    if pulse.pulse_index != last.pulse_index + 1 {
        return Err(ChainError::Continuity(format!(
            "expected pulse {} on chain {}, got {}",
            last.pulse_index + 1,
            last.chain_index,
            pulse.pulse_index
        )));
    }
    if pulse.skip_list_anchors.first() != Some(&last.output_value) {
        return Err(ChainError::Continuity(format!(
            "pulse {} does not anchor the output value of pulse {}",
            pulse.pulse_index, last.pulse_index
        )));
    }
    Ok(())
}

fn expect_chain_start(pulse: &Pulse) -> Result<(), ChainError> {
    if pulse.pulse_index != 0 {
        return Err(ChainError::Continuity(format!(
            "chain {} must start at pulse 0, got {}",
            pulse.chain_index, pulse.pulse_index
        )));
    }
    if !pulse.skip_list_anchors.iter().all(|a| a.is_zero()) {
        return Err(ChainError::Continuity(format!(
            "first pulse of chain {} must carry zero anchors",
            pulse.chain_index
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::PulseChainBuilder;
    use crate::crypto::KeypairSigner;
    use crate::skiplist::SkipLayers;
    use crate::types::{parse_timestamp, ByteHash};

    async fn chain(signer: &KeypairSigner, chain_index: u64, len: usize) -> Vec<Pulse> {
        let b = PulseChainBuilder::new("u", "2.0", 1_000, SkipLayers::new(3, 3).unwrap());
        let now = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        let mut out: Vec<Pulse> = Vec::new();
        for i in 0..len {
            let value = ByteHash::new(vec![i as u8; 64]);
            let mut p = b.init(signer, chain_index, value, out.last(), now).unwrap();
            let next = ByteHash::new(vec![i as u8 + 1; 64]);
            b.finalize(signer, &mut p, out.last(), &next).await.unwrap();
            out.push(p);
        }
        out
    }

    #[tokio::test]
    async fn test_accepts_consecutive_pulses() {
        let signer = KeypairSigner::generate();
        let pulses = chain(&signer, 0, 5).await;

        assert!(assert_next_in_chain(None, &pulses[0]).is_ok());
        for pair in pulses.windows(2) {
            assert!(assert_next_in_chain(Some(&pair[0]), &pair[1]).is_ok());
        }
    }

    #[tokio::test]
    async fn test_rejects_tampered_anchor() {
        let signer = KeypairSigner::generate();
        let pulses = chain(&signer, 0, 2).await;

        let mut forged = pulses[1].clone();
        forged.skip_list_anchors[0] = ByteHash::new(vec![0xee; 64]);
        assert!(matches!(
            assert_next_in_chain(Some(&pulses[0]), &forged),
            Err(ChainError::Continuity(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_duplicate_and_skipped_index() {
        let signer = KeypairSigner::generate();
        let pulses = chain(&signer, 0, 3).await;

        // same pulse twice
        assert!(assert_next_in_chain(Some(&pulses[1]), &pulses[1]).is_err());
        // pulse 2 directly after pulse 0
        assert!(assert_next_in_chain(Some(&pulses[0]), &pulses[2]).is_err());
        // nonzero index into an empty store
        assert!(assert_next_in_chain(None, &pulses[1]).is_err());
    }

    #[tokio::test]
    async fn test_new_chain_after_old_one() {
        let signer = KeypairSigner::generate();
        let old = chain(&signer, 0, 3).await;
        let new = chain(&signer, 1, 2).await;

        assert!(assert_next_in_chain(old.last(), &new[0]).is_ok());
        // a higher chain must start at 0
        assert!(assert_next_in_chain(old.last(), &new[1]).is_err());
        // never back to an older chain
        assert!(assert_next_in_chain(new.first(), &old[1]).is_err());
    }

    #[tokio::test]
    async fn test_rejects_wrong_anchor_count() {
        let signer = KeypairSigner::generate();
        let pulses = chain(&signer, 0, 2).await;

        let mut short = pulses[1].clone();
        short.skip_list_anchors.pop();
        assert!(assert_next_in_chain(Some(&pulses[0]), &short).is_err());
    }
}
