//! Proof-of-work target arithmetic: compact-bits expansion, difficulty
//! retargeting and hash-vs-target comparison.
//!
//! All 256-bit math is done in [`BigUint`], the hash is interpreted as a
//! little-endian integer exactly as Bitcoin does for PoW comparison.

use bitcoin::block::Header;
use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use num_bigint::BigUint;
use num_traits::Zero;

use crate::error::RelayError;
use crate::header::header_hash;
use crate::params::NetworkParams;

/// Expand compact bits without any range check.
///
/// Returns `None` when the sign bit is set or the mantissa is zero, both of
/// which encode targets no hash can satisfy.
fn expand_compact(bits: u32) -> Option<BigUint> {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & 0x007f_ffff;
    if bits & 0x0080_0000 != 0 || mantissa == 0 {
        return None;
    }
    let target = if exponent <= 3 {
        BigUint::from(mantissa >> (8 * (3 - exponent)))
    } else {
        BigUint::from(mantissa) << (8 * (exponent - 3))
    };
    if target.is_zero() {
        return None;
    }
    Some(target)
}

/// Expand compact bits into a 256-bit target, bounded by the pow limit.
///
/// Any exponent is accepted (Bitcoin semantics); only targets above the
/// network's pow limit are rejected as a sanity bound.
pub fn expand_target(bits: u32, params: &NetworkParams) -> Result<BigUint, RelayError> {
    let target = expand_compact(bits).ok_or(RelayError::InvalidTarget(bits))?;
    let pow_limit =
        expand_compact(params.pow_limit_bits).ok_or(RelayError::InvalidTarget(params.pow_limit_bits))?;
    if target > pow_limit {
        return Err(RelayError::InvalidTarget(bits));
    }
    Ok(target)
}

/// Encode a target back to compact bits, with Bitcoin's rounding.
pub fn compact_from_target(target: &BigUint) -> u32 {
    let mut size = ((target.bits() + 7) / 8) as u32;
    let mut compact = if size <= 3 {
        let low: u32 = target.iter_u32_digits().next().unwrap_or(0);
        low << (8 * (3 - size))
    } else {
        let shifted = target >> (8 * (size - 3) as usize);
        shifted.iter_u32_digits().next().unwrap_or(0)
    };
    // Mantissa sign bit must stay clear; borrow one exponent step if set.
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

/// The header hash read as a 256-bit little-endian integer.
pub fn pow_value(hash: &BlockHash) -> BigUint {
    BigUint::from_bytes_le(&hash.to_byte_array())
}

/// Check that the header hash satisfies its own claimed target.
///
/// Whether the claimed `bits` are *correct* for the chain position is a
/// separate question answered only at retarget boundaries.
pub fn check_pow(header: &Header, params: &NetworkParams) -> Result<(), RelayError> {
    let target = expand_target(header.bits.to_consensus(), params)?;
    let hash = header_hash(header);
    if pow_value(&hash) <= target {
        Ok(())
    } else {
        Err(RelayError::InvalidPoW(hash))
    }
}

/// Compute the expected compact bits for the epoch starting after
/// `old_period_end`, from the wall-clock time the previous epoch took.
///
/// The elapsed time is clamped to `[timespan/4, timespan*4]` and the result
/// is capped at the pow limit, matching Bitcoin's retarget rule. Returns the
/// compact encoding, which carries Bitcoin's rounding loss.
pub fn next_epoch_bits(
    old_period_start: &Header,
    old_period_end: &Header,
    params: &NetworkParams,
) -> Result<u32, RelayError> {
    let timespan = params.target_timespan_secs as i64;
    let elapsed = (old_period_end.time as i64 - old_period_start.time as i64)
        .clamp(timespan / 4, timespan * 4) as u64;

    let old_target = expand_target(old_period_end.bits.to_consensus(), params)?;
    let mut new_target = old_target * BigUint::from(elapsed) / BigUint::from(timespan as u64);

    let pow_limit = expand_compact(params.pow_limit_bits)
        .ok_or(RelayError::InvalidTarget(params.pow_limit_bits))?;
    if new_target > pow_limit {
        new_target = pow_limit;
    }
    Ok(compact_from_target(&new_target))
}

/// Validate the first header of a new epoch against the retarget formula.
pub fn validate_retarget(
    old_period_start: &Header,
    old_period_end: &Header,
    first_of_new_period: &Header,
    new_period_height: u64,
    params: &NetworkParams,
) -> Result<u32, RelayError> {
    let expected = next_epoch_bits(old_period_start, old_period_end, params)?;
    let got = first_of_new_period.bits.to_consensus();
    if got != expected {
        return Err(RelayError::RetargetMismatch {
            height: new_period_height,
            expected,
            got,
        });
    }
    Ok(expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::block::Version;
    use bitcoin::{CompactTarget, TxMerkleNode};
    use bitcoin::hashes::Hash;

    fn mainnet() -> NetworkParams {
        NetworkParams::mainnet()
    }

    fn header_with(bits: u32, time: u32) -> Header {
        Header {
            version: Version::from_consensus(2),
            prev_blockhash: BlockHash::all_zeros(),
            merkle_root: TxMerkleNode::all_zeros(),
            time,
            bits: CompactTarget::from_consensus(bits),
            nonce: 0,
        }
    }

    #[test]
    fn expands_difficulty_one() {
        let target = expand_target(0x1d00ffff, &mainnet()).unwrap();
        assert_eq!(target, BigUint::from(0xffffu32) << 208);
        assert_eq!(compact_from_target(&target), 0x1d00ffff);
    }

    #[test]
    fn compact_round_trips_with_rounding() {
        // Mainnet block 125552 difficulty.
        let target = expand_target(0x1a44b9f2, &mainnet()).unwrap();
        assert_eq!(compact_from_target(&target), 0x1a44b9f2);
        // A small exponent: value fits in the mantissa directly.
        let small = BigUint::from(0x1234u32);
        assert_eq!(compact_from_target(&small), 0x02123400);
    }

    #[test]
    fn rejects_sign_bit_zero_mantissa_and_overflow() {
        assert!(expand_target(0x1d800000, &mainnet()).is_err());
        assert!(expand_target(0x1d000000, &mainnet()).is_err());
        // Exponent pushing the target above the pow limit.
        assert!(expand_target(0x2100ffff, &mainnet()).is_err());
    }

    #[test]
    fn retarget_tracks_elapsed_time() {
        let params = mainnet();
        let start = header_with(0x1d00ffff, 1_000_000);
        // Exactly half the expected timespan: difficulty doubles.
        let end = header_with(
            0x1d00ffff,
            1_000_000 + (params.target_timespan_secs / 2) as u32,
        );
        let bits = next_epoch_bits(&start, &end, &params).unwrap();
        let new_target = expand_target(bits, &params).unwrap();
        let old_target = expand_target(0x1d00ffff, &params).unwrap();
        assert_eq!(new_target, old_target / BigUint::from(2u32));
    }

    #[test]
    fn retarget_clamps_at_quarter_and_quadruple() {
        let params = NetworkParams::low_difficulty(8);
        // Target well below the pow limit so the 4x clamp is observable.
        let bits = 0x1f00ffff;
        let start = header_with(bits, 1_000_000);

        // Absurdly slow epoch: clamped to 4x the target (easier).
        let slow_end = header_with(bits, 1_000_000 + params.target_timespan_secs as u32 * 100);
        let slow = expand_target(next_epoch_bits(&start, &slow_end, &params).unwrap(), &params).unwrap();
        let old = expand_target(bits, &params).unwrap();
        assert_eq!(slow, old.clone() * BigUint::from(4u32));

        // Instant epoch: clamped to 1/4 of the target (harder).
        let fast_end = header_with(bits, 1_000_000);
        let fast = expand_target(next_epoch_bits(&start, &fast_end, &params).unwrap(), &params).unwrap();
        assert_eq!(fast, old / BigUint::from(4u32));
    }

    #[test]
    fn retarget_caps_at_pow_limit() {
        let params = mainnet();
        let start = header_with(0x1d00ffff, 1_000_000);
        let end = header_with(0x1d00ffff, 1_000_000 + params.target_timespan_secs as u32 * 100);
        let bits = next_epoch_bits(&start, &end, &params).unwrap();
        assert_eq!(bits, params.pow_limit_bits);
    }

    #[test]
    fn validate_retarget_flags_mismatch() {
        let params = mainnet();
        let start = header_with(0x1d00ffff, 1_000_000);
        let end = header_with(0x1d00ffff, 1_000_000 + params.target_timespan_secs as u32);
        // Unchanged timespan: bits must stay the same.
        let good = header_with(0x1d00ffff, 0);
        assert!(validate_retarget(&start, &end, &good, 2016, &params).is_ok());
        let bad = header_with(0x1c7fffff, 0);
        let err = validate_retarget(&start, &end, &bad, 2016, &params).unwrap_err();
        assert!(matches!(err, RelayError::RetargetMismatch { height: 2016, .. }));
    }
}
