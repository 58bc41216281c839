//! Codec for raw 80-byte Bitcoin block headers.

use bitcoin::block::Header;
use bitcoin::consensus;
use bitcoin::BlockHash;

use crate::error::RelayError;

/// Wire size of a serialized block header.
pub const HEADER_SIZE: usize = 80;

/// Decode a single 80-byte header.
pub fn decode_header(bytes: &[u8]) -> Result<Header, RelayError> {
    if bytes.len() != HEADER_SIZE {
        return Err(RelayError::MalformedHeader {
            expected: HEADER_SIZE,
            got: bytes.len(),
        });
    }
    consensus::deserialize(bytes).map_err(|_| RelayError::MalformedHeader {
        expected: HEADER_SIZE,
        got: bytes.len(),
    })
}

/// Decode a concatenated run of 80-byte headers.
///
/// Fails on an empty batch or a length that is not a multiple of 80.
pub fn decode_header_batch(bytes: &[u8]) -> Result<Vec<Header>, RelayError> {
    if bytes.is_empty() || bytes.len() % HEADER_SIZE != 0 {
        return Err(RelayError::MalformedHeader {
            expected: HEADER_SIZE,
            got: bytes.len() % HEADER_SIZE,
        });
    }
    bytes.chunks(HEADER_SIZE).map(decode_header).collect()
}

/// Double-SHA256 hash of the serialized header.
pub fn header_hash(header: &Header) -> BlockHash {
    header.block_hash()
}

/// Serialize a header back to its 80-byte wire form.
pub fn encode_header(header: &Header) -> Vec<u8> {
    consensus::serialize(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex::FromHex;

    // Bitcoin mainnet block 125552, a classic reference header.
    const BLOCK_125552: &str = "0100000081cd02ab7e569e8bcd9317e2fe99f2de44d49ab2b8851ba4a308000000000000e320b6c2fffc8d750423db8b1eb942ae710e951ed797f7affc8892b0f1fc122bc7f5d74df2b9441a42a14695";

    #[test]
    fn decodes_known_mainnet_header() {
        let bytes = Vec::from_hex(BLOCK_125552).unwrap();
        let header = decode_header(&bytes).unwrap();
        assert_eq!(header.time, 1305998791);
        assert_eq!(header.bits.to_consensus(), 0x1a44b9f2);
        assert_eq!(header.nonce, 2504433986);
        assert_eq!(
            header_hash(&header).to_string(),
            "00000000000000001e8d6829a8a21adc5d38d0a473b144b6765798e61f98bd1d"
        );
        assert_eq!(encode_header(&header), bytes);
    }

    #[test]
    fn rejects_wrong_length() {
        let err = decode_header(&[0u8; 79]).unwrap_err();
        assert!(matches!(err, RelayError::MalformedHeader { got: 79, .. }));
    }

    #[test]
    fn rejects_ragged_batch() {
        let bytes = Vec::from_hex(BLOCK_125552).unwrap();
        let mut batch = bytes.clone();
        batch.extend_from_slice(&bytes[..40]);
        assert!(decode_header_batch(&batch).is_err());
        assert!(decode_header_batch(&[]).is_err());
        assert_eq!(decode_header_batch(&bytes).unwrap().len(), 1);
    }
}
