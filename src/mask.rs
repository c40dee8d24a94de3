//! WebSocket frame masking
//!
//! Client frames are XOR-masked with a 4-byte key (`payload[i] ^ key[i % 4]`).
//! The hot path widens the key to a machine word and processes eight bytes
//! per step; the scalar tail handles the remainder.

/// Apply a 4-byte XOR mask in place.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    apply_mask_offset(data, mask, 0);
}

/// Apply a 4-byte XOR mask in place, starting at `offset` within the frame
/// payload.
///
/// Used when a payload is consumed in chunks across several socket reads:
/// the mask index must continue from where the previous chunk stopped.
pub fn apply_mask_offset(data: &mut [u8], mask: [u8; 4], offset: usize) {
    let mut rotated = [0u8; 8];
    for (i, b) in rotated.iter_mut().enumerate() {
        *b = mask[(offset + i) & 3];
    }
    let word = u64::from_ne_bytes(rotated);

    let word_len = data.len() - (data.len() % 8);
    let (words, tail) = data.split_at_mut(word_len);

    for chunk in words.chunks_exact_mut(8) {
        let v = u64::from_ne_bytes(chunk.try_into().unwrap()) ^ word;
        chunk.copy_from_slice(&v.to_ne_bytes());
    }
    for (i, b) in tail.iter_mut().enumerate() {
        *b ^= mask[(offset + word_len + i) & 3];
    }
}

/// Generate a random masking key for a client frame.
#[inline]
pub fn generate_mask() -> [u8; 4] {
    rand::random()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_roundtrip() {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let original: Vec<u8> = (0u8..=255).collect();
        let mut data = original.clone();

        apply_mask(&mut data, mask);
        assert_ne!(data, original);
        apply_mask(&mut data, mask);
        assert_eq!(data, original);
    }

    #[test]
    fn mask_matches_scalar_reference() {
        let mask = [0x01, 0x02, 0x03, 0x04];
        for len in 0..64 {
            let original: Vec<u8> = (0..len as u8).collect();
            let mut fast = original.clone();
            apply_mask(&mut fast, mask);

            let reference: Vec<u8> = original
                .iter()
                .enumerate()
                .map(|(i, b)| b ^ mask[i & 3])
                .collect();
            assert_eq!(fast, reference, "len {}", len);
        }
    }

    #[test]
    fn offset_continues_mask_index() {
        let mask = [0xaa, 0xbb, 0xcc, 0xdd];
        let original: Vec<u8> = (0..61u8).collect();

        // Mask the whole payload in one go.
        let mut whole = original.clone();
        apply_mask(&mut whole, mask);

        // Mask the same payload in uneven chunks.
        let mut chunked = original.clone();
        let (a, rest) = chunked.split_at_mut(7);
        let (b, c) = rest.split_at_mut(22);
        apply_mask_offset(a, mask, 0);
        apply_mask_offset(b, mask, 7);
        apply_mask_offset(c, mask, 29);

        assert_eq!(whole, chunked);
    }

    #[test]
    fn empty_payload() {
        let mut data: [u8; 0] = [];
        apply_mask(&mut data, [1, 2, 3, 4]);
    }
}
