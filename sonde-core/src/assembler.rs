//! Frame assembly
//!
//! After lock the pipeline collects frame bits; this module packs them into
//! bytes with the family's bit order, undoes the RS41 XOR scrambling and
//! runs the per-family block codecs (DFM column interleaving, LMS6
//! convolutional coding) behind one seam.

use crate::bits::BIT_ERR;
use crate::catalog::BitOrder;
use crate::errors::FrameError;

/// Pack bits (0/1 values; [`BIT_ERR`] packs as 0) into bytes.
pub fn pack_bits(bits: &[u8], order: BitOrder) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            let mut byte = 0u8;
            for (i, &b) in chunk.iter().enumerate() {
                let b = (b == 1) as u8;
                match order {
                    BitOrder::LsbFirst => byte |= b << i,
                    BitOrder::MsbFirst => byte |= b << (7 - i),
                }
            }
            byte
        })
        .collect()
}

/// Unpack bytes into bits, inverse of [`pack_bits`].
pub fn unpack_bytes(bytes: &[u8], order: BitOrder) -> Vec<u8> {
    let mut bits = Vec::with_capacity(bytes.len() * 8);
    for &byte in bytes {
        for i in 0..8 {
            let bit = match order {
                BitOrder::LsbFirst => (byte >> i) & 1,
                BitOrder::MsbFirst => (byte >> (7 - i)) & 1,
            };
            bits.push(bit);
        }
    }
    bits
}

/// RS41 frame scrambling mask; generated by the LFSR
/// `m[16+i] = m[i] ^ m[i+2] ^ m[i+4] ^ m[i+6]` (mod 64).
pub const RS41_MASK: [u8; 64] = [
    0x96, 0x83, 0x3E, 0x51, 0xB1, 0x49, 0x08, 0x98, //
    0x32, 0x05, 0x59, 0x0E, 0xF9, 0x44, 0xC6, 0x26, //
    0x21, 0x60, 0xC2, 0xEA, 0x79, 0x5D, 0x6D, 0xA1, //
    0x54, 0x69, 0x47, 0x0C, 0xDC, 0xE8, 0x5C, 0xF1, //
    0xF7, 0x76, 0x82, 0x7F, 0x07, 0x99, 0xA2, 0x2C, //
    0x93, 0x7C, 0x30, 0x63, 0xF5, 0x10, 0x2E, 0x61, //
    0xD0, 0xBC, 0xB4, 0xB6, 0x06, 0xAA, 0xF4, 0x23, //
    0x78, 0x6E, 0x3B, 0xAE, 0xBF, 0x7B, 0x4C, 0xC1,
];

/// XOR the frame with the RS41 mask, byte position modulo 64. Applying the
/// function twice restores the input.
pub fn rs41_descramble(frame: &mut [u8]) {
    for (i, b) in frame.iter_mut().enumerate() {
        *b ^= RS41_MASK[i % RS41_MASK.len()];
    }
}

/// A block transform between raw channel bits and frame bits.
pub trait BitBlockCodec {
    /// Decode `raw` into `out`; returns the number of bits written.
    fn decode(&mut self, raw: &[u8], out: &mut [u8]) -> Result<usize, FrameError>;
}

/// DFM column-wise deinterleaver. The frame interleaves each block over
/// `columns` columns of 8 rows; deinterleaving gathers every `columns`-th
/// bit back into 8-bit codewords.
#[derive(Debug, Clone, Copy)]
pub struct DfmDeinterleaver {
    pub columns: usize,
}

impl DfmDeinterleaver {
    pub fn new(columns: usize) -> Self {
        debug_assert!(columns == 7 || columns == 13);
        Self { columns }
    }
}

impl BitBlockCodec for DfmDeinterleaver {
    fn decode(&mut self, raw: &[u8], out: &mut [u8]) -> Result<usize, FrameError> {
        let l = self.columns;
        let len = 8 * l;
        if raw.len() < len || out.len() < len {
            return Err(FrameError::EofMidFrame {
                bits_read: raw.len(),
            });
        }
        for j in 0..8 {
            for i in 0..l {
                out[8 * i + j] = raw[l * j + i] & 1;
            }
        }
        Ok(len)
    }
}

/// C34/C50 byte framing: each byte rides in a 12-bit group, a `1110`
/// marker followed by the 8 data bits (LSB first). Decoding strips the
/// markers and keeps the data bits of every group.
#[derive(Debug, Clone, Copy, Default)]
pub struct C34ByteExtract;

impl C34ByteExtract {
    pub fn new() -> Self {
        Self
    }
}

impl BitBlockCodec for C34ByteExtract {
    fn decode(&mut self, raw: &[u8], out: &mut [u8]) -> Result<usize, FrameError> {
        let groups = raw.len() / 12;
        if groups == 0 || out.len() < 8 * groups {
            return Err(FrameError::EofMidFrame {
                bits_read: raw.len(),
            });
        }
        for g in 0..groups {
            for i in 0..8 {
                out[8 * g + i] = raw[12 * g + 4 + i] & 1;
            }
        }
        Ok(8 * groups)
    }
}

/// LMS6 rate-1/2, K=8 convolutional code with generators 0xA9 and 0x44,
/// inverted feed-forward: the code is systematic enough that the next data
/// bit follows algebraically from the register and the received pair. Pair
/// mismatches are flagged, not corrected.
#[derive(Debug, Clone)]
pub struct Lms6Deconv {
    errors: usize,
}

/// Generator taps, MSB first.
const LMS6_POLY_A: [u8; 8] = [1, 0, 0, 1, 0, 1, 0, 1]; // 0xA9
const LMS6_POLY_B: [u8; 8] = [0, 0, 1, 0, 0, 0, 1, 0]; // 0x44
const LMS6_K: usize = 8;

impl Lms6Deconv {
    pub fn new() -> Self {
        Self { errors: 0 }
    }

    /// Unresolved pairs in the GPS-critical first 256 bits of the last
    /// decode.
    pub fn errors(&self) -> usize {
        self.errors
    }

    /// Encode data bits for loopback testing; emits one pair per input bit.
    pub fn encode(bits: &[u8]) -> Vec<u8> {
        let mut state = vec![0u8; LMS6_K - 1];
        state.extend(bits.iter().map(|&b| b & 1));
        let mut out = Vec::with_capacity(bits.len() * 2);
        for n in 0..bits.len() {
            let mut a = 0u8;
            let mut b = 0u8;
            for j in 0..LMS6_K {
                a ^= state[n + j] & LMS6_POLY_A[j];
                b ^= state[n + j] & LMS6_POLY_B[j];
            }
            out.push(a);
            out.push(b);
        }
        out
    }
}

impl Default for Lms6Deconv {
    fn default() -> Self {
        Self::new()
    }
}

impl BitBlockCodec for Lms6Deconv {
    fn decode(&mut self, raw: &[u8], out: &mut [u8]) -> Result<usize, FrameError> {
        self.errors = 0;
        let len = raw.len();
        if len < 2 * LMS6_K || out.len() < LMS6_K {
            return Err(FrameError::EofMidFrame { bits_read: len });
        }

        for b in out[..LMS6_K - 1].iter_mut() {
            *b = 0;
        }

        let mut n = 0usize;
        while 2 * n < len - 2 * LMS6_K && n + LMS6_K <= out.len() {
            let p0 = raw[2 * n] & 1;
            let p1 = raw[2 * n + 1] & 1;
            let mut bit_a = 0u8;
            let mut bit_b = 0u8;
            for j in 0..LMS6_K - 1 {
                bit_a ^= out[n + j] & LMS6_POLY_A[j];
                bit_b ^= out[n + j] & LMS6_POLY_B[j];
            }
            let a = bit_a ^ p0;
            let b = bit_b ^ p1;
            out[n + LMS6_K - 1] = if a == LMS6_POLY_A[LMS6_K - 1] && b == LMS6_POLY_B[LMS6_K - 1] {
                1
            } else if a == 0 && b == 0 {
                0
            } else {
                if n < 256 {
                    self.errors += 1;
                }
                // Best guess from the half of the pair that still fits.
                (a != LMS6_POLY_A[LMS6_K - 1] && b == LMS6_POLY_B[LMS6_K - 1]) as u8
            };
            n += 1;
        }

        Ok(n + LMS6_K - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_lsb_first() {
        // 0x31 = 0b00110001: bit 0 first.
        let bits = [1, 0, 0, 0, 1, 1, 0, 0];
        assert_eq!(pack_bits(&bits, BitOrder::LsbFirst), vec![0x31]);
        assert_eq!(pack_bits(&bits, BitOrder::MsbFirst), vec![0x8C]);
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let bytes = vec![0xDE, 0xAD, 0x00, 0xFF, 0x41];
        for order in [BitOrder::LsbFirst, BitOrder::MsbFirst] {
            let bits = unpack_bytes(&bytes, order);
            assert_eq!(pack_bits(&bits, order), bytes);
        }
    }

    #[test]
    fn error_bits_pack_as_zero() {
        let bits = [1, BIT_ERR, 0, 0, 0, 0, 0, 0];
        assert_eq!(pack_bits(&bits, BitOrder::LsbFirst), vec![0x01]);
    }

    #[test]
    fn mask_is_involution() {
        let original: Vec<u8> = (0..200u16).map(|i| (i * 31 % 256) as u8).collect();
        let mut frame = original.clone();
        rs41_descramble(&mut frame);
        assert_ne!(frame, original);
        rs41_descramble(&mut frame);
        assert_eq!(frame, original);
    }

    #[test]
    fn mask_reveals_rs41_header() {
        // The scrambled header bytes XOR the mask into the frame sync word.
        let scrambled = [0x86u8, 0x35, 0xF4, 0x40, 0x93, 0xDF, 0x1A, 0x60];
        let mut frame = scrambled;
        rs41_descramble(&mut frame);
        assert_eq!(frame, [0x10, 0xB6, 0xCA, 0x11, 0x22, 0x96, 0x12, 0xF8]);
    }

    fn interleave(block: &[u8], l: usize) -> Vec<u8> {
        // Inverse of the deinterleaver, row-major to column-major.
        let mut out = vec![0u8; 8 * l];
        for j in 0..8 {
            for i in 0..l {
                out[l * j + i] = block[8 * i + j];
            }
        }
        out
    }

    #[test]
    fn dfm_deinterleave_roundtrip() {
        for l in [7usize, 13] {
            let block: Vec<u8> = (0..8 * l).map(|i| ((i * 5 + 1) % 3 == 0) as u8).collect();
            let raw = interleave(&block, l);
            let mut out = vec![0u8; 8 * l];
            let mut codec = DfmDeinterleaver::new(l);
            assert_eq!(codec.decode(&raw, &mut out), Ok(8 * l));
            assert_eq!(out, block);
        }
    }

    #[test]
    fn dfm_deinterleave_rejects_short_input() {
        let mut codec = DfmDeinterleaver::new(7);
        let mut out = vec![0u8; 56];
        assert!(codec.decode(&[0u8; 20], &mut out).is_err());
    }

    #[test]
    fn c34_groups_strip_markers() {
        // Two groups: marker 1110, then 0x57 and 0xA2 LSB first.
        let mut raw = Vec::new();
        for byte in [0x57u8, 0xA2] {
            raw.extend_from_slice(&[1, 1, 1, 0]);
            for i in 0..8 {
                raw.push((byte >> i) & 1);
            }
        }
        let mut out = vec![0u8; 16];
        let mut codec = C34ByteExtract::new();
        assert_eq!(codec.decode(&raw, &mut out), Ok(16));
        assert_eq!(pack_bits(&out, BitOrder::LsbFirst), vec![0x57, 0xA2]);
    }

    #[test]
    fn c34_rejects_empty_input() {
        let mut codec = C34ByteExtract::new();
        let mut out = vec![0u8; 8];
        assert!(codec.decode(&[1, 1, 1, 0], &mut out).is_err());
    }

    #[test]
    fn lms6_deconv_inverts_encoder() {
        let bits: Vec<u8> = (0..120).map(|i| ((i * 7 + 2) % 5 < 2) as u8).collect();
        let raw = Lms6Deconv::encode(&bits);
        let mut out = vec![0u8; bits.len() + 2 * LMS6_K];
        let mut codec = Lms6Deconv::new();
        let written = codec.decode(&raw, &mut out).unwrap();
        assert_eq!(codec.errors(), 0);
        // The decoder stops one constraint length short of the tail.
        let decoded = &out[LMS6_K - 1..written];
        assert!(decoded.len() >= 100);
        assert_eq!(decoded, &bits[..decoded.len()]);
    }

    #[test]
    fn lms6_deconv_flags_corrupt_pairs() {
        let bits: Vec<u8> = (0..120).map(|i| (i % 3 == 0) as u8).collect();
        let mut raw = Lms6Deconv::encode(&bits);
        raw[40] ^= 1; // corrupt one half of a pair
        let mut out = vec![0u8; bits.len() + 2 * LMS6_K];
        let mut codec = Lms6Deconv::new();
        codec.decode(&raw, &mut out).unwrap();
        assert!(codec.errors() > 0);
    }
}
