//! Symbol and bit recovery
//!
//! Three bit-clock variants cover the supported families: zero-crossing
//! run-length decoding for real audio, integrate-and-dump for demodulated
//! FM, and biphase/Manchester decoding on top of either. PN9 data
//! whitening (WXR-301D) lives here as well.

/// Marker for a bit the Manchester decoder could not resolve.
pub const BIT_ERR: u8 = 2;

/// Zero-crossing bit recovery: count samples between sign changes of the
/// audio; the run length in bits is `round(count / samples_per_bit)`.
#[derive(Debug, Clone)]
pub struct ZeroCrossing {
    samples_per_bit: f32,
    invert: bool,
    par: i8,
    run: u32,
}

impl ZeroCrossing {
    pub fn new(samples_per_bit: f32, invert: bool) -> Self {
        Self {
            samples_per_bit,
            invert,
            par: 1,
            run: 0,
        }
    }

    /// Feed one sample. On a sign change, returns the bit value of the
    /// finished run and its length in bits (0 when the run was shorter
    /// than half a bit).
    pub fn push(&mut self, s: f32) -> Option<(u8, u32)> {
        let par = if s >= 0.0 { 1 } else { -1 };
        if self.run > 0 && par != self.par {
            let len = (self.run as f32 / self.samples_per_bit + 0.5) as u32;
            // Sign below zero carries a one.
            let mut bit = ((1 - self.par) / 2) as u8;
            if self.invert {
                bit ^= 1;
            }
            self.par = par;
            self.run = 1;
            return Some((bit, len));
        }
        self.par = par;
        self.run += 1;
        None
    }
}

/// Integrate-and-dump bit clock: accumulate samples up to the advancing
/// bit boundary, emit the accumulator sign.
#[derive(Debug, Clone)]
pub struct BitClock {
    samples_per_bit: f32,
    boundary: f64,
    count: u64,
    acc: f32,
    invert: bool,
}

impl BitClock {
    pub fn new(samples_per_bit: f32, invert: bool) -> Self {
        Self {
            samples_per_bit,
            boundary: samples_per_bit as f64,
            count: 0,
            acc: 0.0,
            invert,
        }
    }

    /// Feed one sample; emits a bit each time the sample count crosses the
    /// bit boundary.
    pub fn push(&mut self, s: f32) -> Option<u8> {
        self.acc += s;
        self.count += 1;
        if (self.count as f64) < self.boundary {
            return None;
        }
        let mut bit = (self.acc >= 0.0) as u8;
        if self.invert {
            bit ^= 1;
        }
        self.boundary += self.samples_per_bit as f64;
        self.acc = 0.0;
        Some(bit)
    }
}

/// Mapping of a raw symbol pair to a data bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiphaseVariant {
    /// `10 -> 1`, `01 -> 0`.
    Manchester1,
    /// `10 -> 0`, `01 -> 1`.
    Manchester2,
}

/// Decode a raw bit string two symbols at a time. Pair mismatches use the
/// slip-recovery rule: the first mismatch is swallowed (one output dropped,
/// carry toggled), the second emits [`BIT_ERR`].
pub fn biphase_decode(raw: &[u8], variant: BiphaseVariant) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() / 2);
    let mut carry = false;
    for pair in raw.chunks_exact(2) {
        let bit = match (pair[0], pair[1]) {
            (0, 1) => Some(0),
            (1, 0) => Some(1),
            _ => None,
        };
        match bit {
            Some(b) => {
                let b = match variant {
                    BiphaseVariant::Manchester1 => b,
                    BiphaseVariant::Manchester2 => b ^ 1,
                };
                out.push(b);
            }
            None => {
                if !carry {
                    carry = true; // drop one output, stay aligned
                } else {
                    out.push(BIT_ERR);
                    carry = false;
                }
            }
        }
    }
    out
}

/// Re-encode data bits as symbol pairs (`1 -> 10`, `0 -> 01` for variant 1).
pub fn biphase_encode(bits: &[u8], variant: BiphaseVariant) -> Vec<u8> {
    let mut out = Vec::with_capacity(bits.len() * 2);
    for &b in bits {
        let b = match variant {
            BiphaseVariant::Manchester1 => b,
            BiphaseVariant::Manchester2 => b ^ 1,
        };
        if b == 1 {
            out.extend_from_slice(&[1, 0]);
        } else {
            out.extend_from_slice(&[0, 1]);
        }
    }
    out
}

/// NRZ-S style differential decode: output 1 when consecutive bits match.
/// `prev` seeds the comparison for the first bit.
pub fn nrzs_decode(bits: &[u8], prev: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(bits.len());
    let mut last = prev & 1;
    for &b in bits {
        out.push(1 ^ (last ^ (b & 1)));
        last = b & 1;
    }
    out
}

/// PN9 whitening table (polynomial x^9 + x^5 + 1, all-ones seed), as
/// applied to WXR-301D payloads.
pub const PN9: [u8; 64] = [
    0xFF, 0x87, 0xB8, 0x59, 0xB7, 0xA1, 0xCC, 0x24, //
    0x57, 0x5E, 0x4B, 0x9C, 0x0E, 0xE9, 0xEA, 0x50, //
    0x2A, 0xBE, 0xB4, 0x1B, 0xB6, 0xB0, 0x5D, 0xF1, //
    0xE6, 0x9A, 0xE3, 0x45, 0xFD, 0x2C, 0x53, 0x18, //
    0x0C, 0xCA, 0xC9, 0xFB, 0x49, 0x37, 0xE5, 0xA8, //
    0x51, 0x3B, 0x2F, 0x61, 0xAA, 0x72, 0x18, 0x84, //
    0x02, 0x23, 0x23, 0xAB, 0x63, 0x89, 0x51, 0xB3, //
    0xE7, 0x8B, 0x72, 0x90, 0x4C, 0xE8, 0xFB, 0xC1,
];

/// XOR the payload with the PN9 sequence, skipping the first `skip` bytes
/// (preamble and length prefix). Applying the function twice restores the
/// input.
pub fn pn9_apply(bytes: &mut [u8], skip: usize) {
    for (i, b) in bytes.iter_mut().enumerate().skip(skip) {
        *b ^= PN9[(i - skip) % PN9.len()];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_crossing_run_lengths() {
        // 4 samples per bit: 8 positive samples, then 4 negative, then flip.
        let mut zc = ZeroCrossing::new(4.0, false);
        let mut emitted = Vec::new();
        let samples: Vec<f32> = std::iter::repeat(1.0)
            .take(8)
            .chain(std::iter::repeat(-1.0).take(4))
            .chain(std::iter::repeat(1.0).take(4))
            .collect();
        for s in samples {
            if let Some(e) = zc.push(s) {
                emitted.push(e);
            }
        }
        // Positive level decodes as 0, negative as 1.
        assert_eq!(emitted, vec![(0, 2), (1, 1)]);
    }

    #[test]
    fn zero_crossing_inversion() {
        let mut zc = ZeroCrossing::new(2.0, true);
        let mut emitted = Vec::new();
        for s in [1.0f32, 1.0, -1.0, -1.0, 1.0] {
            if let Some(e) = zc.push(s) {
                emitted.push(e);
            }
        }
        assert_eq!(emitted, vec![(1, 1), (0, 1)]);
    }

    #[test]
    fn bit_clock_integrates_and_dumps() {
        let mut clock = BitClock::new(3.0, false);
        let samples = [0.5f32, 0.5, 0.5, -0.2, -0.4, -0.3, 0.1, 0.1, 0.2];
        let bits: Vec<u8> = samples.iter().filter_map(|&s| clock.push(s)).collect();
        assert_eq!(bits, vec![1, 0, 1]);
    }

    #[test]
    fn bit_clock_fractional_sps() {
        // 2.5 samples per bit: boundaries at 2.5, 5, 7.5, 10 -> bits after
        // samples 3, 5, 8, 10.
        let mut clock = BitClock::new(2.5, false);
        let mut count = 0;
        for _ in 0..10 {
            if clock.push(1.0).is_some() {
                count += 1;
            }
        }
        assert_eq!(count, 4);
    }

    #[test]
    fn biphase_roundtrip() {
        let bits = vec![1, 0, 0, 1, 1, 1, 0];
        for variant in [BiphaseVariant::Manchester1, BiphaseVariant::Manchester2] {
            let raw = biphase_encode(&bits, variant);
            assert_eq!(biphase_decode(&raw, variant), bits);
        }
    }

    #[test]
    fn biphase_variants_invert_each_other() {
        let raw = vec![1, 0, 0, 1];
        assert_eq!(biphase_decode(&raw, BiphaseVariant::Manchester1), vec![1, 0]);
        assert_eq!(biphase_decode(&raw, BiphaseVariant::Manchester2), vec![0, 1]);
    }

    #[test]
    fn biphase_slip_recovery() {
        // 11 is invalid: first occurrence swallowed, second emits an error.
        let raw = vec![1, 0, 1, 1, 0, 1, 1, 1, 1, 0];
        let out = biphase_decode(&raw, BiphaseVariant::Manchester1);
        assert_eq!(out, vec![1, 0, BIT_ERR, 1]);
    }

    #[test]
    fn nrzs_same_bits_give_one() {
        assert_eq!(nrzs_decode(&[0, 0, 1, 1, 0], 0), vec![1, 1, 0, 1, 0]);
    }

    #[test]
    fn pn9_double_application_is_identity() {
        let original: Vec<u8> = (0..200).map(|i| (i * 7 + 13) as u8).collect();
        let mut buf = original.clone();
        pn9_apply(&mut buf, 6);
        assert_ne!(buf[6..], original[6..]);
        assert_eq!(buf[..6], original[..6]);
        pn9_apply(&mut buf, 6);
        assert_eq!(buf, original);
    }

    #[test]
    fn pn9_skips_prefix() {
        let mut buf = vec![0u8; 10];
        pn9_apply(&mut buf, 8);
        assert_eq!(&buf[..8], &[0; 8]);
        assert_eq!(buf[8], PN9[0]);
        assert_eq!(buf[9], PN9[1]);
    }
}
