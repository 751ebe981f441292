//! Reed-Solomon (255, 255-R) over GF(2^8)
//!
//! The Vaisala frames use the ka9q code parameters: field polynomial 0x11D,
//! first consecutive root alpha^0, primitive step 1, R = 24 parity bytes.
//! RS41 frames interleave two codewords (even/odd message bytes); RS92 uses
//! a single codeword. Codewords are handled MSB-first: index 0 holds the
//! coefficient of x^254, so the message sits at the high-degree end and the
//! parity at the low-degree end, matching the reference byte packing.

use crate::errors::EccError;

/// Codeword length n = 2^8 - 1.
pub const RS_N: usize = 255;
/// Parity bytes for the Vaisala code.
pub const RS_R: usize = 24;
/// Message symbols k = n - R.
pub const RS_K: usize = RS_N - RS_R;

/// GF(2^8) arithmetic tables for a given field polynomial.
struct Gf256 {
    exp: [u8; 512],
    log: [u8; 256],
}

impl Gf256 {
    fn new(poly: u16) -> Self {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];
        let mut x: u16 = 1;
        for i in 0..255 {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= poly;
            }
        }
        // Duplicate so products of logs index without a mod.
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }
        Self { exp, log }
    }

    #[inline]
    fn mul(&self, a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            0
        } else {
            self.exp[self.log[a as usize] as usize + self.log[b as usize] as usize]
        }
    }

    #[inline]
    fn div(&self, a: u8, b: u8) -> u8 {
        debug_assert!(b != 0);
        if a == 0 {
            0
        } else {
            self.exp[self.log[a as usize] as usize + 255 - self.log[b as usize] as usize]
        }
    }

    #[inline]
    fn pow(&self, i: usize) -> u8 {
        self.exp[i % 255]
    }

    #[inline]
    fn inv(&self, a: u8) -> u8 {
        debug_assert!(a != 0);
        self.exp[255 - self.log[a as usize] as usize]
    }
}

/// One RS code instance; tables and generator polynomial built once.
pub struct ReedSolomon {
    gf: Gf256,
    nroots: usize,
    fcr: usize,
    /// Generator polynomial, MSB-first, length nroots + 1, leading 1.
    gen: Vec<u8>,
}

impl ReedSolomon {
    /// Build the code for field polynomial `poly` (0x11D for Vaisala),
    /// `nroots` parity symbols and first consecutive root `alpha^fcr`.
    pub fn new(poly: u16, nroots: usize, fcr: usize) -> Self {
        let gf = Gf256::new(poly);
        // g(x) = prod_{i=0}^{nroots-1} (x - alpha^(fcr+i))
        let mut gen = vec![1u8];
        for i in 0..nroots {
            let root = gf.pow(fcr + i);
            let mut next = vec![0u8; gen.len() + 1];
            for (j, &g) in gen.iter().enumerate() {
                next[j] ^= g;
                next[j + 1] ^= gf.mul(g, root);
            }
            gen = next;
        }
        Self {
            gf,
            nroots,
            fcr,
            gen,
        }
    }

    /// The Vaisala RS41/RS92 code.
    pub fn vaisala() -> Self {
        Self::new(0x11D, RS_R, 0)
    }

    /// Fill the parity positions of an MSB-first codeword from its message
    /// part. `cw[..n-nroots]` is the message, `cw[n-nroots..]` receives the
    /// remainder of m(x)*x^R divided by g(x).
    pub fn encode(&self, cw: &mut [u8; RS_N]) {
        let k = RS_N - self.nroots;
        let mut rem = vec![0u8; self.nroots];
        for &m in cw[..k].iter() {
            let factor = rem[0] ^ m;
            rem.rotate_left(1);
            rem[self.nroots - 1] = 0;
            if factor != 0 {
                for (r, &g) in rem.iter_mut().zip(self.gen[1..].iter()) {
                    *r ^= self.gf.mul(g, factor);
                }
            }
        }
        cw[k..].copy_from_slice(&rem);
    }

    /// Decode one codeword in place. Returns the number of corrected byte
    /// errors (0 if the syndromes are clean), or an error when more than
    /// R/2 positions are corrupt.
    pub fn decode(&self, cw: &mut [u8; RS_N]) -> Result<usize, EccError> {
        let gf = &self.gf;

        // Syndromes S_i = r(alpha^(fcr+i)), Horner over the MSB-first array.
        let mut synd = vec![0u8; self.nroots];
        let mut clean = true;
        for (i, s) in synd.iter_mut().enumerate() {
            let x = gf.pow(self.fcr + i);
            let mut acc = 0u8;
            for &c in cw.iter() {
                acc = gf.mul(acc, x) ^ c;
            }
            *s = acc;
            clean &= acc == 0;
        }
        if clean {
            return Ok(0);
        }

        // Berlekamp-Massey: sigma(x) with sigma_0 = 1, coefficients
        // ascending (sigma[j] is the coefficient of x^j).
        let mut sigma = vec![0u8; self.nroots + 1];
        let mut prev = vec![0u8; self.nroots + 1];
        sigma[0] = 1;
        prev[0] = 1;
        let mut l = 0usize; // current error count estimate
        let mut m = 1usize; // steps since last length change
        let mut b = 1u8; // last nonzero discrepancy

        for n in 0..self.nroots {
            let mut delta = synd[n];
            for j in 1..=l {
                delta ^= gf.mul(sigma[j], synd[n - j]);
            }
            if delta == 0 {
                m += 1;
            } else if 2 * l <= n {
                let tmp = sigma.clone();
                let scale = gf.div(delta, b);
                for j in 0..=self.nroots - m {
                    sigma[j + m] ^= gf.mul(scale, prev[j]);
                }
                prev = tmp;
                l = n + 1 - l;
                b = delta;
                m = 1;
            } else {
                let scale = gf.div(delta, b);
                for j in 0..=self.nroots - m {
                    sigma[j + m] ^= gf.mul(scale, prev[j]);
                }
                m += 1;
            }
        }

        if 2 * l > self.nroots {
            return Err(EccError::RsUncorrectable { codeword: 0 });
        }

        // Chien search: error at degree d when sigma(alpha^-d) = 0.
        let mut err_deg = Vec::with_capacity(l);
        for d in 0..RS_N {
            let x = gf.pow(255 - d % 255);
            let mut acc = 0u8;
            for j in (0..=l).rev() {
                acc = gf.mul(acc, x) ^ sigma[j];
            }
            if acc == 0 {
                err_deg.push(d);
            }
        }
        if err_deg.len() != l {
            return Err(EccError::RsUncorrectable { codeword: 0 });
        }

        // Forney: Omega(x) = S(x) * sigma(x) mod x^R, S ascending.
        let mut omega = vec![0u8; self.nroots];
        for (i, o) in omega.iter_mut().enumerate() {
            let mut acc = 0u8;
            for j in 0..=i.min(l) {
                acc ^= gf.mul(sigma[j], synd[i - j]);
            }
            *o = acc;
        }

        for &d in &err_deg {
            let x_inv = gf.pow(255 - d % 255); // X_k^-1 = alpha^-d
            // Omega(X^-1)
            let mut num = 0u8;
            for j in (0..self.nroots).rev() {
                num = gf.mul(num, x_inv) ^ omega[j];
            }
            // sigma'(X^-1): odd-degree terms only over GF(2).
            let mut den = 0u8;
            let mut j = 1;
            while j <= l {
                let mut term = sigma[j];
                for _ in 0..j - 1 {
                    term = gf.mul(term, x_inv);
                }
                den ^= term;
                j += 2;
            }
            if den == 0 {
                return Err(EccError::RsUncorrectable { codeword: 0 });
            }
            // e = X^(1-fcr) * Omega(X^-1) / sigma'(X^-1)
            let mut mag = gf.div(num, den);
            let shift = (1 + 255 - (self.fcr % 255)) % 255;
            let x_k = gf.pow(d);
            let mut x_pow = 1u8;
            for _ in 0..shift {
                x_pow = gf.mul(x_pow, x_k);
            }
            mag = gf.mul(mag, x_pow);
            cw[RS_N - 1 - d] ^= mag;
        }

        Ok(l)
    }
}

/// Per-family RS frame layout (byte positions within the assembled frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RsCodeCfg {
    pub typ: u8,
    pub msg_len: usize,
    pub msg_pos: usize,
    pub par_pos: usize,
    pub hdr_len: usize,
    pub frm_len: usize,
}

/// RS92 layout: one codeword, 24 parity bytes at the frame tail.
pub const CFG_RS92: RsCodeCfg = RsCodeCfg {
    typ: 92,
    msg_len: 240 - 6 - 24,
    msg_pos: 6,
    par_pos: 240 - 24,
    hdr_len: 6,
    frm_len: 240,
};

/// RS41 layout: two interleaved codewords, 2*24 parity bytes after the header.
pub const CFG_RS41: RsCodeCfg = RsCodeCfg {
    typ: 41,
    msg_len: (320 - 56) / 2,
    msg_pos: 56,
    par_pos: 8,
    hdr_len: 8,
    frm_len: 320,
};

impl RsCodeCfg {
    /// RS41 frames may extend past the standard length (aux payload); the
    /// message half grows with the frame.
    pub fn with_frame_len(mut self, frm_len: usize) -> Self {
        if self.typ == 41 {
            let len = frm_len.min(518);
            self.frm_len = len;
            self.msg_len = (len - self.msg_pos) / 2;
        }
        self
    }
}

/// Correction outcome for one protected frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RsOutcome {
    /// Corrected byte count per codeword; None marks a failed codeword.
    pub corrected: [Option<usize>; 2],
}

impl RsOutcome {
    pub fn total_corrected(&self) -> usize {
        self.corrected.iter().flatten().sum()
    }

    pub fn all_ok(&self) -> bool {
        self.corrected.iter().all(|c| c.is_some())
    }

    pub fn any_ok(&self) -> bool {
        self.corrected.iter().any(|c| c.is_some())
    }
}

/// Decode the RS41 even/odd codeword pair in place.
///
/// Message bytes 0,2,4,... form codeword 1 and bytes 1,3,5,... codeword 2,
/// each packed toward the low-degree end with its 24 parity bytes at the
/// codeword tail. Corrected bytes are written back into the frame.
pub fn rs41_ecc(rs: &ReedSolomon, frame: &mut [u8], cfg: &RsCodeCfg) -> RsOutcome {
    let cfg = cfg.with_frame_len(frame.len());
    let mut cw1 = [0u8; RS_N];
    let mut cw2 = [0u8; RS_N];

    for i in 0..cfg.msg_len {
        if cfg.msg_pos + 2 * i + 1 < frame.len() {
            cw1[RS_K - 1 - i] = frame[cfg.msg_pos + 2 * i];
            cw2[RS_K - 1 - i] = frame[cfg.msg_pos + 2 * i + 1];
        }
    }
    for i in 0..RS_R {
        cw1[RS_N - 1 - i] = frame[cfg.par_pos + i];
        cw2[RS_N - 1 - i] = frame[cfg.par_pos + RS_R + i];
    }

    let e1 = rs.decode(&mut cw1).ok();
    let e2 = rs.decode(&mut cw2).ok();

    for i in 0..RS_R {
        frame[cfg.par_pos + i] = cw1[RS_N - 1 - i];
        frame[cfg.par_pos + RS_R + i] = cw2[RS_N - 1 - i];
    }
    for i in 0..cfg.msg_len {
        if cfg.msg_pos + 2 * i + 1 < frame.len() {
            frame[cfg.msg_pos + 2 * i] = cw1[RS_K - 1 - i];
            frame[cfg.msg_pos + 2 * i + 1] = cw2[RS_K - 1 - i];
        }
    }

    RsOutcome {
        corrected: [e1, e2],
    }
}

/// Decode the single RS92 codeword in place.
pub fn rs92_ecc(rs: &ReedSolomon, frame: &mut [u8], cfg: &RsCodeCfg) -> RsOutcome {
    let mut cw = [0u8; RS_N];
    for i in 0..cfg.msg_len {
        cw[RS_K - 1 - i] = frame[cfg.msg_pos + i];
    }
    for i in 0..RS_R {
        cw[RS_N - 1 - i] = frame[cfg.par_pos + i];
    }

    let e = rs.decode(&mut cw).ok();

    for i in 0..cfg.msg_len {
        frame[cfg.msg_pos + i] = cw[RS_K - 1 - i];
    }
    for i in 0..RS_R {
        frame[cfg.par_pos + i] = cw[RS_N - 1 - i];
    }

    RsOutcome {
        corrected: [e, Some(0)],
    }
}
