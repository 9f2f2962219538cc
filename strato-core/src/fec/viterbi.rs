//! Viterbi decoder for the LMS6 rate-1/2 convolutional code.
//!
//! Constraint length 7, generators 0x4F and 0x6D (d_free = 10). The
//! decoder re-estimates the *coded* bit stream (maximum-likelihood path,
//! squared-Euclidean metric on soft bits); the paired [`deconv`]
//! deconvolver then recovers the data bits and verifies by re-encoding.

use crate::dsp::SoftBit;
use crate::errors::FecError;

const L: usize = 7;
/// polyA 0x4F: x^6+x^3+x^2+x+1, MSB-first bit string 1001111
const POLY_A: [u8; 7] = [1, 0, 0, 1, 1, 1, 1];
/// polyB 0x6D: x^6+x^5+x^3+x^2+1
const POLY_B: [u8; 7] = [1, 1, 0, 1, 1, 0, 1];

const N_STATES2: usize = 1 << L; // input-extended states
const M_STATES: usize = 1 << (L - 1); // trellis states

#[derive(Debug, Clone, Copy, Default)]
struct TrellisNode {
    code_in: u8,
    prev_state: u8,
    w: f32,
}

/// Reusable Viterbi decoder; trellis storage is allocated once for the
/// maximum raw-bit count and reused across frames.
#[derive(Debug)]
pub struct Viterbi {
    code: [u8; N_STATES2],
    trellis: Vec<[TrellisNode; M_STATES]>,
    max_t: usize,
}

impl Viterbi {
    /// `max_rawbits` is the largest coded bit count a frame can carry.
    pub fn new(max_rawbits: usize) -> Self {
        let mut code = [0u8; N_STATES2];
        for (bits, c) in code.iter_mut().enumerate() {
            let mut ca = 0u8;
            let mut cb = 0u8;
            for i in 0..L {
                let b = ((bits >> i) & 1) as u8;
                ca ^= POLY_A[L - 1 - i] & b;
                cb ^= POLY_B[L - 1 - i] & b;
            }
            *c = (ca << 1) | cb;
        }
        let max_t = max_rawbits / 2 + 1;
        Viterbi {
            code,
            trellis: vec![[TrellisNode::default(); M_STATES]; max_t + 1],
            max_t,
        }
    }

    fn dist2(&self, c: u8, rc: &[SoftBit]) -> f32 {
        let c0 = 2.0 * ((c >> 1) & 1) as f32 - 1.0;
        let c1 = 2.0 * (c & 1) as f32 - 1.0;
        (c0 - rc[0].sb) * (c0 - rc[0].sb) + (c1 - rc[1].sb) * (c1 - rc[1].sb)
    }

    /// Decode the coded soft-bit stream; returns the maximum-likelihood
    /// coded hard-bit sequence (same length, rounded down to pairs).
    pub fn decode(&mut self, rc: &[SoftBit]) -> Result<Vec<u8>, FecError> {
        let tmax = rc.len() / 2;
        if tmax < L {
            return Err(FecError::ViterbiInputTooShort { len: rc.len() });
        }
        let tmax = tmax.min(self.max_t);

        // Warm-up: from state 0 only 2^t states are reachable at time t
        let mut m = M_STATES;
        let mut t = L - 1;
        while t > 0 {
            for j in 0..m {
                self.trellis[t][j].prev_state = (j / 2) as u8;
            }
            t -= 1;
            m /= 2;
        }
        self.trellis[0][0].w = 0.0;

        let mut m = 2;
        for t in 1..L {
            for j in 0..m {
                let c = self.code[j];
                self.trellis[t][j].code_in = c;
                let prev = self.trellis[t][j].prev_state as usize;
                let d = self.dist2(c, &rc[2 * (t - 1)..]);
                self.trellis[t][j].w = self.trellis[t - 1][prev].w + d;
            }
            m *= 2;
        }

        // Main add-compare-select recursion
        let mut d = [TrellisNode::default(); N_STATES2];
        for t in L - 1..tmax {
            for j in 0..M_STATES {
                for b in 0..2usize {
                    let nstate = j * 2 + b;
                    d[nstate].code_in = self.code[nstate];
                    d[nstate].prev_state = j as u8;
                    d[nstate].w = self.trellis[t][j].w + self.dist2(self.code[nstate], &rc[2 * t..]);
                }
            }
            for j in 0..M_STATES {
                let index = if d[j].w <= d[j + M_STATES].w { j } else { j + M_STATES };
                self.trellis[t + 1][j] = d[index];
            }
        }

        // Terminal state: global minimum metric
        let mut j_min = 0usize;
        let mut w_min = f32::INFINITY;
        for j in 0..M_STATES {
            if self.trellis[tmax][j].w < w_min {
                w_min = self.trellis[tmax][j].w;
                j_min = j;
            }
        }

        // Traceback emits the code bits of the surviving path
        let mut raw = vec![0u8; 2 * tmax];
        let mut j = j_min;
        let mut t = tmax;
        while t > 0 {
            let c = self.trellis[t][j].code_in;
            raw[2 * t - 2] = (c >> 1) & 1;
            raw[2 * t - 1] = c & 1;
            j = self.trellis[t][j].prev_state as usize;
            t -= 1;
        }
        Ok(raw)
    }
}

/// Deconvolve a coded hard-bit stream back to data bits by running the
/// encoder forward; a divergence that a single-bit flip cannot resolve
/// stops the decode and reports the error position (0 = clean).
///
/// The first six data bits are assumed zero (the coded stream opens on
/// the all-zero sync byte) and are part of the returned bit string, so
/// byte packing stays aligned with the transmitted stream.
pub fn deconv(rawbits: &[u8]) -> (Vec<u8>, usize) {
    let m = L - 1;
    let len = rawbits.len();
    let mut bits = vec![0u8; m];
    let mut errors = 0usize;

    let mut n = 0usize;
    while 2 * (m + n) + 1 < len {
        let p0 = rawbits[2 * (m + n)];
        let p1 = rawbits[2 * (m + n) + 1];
        let mut bit_a = 0u8;
        let mut bit_b = 0u8;
        for j in 0..m {
            bit_a ^= bits[n + j] & POLY_A[j];
            bit_b ^= bits[n + j] & POLY_B[j];
        }
        let next = if (bit_a ^ p0) == POLY_A[m] && (bit_b ^ p1) == POLY_B[m] {
            1
        } else if (bit_a ^ p0) == 0 && (bit_b ^ p1) == 0 {
            0
        } else {
            errors = n;
            break;
        };
        bits.push(next);
        n += 1;
    }

    (bits, errors)
}

/// Convolutionally encode data bits (for tests and re-encoding checks).
pub fn conv_encode(data: &[u8]) -> Vec<u8> {
    let mut state = vec![0u8; L - 1];
    let mut out = Vec::with_capacity(2 * data.len());
    for &b in data {
        // register: oldest first, as deconv walks it
        let mut window = state.clone();
        window.push(b);
        let mut ca = 0u8;
        let mut cb = 0u8;
        for (j, &w) in window.iter().enumerate() {
            ca ^= w & POLY_A[j];
            cb ^= w & POLY_B[j];
        }
        out.push(ca);
        out.push(cb);
        state.remove(0);
        state.push(b);
    }
    out
}
