//! Reed-Solomon and BCH block codes (Euclidean-algorithm decoder).
//!
//! Codeword layout follows the wire formats: coefficient `n` of the code
//! polynomial lives at `cw[n]`, parity occupies `cw[0..R]`, message bytes
//! `cw[R..N]`. Generator roots are alpha^(p*(b+i)); for the CCSDS code the
//! stride p = 11 (with p*ip = 1 mod N) maps between the conventional and
//! the Berlekamp representation.

use super::gf::{poly, GaloisField};
use crate::errors::FecError;

/// A Reed-Solomon (or BCH container) code over GF(2^m).
#[derive(Debug, Clone)]
pub struct ReedSolomon {
    pub n: usize,
    pub k: usize,
    pub r: usize,
    pub t: usize,
    pub b: u32,
    pub p: u32,
    pub ip: u32,
    g: Vec<u8>,
    pub gf: GaloisField,
}

impl ReedSolomon {
    /// RS(255,231), t=12, b=0 — RS41 frame protection (two interleaved
    /// codewords per frame).
    pub fn rs255() -> Self {
        Self::new(GaloisField::gf256(), 255, 24, 0, 1, 1)
    }

    /// RS(255,223) CCSDS, t=16, b=112, p=11 — LMS6 block code.
    pub fn rs255_ccsds() -> Self {
        Self::new(GaloisField::gf256_ccsds(), 255, 32, 112, 11, 116)
    }

    /// BCH(63,51) over GF(2^6), t=2, R=12 — Meisei subframe code,
    /// shortened to (46,34) on the wire.
    pub fn bch64() -> Self {
        Self::new(GaloisField::gf64(), 63, 12, 1, 1, 1)
    }

    fn new(gf: GaloisField, n: usize, r: usize, b: u32, p: u32, ip: u32) -> Self {
        // g(x) = prod_{i=0..R-1} (x - alpha^(p*(b+i)))
        let mut g = vec![1u8];
        for i in 0..r as u32 {
            let root = gf.exp(p * (b + i));
            g = poly::mul(&gf, &g, &[root, 1]);
        }
        ReedSolomon {
            n,
            k: n - r,
            r,
            t: r / 2,
            b,
            p,
            ip,
            g,
            gf,
        }
    }

    /// Systematic encode: fill `cw[0..R]` with the remainder of
    /// msg(x)*x^R divided by g(x). `cw[R..N]` must hold the message.
    pub fn encode(&self, cw: &mut [u8]) {
        let r = self.r;
        let mut rem = vec![0u8; r];
        for i in (r..self.n).rev() {
            let feedback = cw[i] ^ rem[r - 1];
            for j in (1..r).rev() {
                rem[j] = rem[j - 1] ^ self.gf.mul(feedback, self.g[j]);
            }
            rem[0] = self.gf.mul(feedback, self.g[0]);
        }
        cw[..r].copy_from_slice(&rem);
    }

    fn syndromes(&self, cw: &[u8]) -> Vec<u8> {
        (0..self.r as u32)
            .map(|i| self.gf.poly_eval(cw, self.gf.exp(self.p * (self.b + i))))
            .collect()
    }

    /// Decode in place. Returns the number of corrected symbols.
    pub fn decode(&self, cw: &mut [u8]) -> Result<usize, FecError> {
        self.decode_with_erasures(cw, &[])
    }

    /// Errors-and-erasures decode in place; `era_pos` holds up to R known
    /// erasure positions (codeword indices).
    pub fn decode_with_erasures(&self, cw: &mut [u8], era_pos: &[u8]) -> Result<usize, FecError> {
        let gf = &self.gf;
        let nera = era_pos.len();
        if nera > self.r {
            return Err(FecError::TooManyErasures {
                nera,
                max: self.r,
            });
        }

        let s = self.syndromes(cw);
        if s.iter().all(|&x| x == 0) {
            return Ok(0);
        }

        // Erasure locator Gamma(x) = prod (1 - X_e x), X_e = alpha^(p*pos)
        let mut gamma = vec![1u8];
        for &e in era_pos {
            let xe = gf.exp(self.p * e as u32);
            gamma = poly::mul(gf, &gamma, &[1, xe]);
        }

        // Modified syndrome Xi = S*Gamma mod x^R
        let mut xi = poly::mul(gf, &s, &gamma);
        xi.truncate(self.r);

        // Extended Euclid on (x^R, Xi); stop when deg(remainder) drops
        // below (R+nera+1)/2. The multiplier is the error locator, the
        // remainder the evaluator.
        let stop = (self.r + nera + 1) / 2;
        let mut r_prev = vec![0u8; self.r + 1];
        r_prev[self.r] = 1;
        let mut r_cur = xi;
        let mut t_prev = vec![0u8];
        let mut t_cur = vec![1u8];

        while poly::deg(&r_cur) >= stop && r_cur.iter().any(|&x| x != 0) {
            let (q, rem) = poly_divmod(gf, &r_prev, &r_cur);
            let t_next = poly::add(&t_prev, &poly::mul(gf, &q, &t_cur));
            r_prev = r_cur;
            r_cur = rem;
            t_prev = t_cur;
            t_cur = t_next;
        }

        let lambda = t_cur;
        let omega = r_cur;

        // Combined locator covers errors and erasures
        let psi = poly::mul(gf, &lambda, &gamma);
        let psi_deg = poly::deg(&psi);
        if psi_deg == 0 || psi_deg > self.r {
            return Err(FecError::RsUncorrectable {
                syndromes: s.iter().filter(|&&x| x != 0).count(),
            });
        }

        // Chien search: position i errored iff Psi(X_i^-1) = 0
        let mut positions = Vec::with_capacity(psi_deg);
        for i in 0..self.n as u32 {
            let xi_inv = gf.inv(gf.exp(self.p * i));
            if gf.poly_eval(&psi, xi_inv) == 0 {
                positions.push(i as usize);
            }
        }
        if positions.len() != psi_deg {
            return Err(FecError::RsUncorrectable {
                syndromes: s.iter().filter(|&&x| x != 0).count(),
            });
        }

        // Forney: e_i = X_i^(1-b) * Omega(X_i^-1) / Psi'(X_i^-1)
        let psi_d = poly::derive(&psi);
        let mut fixes = Vec::with_capacity(positions.len());
        for &pos in &positions {
            let x = gf.exp(self.p * pos as u32);
            let x_inv = gf.inv(x);
            let num = gf.poly_eval(&omega, x_inv);
            let den = gf.poly_eval(&psi_d, x_inv);
            if den == 0 {
                return Err(FecError::RsUncorrectable {
                    syndromes: s.iter().filter(|&&x| x != 0).count(),
                });
            }
            let mut e = gf.div(num, den);
            // X_i^(1-b) factor, X_i = alpha^(p*pos)
            let nm1 = self.gf.ord - 1;
            let log_x = (self.p * pos as u32) % nm1;
            let one_minus_b = (nm1 + 1 - self.b % nm1) % nm1;
            e = gf.mul(e, gf.exp(log_x * one_minus_b));
            fixes.push((pos, e));
        }
        for &(pos, e) in &fixes {
            cw[pos] ^= e;
        }

        // Recovered word must be in the code; leave the input untouched
        // on failure so callers can retry with different erasures
        if self.syndromes(cw).iter().any(|&x| x != 0) {
            for &(pos, e) in &fixes {
                cw[pos] ^= e;
            }
            return Err(FecError::RsUncorrectable {
                syndromes: self.r,
            });
        }

        Ok(positions.len())
    }

    /// Binary BCH t=2 decode over the bit codeword (one bit per element,
    /// coefficient n at `cw[n]`, length N=63). Returns corrected bits.
    pub fn decode_bch_gf2t2(&self, cw: &mut [u8]) -> Result<usize, FecError> {
        let gf = &self.gf;
        // Binary codeword: S_{2j} = S_j^2, only S1 and S3 are independent
        let s1 = gf.poly_eval(cw, gf.exp(1));
        let s3 = gf.poly_eval(cw, gf.exp(3));

        if s1 == 0 && s3 == 0 {
            return Ok(0);
        }
        if s1 != 0 {
            let s1_3 = gf.mul(gf.mul(s1, s1), s1);
            if s3 == s1_3 {
                // single error at log(S1)
                let pos = gf.log_a[s1 as usize] as usize;
                if pos >= cw.len() {
                    return Err(FecError::BchUncorrectable { t: 2 });
                }
                cw[pos] ^= 1;
                return Ok(1);
            }
            // two errors: Lambda(x) = x^2 + S1 x + (S3 + S1^3)/S1
            let sigma2 = gf.div(s3 ^ s1_3, s1);
            let mut found = Vec::with_capacity(2);
            for i in 0..self.n as u32 {
                let x = gf.exp(i);
                let v = gf.mul(x, x) ^ gf.mul(s1, x) ^ sigma2;
                if v == 0 {
                    found.push(i as usize);
                }
            }
            if found.len() == 2 && found.iter().all(|&i| i < cw.len()) {
                for &i in &found {
                    cw[i] ^= 1;
                }
                return Ok(2);
            }
        }
        Err(FecError::BchUncorrectable { t: 2 })
    }
}

/// Polynomial division: returns (quotient, remainder), lowest-first.
fn poly_divmod(gf: &GaloisField, a: &[u8], b: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let db = poly::deg(b);
    let lead_inv = gf.inv(b[db]);
    let mut rem: Vec<u8> = a.to_vec();
    let da = poly::deg(&rem);
    if da < db {
        return (vec![0], rem);
    }
    let mut q = vec![0u8; da - db + 1];
    for i in (db..=da).rev() {
        if rem[i] == 0 {
            continue;
        }
        let c = gf.mul(rem[i], lead_inv);
        q[i - db] = c;
        for j in 0..=db {
            rem[i - db + j] ^= gf.mul(c, b[j]);
        }
    }
    rem.truncate(db.max(1));
    (q, rem)
}
