//! Cross-module FEC validation: the quantified invariants of the code
//! layer.

use strato_core::dsp::SoftBit;
use strato_core::fec::crc::{check_m10, crc16_ccitt, crc16_rev8005};
use strato_core::fec::hamming::{dfm_block, HammingResult};
use strato_core::fec::viterbi::{conv_encode, deconv, Viterbi};
use strato_core::fec::ReedSolomon;

fn soft(bits: &[u8]) -> Vec<SoftBit> {
    bits.iter()
        .map(|&b| SoftBit {
            hb: b,
            sb: 2.0 * b as f32 - 1.0,
        })
        .collect()
}

#[test]
fn rs_decoded_codewords_have_zero_syndromes() {
    // For every successful decode the recovered word must be in the
    // code; verified here by re-encoding the systematic part.
    let rs = ReedSolomon::rs255();
    for seed in 0..8u8 {
        let mut cw = vec![0u8; 255];
        for i in rs.r..255 {
            cw[i] = (i as u8).wrapping_mul(7).wrapping_add(seed);
        }
        rs.encode(&mut cw);
        let clean = cw.clone();

        for (n, pos) in [3usize, 17, 99, 180, 254].iter().enumerate() {
            cw[*pos] ^= (n + 1) as u8;
        }
        let errors = rs.decode(&mut cw).expect("5 errors < t");
        assert_eq!(errors, 5);
        assert_eq!(cw, clean);

        let mut recheck = cw.clone();
        rs.encode(&mut recheck);
        assert_eq!(recheck, cw, "parity must match after correction");
    }
}

#[test]
fn rs_reports_at_most_t_errors() {
    let rs = ReedSolomon::rs255();
    let mut cw = vec![0u8; 255];
    for i in rs.r..255 {
        cw[i] = i as u8;
    }
    rs.encode(&mut cw);
    for pos in (0..24).map(|k| k * 10 + 1) {
        cw[pos] ^= 0x55;
    }
    match rs.decode(&mut cw) {
        Ok(n) => assert!(n <= rs.t),
        Err(_) => {}
    }
}

#[test]
fn hamming_recovers_all_single_bit_errors() {
    // 16 data values x 8 positions, both decoding paths
    const G: [[u8; 4]; 8] = [
        [1, 0, 0, 0],
        [0, 1, 0, 0],
        [0, 0, 1, 0],
        [0, 0, 0, 1],
        [0, 1, 1, 1],
        [1, 0, 1, 1],
        [1, 1, 0, 1],
        [1, 1, 1, 0],
    ];
    for nib in 0..16u8 {
        let bits = [(nib >> 3) & 1, (nib >> 2) & 1, (nib >> 1) & 1, nib & 1];
        let mut cw = [0u8; 8];
        for (i, c) in cw.iter_mut().enumerate() {
            for (j, &b) in bits.iter().enumerate() {
                *c ^= G[i][j] & b;
            }
        }
        for pos in 0..8 {
            let mut noisy = cw;
            noisy[pos] ^= 1;
            let (sym, results) = dfm_block(&soft(&noisy), 1, false);
            assert_eq!(results[0], HammingResult::Corrected(pos as u8));
            assert_eq!(&sym[..4], &bits[..], "nib {:x} pos {}", nib, pos);
        }
    }
}

#[test]
fn viterbi_noise_free_roundtrip_64_bits() {
    let mut data = vec![0u8; 8];
    data.extend((0..64).map(|i| ((i * 3) % 5 < 2) as u8));
    let coded = conv_encode(&data);
    let mut vit = Viterbi::new(coded.len());
    let cleaned = vit.decode(&soft(&coded)).unwrap();
    assert_eq!(cleaned, coded, "noise-free input decodes exactly");
    let (decoded, errors) = deconv(&cleaned);
    assert_eq!(errors, 0);
    assert_eq!(&decoded[..], &data[..decoded.len()]);
}

#[test]
fn crc_roundtrips() {
    // frames accepted as OK must satisfy crc(data) == stored
    let data: Vec<u8> = (0u8..64).collect();

    let crc = crc16_ccitt(&data, 0xFFFF);
    let mut framed = data.clone();
    framed.push(crc as u8);
    framed.push((crc >> 8) as u8);
    let stored = framed[64] as u16 | (framed[65] as u16) << 8;
    assert_eq!(stored, crc16_ccitt(&framed[..64], 0xFFFF));

    let crc = crc16_rev8005(&data);
    assert_eq!(crc, crc16_rev8005(&data));
    let mut corrupted = data.clone();
    corrupted[10] ^= 0x80;
    assert_ne!(crc, crc16_rev8005(&corrupted));

    let cs = check_m10(&data);
    let mut corrupted = data;
    corrupted[63] ^= 1;
    assert_ne!(cs, check_m10(&corrupted));
}

#[test]
fn bch_single_and_double_errors() {
    let rs = ReedSolomon::bch64();
    // all-zero codeword with injected errors
    for (errs, positions) in [(1usize, vec![7usize]), (2, vec![3, 44])] {
        let mut cw = vec![0u8; 63];
        for &p in &positions {
            cw[p] = 1;
        }
        let n = rs.decode_bch_gf2t2(&mut cw).expect("within t=2");
        assert_eq!(n, errs);
        assert!(cw.iter().all(|&b| b == 0));
    }
}

#[test]
fn erasure_decoding_meets_combined_bound() {
    // 2 nu + rho <= R with nu errors and rho erasures
    let rs = ReedSolomon::rs255_ccsds();
    let mut cw = vec![0u8; 255];
    for i in rs.r..255 {
        cw[i] = (i * 3 % 251) as u8;
    }
    rs.encode(&mut cw);
    let clean = cw.clone();

    // 14 errors + 4 erasures: 2*14+4 = 32 = R
    let era: Vec<u8> = vec![40, 41, 42, 43];
    for &p in &era {
        cw[p as usize] = 0xEE;
    }
    for k in 0..14 {
        cw[60 + k * 9] ^= 0x21;
    }
    let n = rs.decode_with_erasures(&mut cw, &era).expect("at the bound");
    assert_eq!(cw, clean);
    assert!(n >= 14);
}
