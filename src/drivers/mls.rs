//! Maximum-length sequence generator (Fibonacci LFSR).
//!
//! Taps follow the table used by common DSP toolkits so that a sequence of a given order
//! is bit-identical to the one the bench scripts produced. The register starts all ones.
use crate::drivers::EisError;

pub const MIN_ORDER: u32 = 2;
pub const MAX_ORDER: u32 = 32;

fn taps(order: u32) -> &'static [u32] {
    match order {
        2 => &[1],
        3 => &[2],
        4 => &[3],
        5 => &[3],
        6 => &[5],
        7 => &[6],
        8 => &[7, 6, 1],
        9 => &[5],
        10 => &[7],
        11 => &[9],
        12 => &[11, 10, 4],
        13 => &[12, 11, 8],
        14 => &[13, 12, 2],
        15 => &[14],
        16 => &[15, 13, 4],
        17 => &[14],
        18 => &[11],
        19 => &[18, 17, 14],
        20 => &[17],
        21 => &[19],
        22 => &[21],
        23 => &[18],
        24 => &[23, 22, 17],
        25 => &[22],
        26 => &[25, 24, 20],
        27 => &[26, 25, 22],
        28 => &[25],
        29 => &[27],
        30 => &[29, 28, 7],
        31 => &[28],
        _ => &[31, 30, 10],
    }
}

/// Period of an order-`order` sequence.
pub fn period(order: u32) -> usize {
    (1usize << order) - 1
}

/// One period of the binary sequence as 0/1 values.
pub fn max_len_seq(order: u32) -> Result<Vec<u8>, EisError> {
    if !(MIN_ORDER..=MAX_ORDER).contains(&order) {
        return Err(EisError::Config(format!(
            "MLS order must be in {MIN_ORDER}..={MAX_ORDER}, got {order}"
        )));
    }
    let nbits = order as usize;
    let taps = taps(order);
    let mut state = vec![1u8; nbits];
    let len = period(order);
    let mut seq = Vec::with_capacity(len);
    let mut idx = 0usize;
    for _ in 0..len {
        let mut feedback = state[idx];
        seq.push(feedback);
        for &tap in taps {
            feedback ^= state[(tap as usize + idx) % nbits];
        }
        state[idx] = feedback;
        idx = (idx + 1) % nbits;
    }
    Ok(seq)
}
