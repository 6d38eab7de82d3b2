//! Shamir secret sharing over GF(2^8)
//!
//! Every payload byte is the constant term of its own random polynomial of
//! degree `k - 1`. Share `i` holds that polynomial evaluated at `x = i + 1`
//! for every byte position, so a share is exactly as long as the payload.
//! Field arithmetic uses the Rijndael polynomial via `reed_solomon_erasure`.

use rand::RngCore;
use reed_solomon_erasure::galois_8::{add, div, mul};
use zeroize::Zeroize;

/// Evaluation point for share `index`. Zero is reserved for the secret.
pub fn x_coordinate(index: u8) -> u8 {
    index.wrapping_add(1)
}

/// Split `secret` into `n` shares, any `k` of which reconstruct it.
///
/// Callers validate `2 <= k <= n <= 255`.
pub fn split<R: RngCore>(secret: &[u8], n: usize, k: usize, rng: &mut R) -> Vec<Vec<u8>> {
    let len = secret.len();

    // coefficients[d * len + pos] is the degree-(d+1) coefficient for byte `pos`
    let mut coefficients = vec![0u8; (k - 1) * len];
    rng.fill_bytes(&mut coefficients);

    let mut shares = Vec::with_capacity(n);
    for index in 0..n {
        let x = x_coordinate(index as u8);
        let mut share = vec![0u8; len];
        for (pos, out) in share.iter_mut().enumerate() {
            // Horner: ((a_{k-1} x + a_{k-2}) x + ... ) x + a_0
            let mut acc = 0u8;
            for degree in (0..k - 1).rev() {
                acc = add(mul(acc, x), coefficients[degree * len + pos]);
            }
            *out = add(mul(acc, x), secret[pos]);
        }
        shares.push(share);
    }

    coefficients.zeroize();
    shares
}

/// Lagrange basis weights for evaluating at `x` from the given points
fn basis_at(xs: &[u8], x: u8) -> Vec<u8> {
    xs.iter()
        .enumerate()
        .map(|(i, &xi)| {
            let mut weight = 1u8;
            for (j, &xj) in xs.iter().enumerate() {
                if i == j {
                    continue;
                }
                // (x - xj) / (xi - xj); subtraction is XOR in GF(2^8)
                weight = mul(weight, div(add(x, xj), add(xi, xj)));
            }
            weight
        })
        .collect()
}

/// Interpolate the polynomials through `points` and evaluate them at `x`.
///
/// Each point is `(x_i, y_i bytes)`. All `y_i` must have the same length and
/// the `x_i` must be distinct; the decoder checks both before calling.
pub fn interpolate_at(points: &[(u8, &[u8])], x: u8) -> Vec<u8> {
    let len = points.first().map(|(_, ys)| ys.len()).unwrap_or(0);
    let xs: Vec<u8> = points.iter().map(|(xi, _)| *xi).collect();
    let weights = basis_at(&xs, x);

    let mut out = vec![0u8; len];
    for ((_, ys), weight) in points.iter().zip(weights) {
        if weight == 0 {
            continue;
        }
        for (acc, &y) in out.iter_mut().zip(ys.iter()) {
            *acc = add(*acc, mul(weight, y));
        }
    }
    out
}

/// Recover the secret (the value at `x = 0`)
pub fn combine(points: &[(u8, &[u8])]) -> Vec<u8> {
    interpolate_at(points, 0)
}
