//! Detection odds for canary density
//!
//! A domain holding `real` fragments and `tokens` canaries is modeled as an
//! urn. An adversary that reads a uniformly random fraction of the domain
//! without replacement touches at least one canary with hypergeometric
//! probability `1 - C(real, s) / C(real + tokens, s)`, where `s` is the number
//! of blobs read. Enumeration (`scan`) touches every key and always trips
//! sensitivity-0 tokens, so these odds matter for adversaries that guess or
//! sample blob IDs instead.

/// Probability that reading `scanned_fraction` of a domain touches a canary
pub fn detection_probability(real: usize, tokens: usize, scanned_fraction: f64) -> f64 {
    if tokens == 0 || !(scanned_fraction > 0.0) {
        return 0.0;
    }
    let total = real + tokens;
    let fraction = scanned_fraction.min(1.0);
    let scanned = ((fraction * total as f64).ceil() as usize).min(total);
    if scanned > real {
        return 1.0;
    }

    // P(miss) = prod_{i<s} (real - i) / (total - i)
    let mut miss = 1.0f64;
    for i in 0..scanned {
        miss *= (real - i) as f64 / (total - i) as f64;
    }
    1.0 - miss
}

/// Smallest token count reaching `target` detection probability for a scan
/// of `scanned_fraction`, searching up to `real` tokens (a 1:1 ratio)
pub fn tokens_for_probability(real: usize, scanned_fraction: f64, target: f64) -> Option<usize> {
    let limit = real.max(1);
    (1..=limit).find(|&tokens| detection_probability(real, tokens, scanned_fraction) >= target)
}

/// Token count for `real` fragments at a given canary ratio
pub fn tokens_for_ratio(real: usize, ratio: f64) -> usize {
    if !(ratio > 0.0) || real == 0 {
        return 0;
    }
    ((real as f64 * ratio).ceil() as usize).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_tokens_never_detects() {
        assert_eq!(detection_probability(100, 0, 1.0), 0.0);
        assert_eq!(detection_probability(100, 10, 0.0), 0.0);
    }

    #[test]
    fn test_full_scan_always_detects() {
        assert_eq!(detection_probability(100, 1, 1.0), 1.0);
    }

    #[test]
    fn test_single_read_matches_token_share() {
        // One blob read out of 4 real + 1 token
        let p = detection_probability(4, 1, 0.2);
        assert!((p - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_probability_grows_with_density() {
        let sparse = detection_probability(1_000, 10, 0.05);
        let dense = detection_probability(1_000, 100, 0.05);
        assert!(dense > sparse);
        assert!(sparse > 0.0 && dense < 1.0);
    }

    #[test]
    fn test_probability_grows_with_scan_fraction() {
        let small = detection_probability(500, 50, 0.01);
        let large = detection_probability(500, 50, 0.10);
        assert!(large > small);
    }

    #[test]
    fn test_tokens_for_probability() {
        let tokens = tokens_for_probability(1_000, 0.10, 0.95).unwrap();
        assert!(detection_probability(1_000, tokens, 0.10) >= 0.95);
        assert!(detection_probability(1_000, tokens - 1, 0.10) < 0.95);
    }

    #[test]
    fn test_tokens_for_ratio() {
        assert_eq!(tokens_for_ratio(3, 1.0), 3);
        assert_eq!(tokens_for_ratio(3, 0.1), 1);
        assert_eq!(tokens_for_ratio(3, 0.0), 0);
        assert_eq!(tokens_for_ratio(0, 1.0), 0);
    }
}
