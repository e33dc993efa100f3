/*
Token sampling for generation. Coins are floats in [0, 1), usually from
Mt19937::randf32().
*/

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let maxval = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits.iter().map(|&x| (x - maxval).exp()).collect();
    let sum: f32 = probs.iter().sum();
    probs.iter_mut().for_each(|p| *p /= sum);
    probs
}

pub fn sample_softmax(logits: &[f32], coin: f32) -> usize {
    // sample index from logits (converted to probabilities using softmax)
    let maxval = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let norm: f64 = logits.iter().map(|&x| f64::from((x - maxval).exp())).sum();
    // instead of dividing all exp(logits), we can just multiply coin.
    let coin = coin as f64 * norm;
    let mut cdf = 0.0f64;
    for (i, &logit) in logits.iter().enumerate() {
        cdf += f64::from((logit - maxval).exp());
        if coin < cdf {
            return i;
        }
    }
    logits.len() - 1 // in case of rounding errors
}

/// The `k` most probable entries as `(index, probability)`, most probable
/// first. Ties keep the lower index first.
pub fn top_k(probs: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut ranked: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(k.max(1));
    ranked
}

/// Sample a token from the top `k` of the softmax of `logits`, renormalized
/// over those `k`. `k == 0` samples from the full distribution.
pub fn sample_top_k(logits: &[f32], k: usize, coin: f32) -> usize {
    if k == 0 || k >= logits.len() {
        return sample_softmax(logits, coin);
    }
    let candidates = top_k(&softmax(logits), k);
    let mass: f32 = candidates.iter().map(|&(_, p)| p).sum();
    let coin = coin * mass;
    let mut cdf = 0.0f32;
    for &(i, p) in &candidates {
        cdf += p;
        if coin < cdf {
            return i;
        }
    }
    candidates.last().map_or(0, |&(i, _)| i) // in case of rounding errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::Mt19937;

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0, 1000.0]);
        assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(probs[3] > 0.99);
    }

    #[test]
    fn test_sample_softmax_follows_cdf() {
        let logits = [0.0f32, 0.0];
        assert_eq!(sample_softmax(&logits, 0.25), 0);
        assert_eq!(sample_softmax(&logits, 0.75), 1);
        assert_eq!(sample_softmax(&logits, 0.999_999_9), 1);
    }

    #[test]
    fn test_top_k_order() {
        let ranked = top_k(&[0.1, 0.4, 0.1, 0.3, 0.1], 3);
        assert_eq!(ranked.iter().map(|&(i, _)| i).collect::<Vec<_>>(), [1, 3, 0]);
    }

    #[test]
    fn test_top_one_is_argmax() {
        let logits = [0.3f32, -1.0, 2.5, 2.4];
        for coin in [0.0, 0.5, 0.99] {
            assert_eq!(sample_top_k(&logits, 1, coin), 2);
        }
    }

    #[test]
    fn test_k_zero_uses_full_distribution() {
        let logits = [0.0f32, 0.0, 0.0, 0.0];
        assert_eq!(sample_top_k(&logits, 0, 0.9), 3);
        assert_eq!(sample_top_k(&logits, 10, 0.1), 0);
    }

    #[test]
    fn test_top_k_never_samples_outside_k() {
        let logits = [5.0f32, 0.0, 4.0, 4.5, 1.0];
        let mut rng = Mt19937::new(42);
        for _ in 0..1000 {
            let token = sample_top_k(&logits, 2, rng.randf32());
            assert!(token == 0 || token == 3, "sampled {token}");
        }
    }
}
