use rand_mt::Mt;
use std::f32::consts::PI;

/// Mersenne Twister with the float conventions PyTorch and llm.c use.
#[derive(Clone)]
pub struct Mt19937 {
    rng: Mt,
}

impl Mt19937 {
    pub fn new(seed: u32) -> Self {
        Self {
            rng: Mt::new(seed),
        }
    }

    pub fn randu32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    pub fn randf32(&mut self) -> f32 {
        ((self.randu32() as u64) & ((1u64 << 24) - 1)) as f32 * (1.0f32 / (1u64 << 24) as f32)
    }
}

/// Fill `data` with N(mean, std) samples using the Box-Muller transform.
pub fn normal_(data: &mut [f32], mean: f32, std: f32, rng: &mut Mt19937) {
    const EPSILON: f32 = 1e-12f32;
    for pair in data.chunks_mut(2) {
        let u1 = 1.0f32 - rng.randf32();
        let u2 = rng.randf32();
        let radius = (-2.0f32 * (u1 + EPSILON).ln()).sqrt();
        let theta = 2.0f32 * PI * u2;
        pair[0] = radius * theta.cos() * std + mean;
        if let Some(second) = pair.get_mut(1) {
            *second = radius * theta.sin() * std + mean;
        }
    }
}

/// Choose `amount` distinct indices out of `0..population`, returned sorted.
///
/// Runs the first `amount` swaps of a Fisher-Yates shuffle, so the result only
/// depends on the seed of `rng`.
pub fn sample_indices(population: usize, amount: usize, rng: &mut Mt19937) -> Vec<usize> {
    assert!(amount <= population, "cannot sample {amount} out of {population}");
    let mut pool: Vec<usize> = (0..population).collect();
    for i in 0..amount {
        // pick an index j in [i, population) with equal probability
        let j = i + rng.randu32() as usize % (population - i);
        pool.swap(i, j);
    }
    pool.truncate(amount);
    pool.sort_unstable();
    pool
}
