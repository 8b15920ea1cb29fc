use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Seeded random partition of `rows` into a training and a validation split.
///
/// The validation split gets `ceil(valid_ratio * rows.len())` rows, both splits keep the shuffled order.
pub fn train_valid_split<T>(rows: Vec<T>, valid_ratio: f64, seed: u64) -> (Vec<T>, Vec<T>) {
    let n = rows.len();
    let n_valid = ((valid_ratio.clamp(0.0, 1.0) * n as f64).ceil() as usize).min(n);

    let mut rng = StdRng::seed_from_u64(seed);
    let mut order = (0..n).collect::<Vec<_>>();
    order.shuffle(&mut rng);

    let mut slots = rows.into_iter().map(Some).collect::<Vec<_>>();
    let mut shuffled = order.into_iter().filter_map(|i| slots[i].take());

    let valid = shuffled.by_ref().take(n_valid).collect::<Vec<_>>();
    let train = shuffled.collect::<Vec<_>>();

    tracing::debug!(train = train.len(), valid = valid.len(), seed, "Split labeled data");
    (train, valid)
}
