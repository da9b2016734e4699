//! Small sampling and identifier helpers shared by the workers.

use data_encoding::HEXLOWER;
use rand::Rng;
use rand_chacha::ChaCha12Rng;
use rand_distr::{Distribution, Exp};

use crate::protocol::constants::PLAINTEXT_CHARSET;

/// The engine RNG. ChaCha keeps the stream position in its state, so a
/// checkpoint freezes it mid-stream and a restored run continues exactly
/// where the saved one stopped.
pub type SimRng = ChaCha12Rng;

/// Samples an exponential holding time with the given mean.
///
/// Means are validated positive at configuration time; a degenerate value
/// degrades to an immediate event.
pub fn sample_exp(rng: &mut SimRng, mean: f64) -> f64 {
    Exp::new(1.0 / mean)
        .map(|dist| dist.sample(rng))
        .unwrap_or(0.0)
}

/// Generates a fresh 24-character message id.
pub fn gen_msg_id(rng: &mut SimRng) -> String {
    let bytes: [u8; 12] = rng.gen();
    HEXLOWER.encode(&bytes)
}

/// Generates a random printable plaintext of the requested size.
pub fn random_plaintext(rng: &mut SimRng, size: usize) -> Vec<u8> {
    (0..size)
        .map(|_| PLAINTEXT_CHARSET[rng.gen_range(0..PLAINTEXT_CHARSET.len())])
        .collect()
}

#[cfg(test)]
mod test {
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn exponential_mean_is_respected() {
        let mut rng = SimRng::seed_from_u64(1);
        let samples: Vec<f64> = (0..20_000).map(|_| sample_exp(&mut rng, 4.0)).collect();

        assert!(samples.iter().all(|s| *s >= 0.0));
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        assert!((mean - 4.0).abs() < 0.2, "sample mean drifted to {mean}");
    }

    #[test]
    fn msg_ids_are_unique_and_well_formed() {
        let mut rng = SimRng::seed_from_u64(1);
        let first = gen_msg_id(&mut rng);
        let second = gen_msg_id(&mut rng);

        assert_eq!(first.len(), 24);
        assert_ne!(first, second);
        assert!(first.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn plaintexts_are_printable() {
        let mut rng = SimRng::seed_from_u64(1);
        let plaintext = random_plaintext(&mut rng, 512);

        assert_eq!(plaintext.len(), 512);
        assert!(plaintext.iter().all(|b| b.is_ascii() && !b.is_ascii_control()));
    }
}
