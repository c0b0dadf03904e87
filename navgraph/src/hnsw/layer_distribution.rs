//! Random selection of the top layer of newly inserted nodes.

use crate::{
    config::IndexConfig,
    error::{IndexError, Result},
};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Geometric};
use siphasher::sip::SipHasher13;
use std::hash::{Hash, Hasher};

/// Statistical distribution of node levels.
///
/// `Geometric` with layer probability `q = exp(-1 / m_L)` yields the same
/// levels as `floor(-ln(U) * m_L)` for `U` uniform on `(0, 1]`, so that each
/// layer holds a fraction `q` of the nodes of the layer below.
#[derive(Clone, Debug)]
pub enum LayerDistribution {
    Geometric(Geometric),
    /// Every node lives in layer 0 only.
    Flat,
}

#[allow(non_snake_case)]
impl LayerDistribution {
    pub fn new_geometric_from_m_L(m_L: f64) -> Result<Self> {
        let layer_probability = Self::layer_probability_from_m_L(m_L);
        let geometric = Geometric::new(1f64 - layer_probability).map_err(|err| {
            IndexError::invalid_config(format!("level multiplier {m_L}: {err}"))
        })?;
        Ok(LayerDistribution::Geometric(geometric))
    }

    pub fn from_config(config: &IndexConfig) -> Result<Self> {
        if config.hierarchical {
            Self::new_geometric_from_m_L(config.level_multiplier())
        } else {
            Ok(LayerDistribution::Flat)
        }
    }

    pub fn gen_layer(&self, rng: &mut impl RngCore) -> usize {
        match self {
            LayerDistribution::Geometric(geometric) => geometric.sample(rng) as usize,
            LayerDistribution::Flat => 0,
        }
    }

    /// Compute the parameter m_L associated with a geometric distribution
    /// parameter q describing the random layer of newly inserted graph nodes.
    ///
    /// E.g. for graph hierarchy where each layer has a factor of 16 fewer
    /// entries than the last, the `layer_probability` input is 1/16.
    pub fn m_L_from_layer_probability(layer_probability: f64) -> f64 {
        -layer_probability.ln().recip()
    }

    /// Compute the parameter q for the geometric distribution used to select
    /// the insertion layer for newly inserted graph nodes, from the parameter
    /// m_L of the HNSW paper.
    pub fn layer_probability_from_m_L(m_L: f64) -> f64 {
        (-m_L.recip()).exp()
    }
}

/// Derive the 16-byte PRF key used for level selection from a build seed.
pub fn prf_key_from_seed(seed: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&seed.to_le_bytes());
    key[8..].copy_from_slice(&seed.rotate_left(32).to_le_bytes());
    key
}

/// Choose a level for `value` by evaluating a keyed PRF on it.
///
/// The result depends only on `prf_key` and `value`, so concurrent builds
/// assign the same levels regardless of insertion order or thread count.
pub fn gen_layer_prf<H: Hash>(
    distribution: &LayerDistribution,
    prf_key: &[u8; 16],
    value: &H,
) -> usize {
    // produce `value_hash` from `value` using `SipHasher13`, keyed with `prf_key`
    let mut hasher = SipHasher13::new_with_key(prf_key);
    value.hash(&mut hasher);
    let value_hash: u64 = hasher.finish();

    // seed with `(prf_key || prf_key) ^ value_hash` repeated
    let mut rng_seed = [0u8; 32];
    for (idx, byte) in rng_seed.iter_mut().enumerate() {
        *byte = prf_key[idx % 16] ^ value_hash.to_le_bytes()[idx % 8];
    }
    let mut rng = ChaCha8Rng::from_seed(rng_seed);

    distribution.gen_layer(&mut rng)
}
