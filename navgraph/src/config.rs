use crate::{
    error::{IndexError, Result},
    vector::VectorSimilarityFunction,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;

/// Load a configuration from an optional file, overridden by environment
/// variables of the form `{prefix}__{KEY}` (nested keys separated by `__`).
pub fn load_config<T>(prefix: &str, config_path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned,
{
    let mut settings = config::Config::builder();

    if let Some(path) = config_path {
        settings = settings.add_source(config::File::from(path).required(true));
    }

    let settings = settings
        .add_source(
            config::Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config = settings.try_deserialize::<T>()?;

    Ok(config)
}

/// Parameters of a proximity graph index.
///
/// Degree bounds follow the usual hierarchical convention: `max_degree` (`M`)
/// bounds every layer above the base, and the base layer defaults to `2 * M`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub dimension: usize,

    #[serde(default)]
    pub similarity: VectorSimilarityFunction,

    #[serde(default = "default_max_degree")]
    pub max_degree: usize,

    #[serde(default)]
    pub base_layer_max_degree: Option<usize>,

    /// Candidate list size used while searching for neighbors of a new node
    #[serde(default = "default_beam_width")]
    pub beam_width: usize,

    /// Diversity strictness; higher values prune more aggressively
    #[serde(default = "default_alpha")]
    pub alpha: f32,

    /// Relaxation of `alpha` applied when re-pruning back-edges
    #[serde(default = "default_beta")]
    pub beta: f32,

    /// When false, every node lives in layer 0 only
    #[serde(default = "default_hierarchical")]
    pub hierarchical: bool,

    /// Overrides the `1 / ln(M)` level multiplier
    #[serde(default)]
    pub level_multiplier: Option<f64>,

    /// Key of the PRF assigning node levels
    #[serde(default)]
    pub seed: u64,

    /// Size of the bulk build thread pool; rayon's default when unset
    #[serde(default)]
    pub num_threads: Option<usize>,

    #[serde(default)]
    pub search: SearchConfig,
}

/// Defaults for query-time search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Beam width at query time; the build beam width when unset
    #[serde(default)]
    pub beam_width: Option<usize>,

    /// Stop expanding after this many nodes have been scored
    #[serde(default)]
    pub max_visited: Option<usize>,

    /// Number of exact rescoring candidates, as a multiple of `k`
    #[serde(default = "default_rerank_multiplier")]
    pub rerank_multiplier: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            beam_width: None,
            max_visited: None,
            rerank_multiplier: default_rerank_multiplier(),
        }
    }
}

fn default_max_degree() -> usize {
    16
}

fn default_beam_width() -> usize {
    100
}

fn default_alpha() -> f32 {
    1.2
}

fn default_beta() -> f32 {
    1.0
}

fn default_hierarchical() -> bool {
    true
}

fn default_rerank_multiplier() -> usize {
    1
}

impl IndexConfig {
    pub fn new(dimension: usize, max_degree: usize, beam_width: usize, alpha: f32) -> Self {
        Self {
            dimension,
            similarity: VectorSimilarityFunction::default(),
            max_degree,
            base_layer_max_degree: None,
            beam_width,
            alpha,
            beta: default_beta(),
            hierarchical: default_hierarchical(),
            level_multiplier: None,
            seed: 0,
            num_threads: None,
            search: SearchConfig::default(),
        }
    }

    pub fn with_similarity(mut self, similarity: VectorSimilarityFunction) -> Self {
        self.similarity = similarity;
        self
    }

    pub fn with_beta(mut self, beta: f32) -> Self {
        self.beta = beta;
        self
    }

    pub fn with_hierarchical(mut self, hierarchical: bool) -> Self {
        self.hierarchical = hierarchical;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    pub fn base_layer_max_degree(&self) -> usize {
        self.base_layer_max_degree.unwrap_or(2 * self.max_degree)
    }

    /// Degree cap for layer `lc`.
    pub fn max_degree_at(&self, lc: usize) -> usize {
        if lc == 0 {
            self.base_layer_max_degree()
        } else {
            self.max_degree
        }
    }

    /// The `m_L` parameter of the level distribution.
    pub fn level_multiplier(&self) -> f64 {
        self.level_multiplier
            .unwrap_or_else(|| (self.max_degree as f64).ln().recip())
    }

    pub fn search_beam_width(&self) -> usize {
        self.search.beam_width.unwrap_or(self.beam_width)
    }

    /// Reject parameter combinations the index cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(IndexError::invalid_config("dimension must be positive"));
        }
        if self.max_degree == 0 {
            return Err(IndexError::invalid_config("max_degree must be positive"));
        }
        if self.base_layer_max_degree() < self.max_degree {
            return Err(IndexError::invalid_config(format!(
                "base_layer_max_degree {} is below max_degree {}",
                self.base_layer_max_degree(),
                self.max_degree
            )));
        }
        if self.beam_width == 0 || self.search.beam_width == Some(0) {
            return Err(IndexError::invalid_config("beam_width must be positive"));
        }
        if !(self.alpha > 0.0) || !self.alpha.is_finite() {
            return Err(IndexError::invalid_config(format!(
                "alpha must be positive, got {}",
                self.alpha
            )));
        }
        if !(self.beta > 0.0) || !self.beta.is_finite() {
            return Err(IndexError::invalid_config(format!(
                "beta must be positive, got {}",
                self.beta
            )));
        }
        if self.search.rerank_multiplier == 0 {
            return Err(IndexError::invalid_config(
                "rerank_multiplier must be positive",
            ));
        }
        if self.num_threads == Some(0) {
            return Err(IndexError::invalid_config("num_threads must be positive"));
        }
        if self.hierarchical {
            let m_l = self.level_multiplier();
            if !(m_l > 0.0) || !m_l.is_finite() {
                return Err(IndexError::invalid_config(format!(
                    "level multiplier must be positive and finite, got {m_l} (max_degree {})",
                    self.max_degree
                )));
            }
        }
        Ok(())
    }
}
