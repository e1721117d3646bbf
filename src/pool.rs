use std::collections::HashMap;

use rand::Rng;
use serde::Serialize;

use crate::error::GatewayError;

pub const DEFAULT_REGION: &str = "unknown";

/// One concrete backend that can serve a public model id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub url: String,
    pub upstream_model_id: String,
    pub region: String,
    pub weight: u32,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, upstream_model_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            upstream_model_id: upstream_model_id.into(),
            region: DEFAULT_REGION.to_string(),
            weight: 1,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// Public model id -> ordered endpoint pool. Read-only once loaded.
#[derive(Debug, Clone, Default)]
pub struct ModelPools {
    pools: HashMap<String, Vec<Endpoint>>,
}

impl ModelPools {
    pub fn insert(&mut self, model_id: impl Into<String>, endpoints: Vec<Endpoint>) {
        self.pools.insert(model_id.into(), endpoints);
    }

    /// Resolves a public model id to its pool.
    ///
    /// An absent id is `UnknownModel`; a present-but-empty pool resolves to an
    /// empty slice and is left for the caller to reject.
    pub fn resolve(&self, model_id: &str) -> Result<&[Endpoint], GatewayError> {
        self.pools
            .get(model_id)
            .map(Vec::as_slice)
            .ok_or_else(|| GatewayError::UnknownModel(model_id.to_string()))
    }

    pub fn model_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pools.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

/// Picks an endpoint with probability proportional to its weight.
///
/// A one-element pool short-circuits without touching `rng`. Returns `None`
/// only for an empty pool.
pub fn select<'a, R: Rng + ?Sized>(endpoints: &'a [Endpoint], rng: &mut R) -> Option<&'a Endpoint> {
    match endpoints {
        [] => None,
        [only] => Some(only),
        _ => {
            let total: f64 = endpoints.iter().map(|e| f64::from(e.weight.max(1))).sum();
            let draw = rng.gen::<f64>() * total;

            let mut cumulative = 0.0;
            for endpoint in endpoints {
                cumulative += f64::from(endpoint.weight.max(1));
                if cumulative > draw {
                    return Some(endpoint);
                }
            }
            // Rounding left the draw at or past the final boundary.
            endpoints.last()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};

    struct NoRandomness;

    impl RngCore for NoRandomness {
        fn next_u32(&mut self) -> u32 {
            panic!("randomness consumed")
        }

        fn next_u64(&mut self) -> u64 {
            panic!("randomness consumed")
        }

        fn fill_bytes(&mut self, _dest: &mut [u8]) {
            panic!("randomness consumed")
        }

        fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand::Error> {
            panic!("randomness consumed")
        }
    }

    fn endpoint(name: &str, weight: u32) -> Endpoint {
        Endpoint::new(format!("https://{name}.example/chat/completions"), name).with_weight(weight)
    }

    #[test]
    fn single_endpoint_pool_never_draws() {
        let pool = vec![endpoint("only", 5)];
        let mut rng = NoRandomness;
        for _ in 0..100 {
            assert_eq!(select(&pool, &mut rng), Some(&pool[0]));
        }
    }

    #[test]
    fn empty_pool_selects_nothing() {
        let mut rng = NoRandomness;
        assert_eq!(select(&[], &mut rng), None);
    }

    #[test]
    fn selection_follows_weights() {
        let pool = vec![endpoint("heavy", 70), endpoint("light", 30)];
        let mut rng = StdRng::seed_from_u64(7);
        let trials = 20_000;

        let heavy = (0..trials)
            .filter(|_| select(&pool, &mut rng).unwrap().upstream_model_id == "heavy")
            .count();
        let fraction = heavy as f64 / trials as f64;
        assert!(
            (fraction - 0.70).abs() < 0.02,
            "heavy endpoint chosen {fraction} of the time"
        );
    }

    #[test]
    fn zero_weight_is_treated_as_one() {
        let pool = vec![endpoint("a", 0), endpoint("b", 0)];
        let mut rng = StdRng::seed_from_u64(11);
        let picked_a = (0..2_000)
            .filter(|_| select(&pool, &mut rng).unwrap().upstream_model_id == "a")
            .count();
        assert!(picked_a > 800 && picked_a < 1_200, "picked a {picked_a} times");
    }

    #[test]
    fn resolve_distinguishes_unknown_from_empty() {
        let mut pools = ModelPools::default();
        pools.insert("empty", Vec::new());
        pools.insert("one", vec![endpoint("one", 1)]);

        assert!(matches!(
            pools.resolve("missing"),
            Err(GatewayError::UnknownModel(id)) if id == "missing"
        ));
        assert!(pools.resolve("empty").unwrap().is_empty());
        assert_eq!(pools.resolve("one").unwrap().len(), 1);
        assert_eq!(pools.model_ids(), vec!["empty", "one"]);
    }

    #[test]
    fn endpoint_defaults() {
        let e = Endpoint::new("https://x", "m");
        assert_eq!(e.region, DEFAULT_REGION);
        assert_eq!(e.weight, 1);
    }
}
