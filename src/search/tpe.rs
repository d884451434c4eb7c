//! Tree-structured Parzen estimator
//!
//! After `n_startup` random trials, completed trials are split at the
//! `gamma` quantile into a "good" and a "bad" set (ranked with the
//! evaluation tie-break). Each dimension gets two densities, `l` fitted on
//! the good set and `g` on the bad set. Candidates are drawn from `l` and
//! the one maximizing `l(x) / g(x)` is proposed.
//!
//! - Discrete domains: Laplace-smoothed frequencies over the domain values.
//! - Numeric domains: a Parzen mixture of a uniform prior and one Gaussian
//!   kernel per observation, in log space for log-scaled ranges, then
//!   snapped back to the range's grid.
//! - The flow choice is one more discrete dimension.

use super::{Dimension, FlowSpace, SearchAlgorithm, SearchParameter, SearchPoint, SearchSpace, Trial};
use crate::config::SearchAlgorithmConfig;
use crate::hash::Fingerprint;
use crate::value::OptionValue;
use crate::{Error, Result};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashSet;
use statrs::distribution::{Continuous, ContinuousCDF, Normal};
use std::cmp::Ordering;

/// Random trials before the model takes over.
pub const DEFAULT_N_STARTUP: usize = 10;

/// Discrete domains larger than this are modelled as numeric.
const MAX_CATEGORICAL_VALUES: u64 = 64;

/// Random draws tried before declaring the space exhausted.
const MAX_DUPLICATE_DRAWS: usize = 256;

/// Seeded TPE sampler.
#[derive(Debug)]
pub struct TpeSearch {
    space: SearchSpace,
    rng: StdRng,
    n_startup: usize,
    n_candidates: usize,
    gamma: f64,
    seen: FxHashSet<Fingerprint>,
    cardinality: Option<u64>,
}

impl TpeSearch {
    /// Create a sampler from algorithm config.
    ///
    /// # Errors
    /// Returns `ConfigurationError` if `gamma` is outside `(0, 1]` or
    /// `n_candidates` is zero.
    pub fn new(space: SearchSpace, config: &SearchAlgorithmConfig) -> Result<Self> {
        if !(config.gamma > 0.0 && config.gamma <= 1.0) {
            return Err(Error::config(format!(
                "tpe gamma must be in (0, 1], got {}",
                config.gamma
            )));
        }
        if config.n_candidates == 0 {
            return Err(Error::config("tpe n_candidates must be at least 1"));
        }
        let cardinality = space.cardinality();
        Ok(Self {
            space,
            rng: StdRng::seed_from_u64(config.seed),
            n_startup: config.n_startup.unwrap_or(DEFAULT_N_STARTUP),
            n_candidates: config.n_candidates,
            gamma: config.gamma,
            seen: FxHashSet::default(),
            cardinality,
        })
    }

    fn exhausted(&self) -> bool {
        self.cardinality
            .is_some_and(|n| self.seen.len() as u64 >= n)
    }

    fn random_unseen(&mut self) -> Option<SearchPoint> {
        for _ in 0..MAX_DUPLICATE_DRAWS {
            let point = self.space.sample(&mut self.rng)?;
            if self.seen.insert(point.fingerprint()) {
                return Some(point);
            }
        }
        None
    }

    /// Split history into good and bad point sets.
    fn split<'a>(&self, history: &'a [Trial]) -> (Vec<&'a SearchPoint>, Vec<&'a SearchPoint>) {
        let mut ranked: Vec<&Trial> = history.iter().filter(|t| t.result.is_some()).collect();
        // Stable sort: equal results keep trial order, earlier first.
        ranked.sort_by(|a, b| match (&a.result, &b.result) {
            (Some(ra), Some(rb)) => rb.compare(ra),
            _ => Ordering::Equal,
        });
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let n_good = ((self.gamma * ranked.len() as f64).ceil() as usize).clamp(1, ranked.len());
        let good = ranked[..n_good].iter().map(|t| &t.point).collect();
        let bad = ranked[n_good..]
            .iter()
            .map(|t| &t.point)
            .chain(history.iter().filter(|t| t.result.is_none()).map(|t| &t.point))
            .collect();
        (good, bad)
    }

    fn draw_candidate(&mut self, good: &[&SearchPoint]) -> Option<SearchPoint> {
        let flows = self.space.flows();
        let flow_weights: Vec<f64> = flows
            .iter()
            .map(|f| flow_count(good, &f.flow) + 1.0)
            .collect();
        let flow_index = WeightedIndex::new(&flow_weights).ok()?.sample(&mut self.rng);
        let flow = &flows[flow_index];

        let mut values = flow.fixed.clone();
        for dim in &flow.dimensions {
            let assigned = values.entry(dim.pass.clone()).or_default();
            let Some(domain) = dim.active_domain(assigned) else {
                continue;
            };
            let observed = observations(good, dim);
            let value = sample_from(domain, &observed, &mut self.rng);
            assigned.insert(dim.option.clone(), value);
        }
        values.retain(|_, opts| !opts.is_empty());
        Some(SearchPoint::new(flow.flow.clone(), values))
    }

    fn score(&self, point: &SearchPoint, good: &[&SearchPoint], bad: &[&SearchPoint]) -> f64 {
        let flows = self.space.flows();
        let Some(flow) = flows.iter().find(|f| f.flow == point.flow()) else {
            return f64::NEG_INFINITY;
        };
        #[allow(clippy::cast_precision_loss)]
        let k = flows.len() as f64;
        #[allow(clippy::cast_precision_loss)]
        let flow_log = |set: &[&SearchPoint]| {
            ((flow_count(set, &flow.flow) + 1.0) / (set.len() as f64 + k)).ln()
        };
        let mut score = flow_log(good) - flow_log(bad);
        score += dims_score(flow, point, good, bad);
        score
    }
}

fn dims_score(flow: &FlowSpace, point: &SearchPoint, good: &[&SearchPoint], bad: &[&SearchPoint]) -> f64 {
    let mut score = 0.0;
    for dim in &flow.dimensions {
        let assigned = point.pass_values(&dim.pass);
        let (Some(domain), Some(value)) = (dim.active_domain(&assigned), assigned.get(&dim.option))
        else {
            continue;
        };
        score += log_density(domain, &observations(good, dim), value)
            - log_density(domain, &observations(bad, dim), value);
    }
    score
}

#[allow(clippy::cast_precision_loss)]
fn flow_count(points: &[&SearchPoint], flow: &str) -> f64 {
    points.iter().filter(|p| p.flow() == flow).count() as f64
}

fn observations(points: &[&SearchPoint], dim: &Dimension) -> Vec<OptionValue> {
    points
        .iter()
        .filter_map(|p| p.get(&dim.pass, &dim.option).cloned())
        .collect()
}

/// Numeric view of a range domain.
#[derive(Debug, Clone, Copy)]
struct Numeric {
    lo: f64,
    hi: f64,
    log: bool,
    origin: f64,
    step: Option<f64>,
    integer: bool,
}

impl Numeric {
    #[allow(clippy::cast_precision_loss)]
    fn of(domain: &SearchParameter) -> Option<Self> {
        match domain {
            SearchParameter::FloatRange {
                low,
                high,
                step,
                log,
            } => Some(Self {
                lo: if *log { low.ln() } else { *low },
                hi: if *log { high.ln() } else { *high },
                log: *log,
                origin: *low,
                step: *step,
                integer: false,
            }),
            SearchParameter::IntRange { low, high, step } => Some(Self {
                lo: *low as f64,
                hi: *high as f64,
                log: false,
                origin: *low as f64,
                step: Some(*step as f64),
                integer: true,
            }),
            _ => None,
        }
    }

    fn to_internal(self, value: &OptionValue) -> Option<f64> {
        let v = value.as_f64()?;
        let x = if self.log {
            if v <= 0.0 {
                return None;
            }
            v.ln()
        } else {
            v
        };
        (x >= self.lo - 1e-12 && x <= self.hi + 1e-12).then_some(x)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn to_value(self, x: f64) -> OptionValue {
        let mut v = if self.log { x.exp() } else { x };
        let upper = if self.log { self.hi.exp() } else { self.hi };
        if let Some(step) = self.step {
            let k = ((v - self.origin) / step).round();
            v = k.mul_add(step, self.origin);
            while v > upper + 1e-9 {
                v -= step;
            }
        }
        let lower = self.origin;
        v = v.clamp(lower, upper.max(lower));
        if self.integer {
            OptionValue::Int(v.round() as i64)
        } else {
            OptionValue::Float(v)
        }
    }

    fn bandwidth(self, n: usize) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let n = n as f64;
        ((self.hi - self.lo) / (n + 1.0).sqrt()).max(1e-12)
    }

    fn kernels(self, observed: &[OptionValue]) -> Vec<Normal> {
        let internal: Vec<f64> = observed.iter().filter_map(|v| self.to_internal(v)).collect();
        let sigma = self.bandwidth(internal.len());
        internal
            .into_iter()
            .filter_map(|mu| Normal::new(mu, sigma).ok())
            .collect()
    }

    fn sample<R: Rng + ?Sized>(self, observed: &[OptionValue], rng: &mut R) -> OptionValue {
        if (self.hi - self.lo).abs() < f64::EPSILON {
            return self.to_value(self.lo);
        }
        let kernels = self.kernels(observed);
        let pick = rng.gen_range(0..=kernels.len());
        let x = match kernels.get(pick) {
            None => rng.gen_range(self.lo..=self.hi),
            Some(kernel) => {
                let u: f64 = rng.gen::<f64>().clamp(1e-12, 1.0 - 1e-12);
                kernel.inverse_cdf(u).clamp(self.lo, self.hi)
            }
        };
        self.to_value(x)
    }

    fn log_density(self, observed: &[OptionValue], value: &OptionValue) -> f64 {
        let Some(x) = self.to_internal(value) else {
            return f64::NEG_INFINITY;
        };
        let width = self.hi - self.lo;
        if width.abs() < f64::EPSILON {
            return 0.0;
        }
        let kernels = self.kernels(observed);
        let mass: f64 = kernels.iter().map(|k| k.pdf(x)).sum::<f64>() + 1.0 / width;
        #[allow(clippy::cast_precision_loss)]
        let components = (kernels.len() + 1) as f64;
        (mass / components).ln()
    }
}

fn discrete_values(domain: &SearchParameter) -> Option<Vec<OptionValue>> {
    match domain.cardinality() {
        Some(n) if n <= MAX_CATEGORICAL_VALUES => domain.values(),
        _ if Numeric::of(domain).is_none() => domain.values(),
        _ => None,
    }
}

#[allow(clippy::cast_precision_loss)]
fn smoothed_weights(values: &[OptionValue], observed: &[OptionValue]) -> Vec<f64> {
    values
        .iter()
        .map(|v| observed.iter().filter(|o| *o == v).count() as f64 + 1.0)
        .collect()
}

fn sample_from<R: Rng + ?Sized>(
    domain: &SearchParameter,
    observed: &[OptionValue],
    rng: &mut R,
) -> OptionValue {
    if let Some(values) = discrete_values(domain) {
        let weights = smoothed_weights(&values, observed);
        return WeightedIndex::new(&weights)
            .ok()
            .and_then(|index| values.get(index.sample(rng)).cloned())
            .unwrap_or_else(|| domain.sample(rng));
    }
    match Numeric::of(domain) {
        None => domain.sample(rng),
        Some(n) => n.sample(observed, rng),
    }
}

fn log_density(domain: &SearchParameter, observed: &[OptionValue], value: &OptionValue) -> f64 {
    if let Some(values) = discrete_values(domain) {
        let weights = smoothed_weights(&values, observed);
        let total: f64 = weights.iter().sum();
        return values
            .iter()
            .position(|v| v == value)
            .map_or(f64::NEG_INFINITY, |i| (weights[i] / total).ln());
    }
    Numeric::of(domain).map_or(0.0, |n| n.log_density(observed, value))
}

impl SearchAlgorithm for TpeSearch {
    fn name(&self) -> &str {
        "tpe"
    }

    fn propose(&mut self, history: &[Trial]) -> Option<SearchPoint> {
        if self.exhausted() {
            return None;
        }
        let succeeded = history.iter().filter(|t| t.result.is_some()).count();
        if history.len() < self.n_startup || succeeded == 0 {
            return self.random_unseen();
        }

        let (good, bad) = self.split(history);
        let mut best: Option<(f64, SearchPoint)> = None;
        for _ in 0..self.n_candidates {
            let Some(candidate) = self.draw_candidate(&good) else {
                break;
            };
            if self.seen.contains(&candidate.fingerprint()) {
                continue;
            }
            let score = self.score(&candidate, &good, &bad);
            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((score, candidate));
            }
        }
        match best {
            Some((_, point)) => {
                self.seen.insert(point.fingerprint());
                Some(point)
            }
            None => self.random_unseen(),
        }
    }
}
