//! Cost model
//!
//! Load profiles quantify per-resource work (CPU, RAM, disk, net) as
//! probabilistic intervals. A platform-specific converter turns a load
//! profile into a time estimate, and a second converter turns time into
//! monetary cost. Estimators come from three layers, later overriding
//! earlier: operator built-ins, platform defaults from the configuration,
//! and programmatic user overrides.

use std::collections::HashMap;
use std::sync::Arc;

use rheem_common::{
    CardinalityEstimate, Configuration, LoadEstimate, PlatformId, ProbabilisticDoubleInterval,
    Result, RheemError, TimeEstimate,
};
use serde::Deserialize;

use crate::optimizer::load_expr::LoadExpr;

// ============================================================================
// Load profiles
// ============================================================================

/// Per-resource loads of one operator execution.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadProfile {
    pub cpu: LoadEstimate,
    pub ram: LoadEstimate,
    pub disk: LoadEstimate,
    pub net: LoadEstimate,
    /// Startup overhead in milliseconds, added verbatim to the time.
    pub overhead_millis: u64,
}

impl LoadProfile {
    pub fn zero() -> Self {
        Self {
            cpu: LoadEstimate::zero(),
            ram: LoadEstimate::zero(),
            disk: LoadEstimate::zero(),
            net: LoadEstimate::zero(),
            overhead_millis: 0,
        }
    }

    pub fn plus(&self, other: &LoadProfile) -> LoadProfile {
        LoadProfile {
            cpu: self.cpu.plus(&other.cpu),
            ram: self.ram.plus(&other.ram),
            disk: self.disk.plus(&other.disk),
            net: self.net.plus(&other.net),
            overhead_millis: self.overhead_millis + other.overhead_millis,
        }
    }
}

// ============================================================================
// Load profile estimators
// ============================================================================

/// Estimates one resource from input/output cardinalities.
#[derive(Clone)]
pub enum ResourceEstimator {
    /// Parsed from a configuration expression.
    Formula(LoadExpr),
    /// Closed-form function; used by built-in operator estimators.
    Closure(Arc<dyn Fn(&[u64], &[u64]) -> u64 + Send + Sync>),
}

impl std::fmt::Debug for ResourceEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceEstimator::Formula(expr) => write!(f, "Formula({expr})"),
            ResourceEstimator::Closure(_) => write!(f, "Closure"),
        }
    }
}

impl ResourceEstimator {
    pub fn linear(units_per_element: u64) -> Self {
        ResourceEstimator::Closure(Arc::new(move |inputs, _| {
            inputs.iter().sum::<u64>() * units_per_element
        }))
    }

    fn evaluate(
        &self,
        inputs: &[u64],
        outputs: &[u64],
        resolve: &dyn Fn(&str) -> Option<f64>,
    ) -> u64 {
        match self {
            ResourceEstimator::Formula(expr) => {
                expr.evaluate(inputs, outputs, resolve).max(0.0).round() as u64
            }
            ResourceEstimator::Closure(f) => f(inputs, outputs),
        }
    }
}

/// Estimates a complete load profile for one operator.
#[derive(Debug, Clone)]
pub struct LoadProfileEstimator {
    pub cpu: Option<ResourceEstimator>,
    pub ram: Option<ResourceEstimator>,
    pub disk: Option<ResourceEstimator>,
    pub net: Option<ResourceEstimator>,
    pub overhead_millis: u64,
    /// Confidence attached to this estimator's own modeling error.
    pub confidence: f64,
}

impl LoadProfileEstimator {
    pub fn cpu_only(estimator: ResourceEstimator) -> Self {
        Self {
            cpu: Some(estimator),
            ram: None,
            disk: None,
            net: None,
            overhead_millis: 0,
            confidence: 0.9,
        }
    }

    /// Parse the JSON value of a `rheem.<platform>.<op>.load` key, e.g.
    /// `{"cpu": "700*in0 + ${b}", "net": "0", "overhead": 10, "p": 0.9}`.
    pub fn from_json_spec(spec: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct Spec {
            cpu: Option<String>,
            ram: Option<String>,
            disk: Option<String>,
            net: Option<String>,
            #[serde(default)]
            overhead: u64,
            #[serde(default = "default_confidence")]
            p: f64,
        }
        fn default_confidence() -> f64 {
            0.9
        }

        let spec: Spec = serde_json::from_str(spec)
            .map_err(|e| RheemError::Configuration(format!("invalid load profile spec: {e}")))?;
        let parse = |expr: Option<String>| -> Result<Option<ResourceEstimator>> {
            match expr {
                Some(expr) => Ok(Some(ResourceEstimator::Formula(LoadExpr::parse(&expr)?))),
                None => Ok(None),
            }
        };
        Ok(Self {
            cpu: parse(spec.cpu)?,
            ram: parse(spec.ram)?,
            disk: parse(spec.disk)?,
            net: parse(spec.net)?,
            overhead_millis: spec.overhead,
            confidence: spec.p,
        })
    }

    /// Names of all `${...}` variables across the resource formulas.
    pub fn collect_variables(&self, into: &mut std::collections::BTreeSet<String>) {
        for estimator in [&self.cpu, &self.ram, &self.disk, &self.net].into_iter().flatten() {
            if let ResourceEstimator::Formula(expr) = estimator {
                expr.collect_variables(into);
            }
        }
    }

    /// Estimate the load profile. The interval evaluates each formula at the
    /// cardinality lower bounds and upper bounds respectively.
    pub fn estimate(
        &self,
        inputs: &[CardinalityEstimate],
        outputs: &[CardinalityEstimate],
        resolve: &dyn Fn(&str) -> Option<f64>,
    ) -> LoadProfile {
        let in_lower: Vec<u64> = inputs.iter().map(|c| c.lower).collect();
        let in_upper: Vec<u64> = inputs.iter().map(|c| c.upper).collect();
        let out_lower: Vec<u64> = outputs.iter().map(|c| c.lower).collect();
        let out_upper: Vec<u64> = outputs.iter().map(|c| c.upper).collect();
        let probability = inputs
            .iter()
            .chain(outputs.iter())
            .map(|c| c.correctness_prob)
            .fold(self.confidence, f64::min);

        let estimate_resource = |estimator: &Option<ResourceEstimator>| match estimator {
            Some(estimator) => {
                let lower = estimator.evaluate(&in_lower, &out_lower, resolve);
                let upper = estimator.evaluate(&in_upper, &out_upper, resolve);
                LoadEstimate::new(lower.min(upper), lower.max(upper), probability)
            }
            None => LoadEstimate::zero(),
        };

        LoadProfile {
            cpu: estimate_resource(&self.cpu),
            ram: estimate_resource(&self.ram),
            disk: estimate_resource(&self.disk),
            net: estimate_resource(&self.net),
            overhead_millis: self.overhead_millis,
        }
    }
}

// ============================================================================
// Estimator resolution
// ============================================================================

/// Programmatic user overrides, highest-priority estimator layer.
#[derive(Debug, Clone, Default)]
pub struct LoadEstimatorOverrides {
    overrides: HashMap<String, LoadProfileEstimator>,
}

impl LoadEstimatorOverrides {
    pub fn insert(&mut self, configuration_key: impl Into<String>, estimator: LoadProfileEstimator) {
        self.overrides.insert(configuration_key.into(), estimator);
    }

    pub fn get(&self, configuration_key: &str) -> Option<&LoadProfileEstimator> {
        self.overrides.get(configuration_key)
    }
}

/// Resolve the effective estimator for an execution operator: user override
/// beats the configuration entry, which beats the operator's built-in.
/// Falls back to a zero-load estimator with a one-time warning.
pub fn resolve_load_estimator(
    configuration_key: Option<&str>,
    built_in: Option<LoadProfileEstimator>,
    configuration: &Configuration,
    overrides: &LoadEstimatorOverrides,
) -> Result<LoadProfileEstimator> {
    if let Some(key) = configuration_key {
        if let Some(estimator) = overrides.get(key) {
            return Ok(estimator.clone());
        }
        if let Some(spec) = configuration.get(key) {
            return LoadProfileEstimator::from_json_spec(spec);
        }
    }
    if let Some(estimator) = built_in {
        return Ok(estimator);
    }
    tracing::warn!(
        key = configuration_key.unwrap_or("<unkeyed>"),
        "no load profile estimator found, falling back to zero load"
    );
    Ok(LoadProfileEstimator {
        cpu: None,
        ram: None,
        disk: None,
        net: None,
        overhead_millis: 0,
        confidence: 0.5,
    })
}

// ============================================================================
// Converters
// ============================================================================

/// Converts a single resource load into milliseconds: `load / units_per_ms
/// + offset`.
#[derive(Debug, Clone, Copy)]
pub struct LoadToTimeConverter {
    pub units_per_millis: f64,
    pub offset_millis: f64,
}

impl LoadToTimeConverter {
    pub fn linear(units_per_millis: f64) -> Self {
        Self {
            units_per_millis: units_per_millis.max(f64::MIN_POSITIVE),
            offset_millis: 0.0,
        }
    }

    fn convert(&self, load: &LoadEstimate) -> TimeEstimate {
        let lower = (load.lower as f64 / self.units_per_millis + self.offset_millis).round() as u64;
        let upper = (load.upper as f64 / self.units_per_millis + self.offset_millis).round() as u64;
        TimeEstimate::new(lower, upper, load.correctness_prob)
    }
}

/// Converts a full load profile into a time estimate. The default combiner
/// sums the cpu, disk and net contributions and floors the result at
/// `TimeEstimate::MINIMUM`.
#[derive(Debug, Clone, Copy)]
pub struct LoadProfileToTimeConverter {
    pub cpu: LoadToTimeConverter,
    pub disk: LoadToTimeConverter,
    pub net: LoadToTimeConverter,
}

impl LoadProfileToTimeConverter {
    pub fn new(cpu: LoadToTimeConverter, disk: LoadToTimeConverter, net: LoadToTimeConverter) -> Self {
        Self { cpu, disk, net }
    }

    /// Read the converter for a platform from the configuration keys
    /// `rheem.<platform>.speed.{cpu,disk,net}` (load units per ms).
    pub fn from_configuration(platform: &PlatformId, configuration: &Configuration) -> Self {
        let read = |resource: &str, default: f64| {
            configuration.get_f64(&format!("rheem.{platform}.speed.{resource}"), default)
        };
        Self {
            cpu: LoadToTimeConverter::linear(read("cpu", 1_000_000.0)),
            disk: LoadToTimeConverter::linear(read("disk", 500_000.0)),
            net: LoadToTimeConverter::linear(read("net", 100_000.0)),
        }
    }

    pub fn convert(&self, profile: &LoadProfile) -> TimeEstimate {
        let combined = self
            .cpu
            .convert(&profile.cpu)
            .plus(&self.disk.convert(&profile.disk))
            .plus(&self.net.convert(&profile.net))
            .plus(&TimeEstimate::exact(profile.overhead_millis));
        // Floor, not an addend: only zero-load estimates are lifted.
        TimeEstimate::new(
            combined.lower_millis.max(TimeEstimate::MINIMUM.lower_millis),
            combined.upper_millis.max(TimeEstimate::MINIMUM.upper_millis),
            combined.correctness_prob,
        )
    }
}

/// Converts time into monetary cost: `time * rate_per_millis + fix_costs`.
#[derive(Debug, Clone, Copy)]
pub struct TimeToCostConverter {
    pub fix_costs: f64,
    pub rate_per_millis: f64,
}

impl TimeToCostConverter {
    pub fn from_configuration(platform: &PlatformId, configuration: &Configuration) -> Self {
        Self {
            fix_costs: configuration.get_f64(&format!("rheem.{platform}.cost.fix"), 0.0),
            rate_per_millis: configuration.get_f64(&format!("rheem.{platform}.cost.per-ms"), 1.0),
        }
    }

    pub fn convert(&self, time: &TimeEstimate) -> ProbabilisticDoubleInterval {
        self.convert_without_fix_costs(time).shift(self.fix_costs)
    }

    pub fn convert_without_fix_costs(&self, time: &TimeEstimate) -> ProbabilisticDoubleInterval {
        ProbabilisticDoubleInterval::new(
            time.lower_millis as f64 * self.rate_per_millis,
            time.upper_millis as f64 * self.rate_per_millis,
            time.correctness_prob,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_vars(_: &str) -> Option<f64> {
        None
    }

    #[test]
    fn test_estimate_interval_from_formula() {
        let estimator = LoadProfileEstimator::from_json_spec(r#"{"cpu": "100 * in0"}"#).unwrap();
        let profile = estimator.estimate(
            &[CardinalityEstimate::new(10, 20, 1.0)],
            &[],
            &no_vars,
        );
        assert_eq!(profile.cpu.lower, 1_000);
        assert_eq!(profile.cpu.upper, 2_000);
        assert!((profile.cpu.correctness_prob - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_time_conversion_floors_at_minimum() {
        let converter = LoadProfileToTimeConverter::new(
            LoadToTimeConverter::linear(1000.0),
            LoadToTimeConverter::linear(1000.0),
            LoadToTimeConverter::linear(1000.0),
        );
        let time = converter.convert(&LoadProfile::zero());
        assert_eq!(time.lower_millis, 1);
        assert_eq!(time.upper_millis, 1);

        // The floor only lifts zero estimates; real loads pass through
        // unchanged.
        let mut profile = LoadProfile::zero();
        profile.cpu = LoadEstimate::exact(500_000);
        let time = converter.convert(&profile);
        assert_eq!(time.lower_millis, 500);
        assert_eq!(time.upper_millis, 500);
    }

    #[test]
    fn test_sequential_compositionality() {
        // Two operators in sequence: the combined time is the sum of the
        // individual intervals with the minimum probability.
        let converter = LoadProfileToTimeConverter::new(
            LoadToTimeConverter::linear(1000.0),
            LoadToTimeConverter::linear(1000.0),
            LoadToTimeConverter::linear(1000.0),
        );
        let mut profile_a = LoadProfile::zero();
        profile_a.cpu = LoadEstimate::new(10_000, 20_000, 0.9);
        let mut profile_b = LoadProfile::zero();
        profile_b.cpu = LoadEstimate::new(5_000, 5_000, 0.7);

        let time_a = converter.convert(&profile_a);
        let time_b = converter.convert(&profile_b);
        let sum = time_a.plus(&time_b);
        assert_eq!(sum.lower_millis, time_a.lower_millis + time_b.lower_millis);
        assert!((sum.correctness_prob - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_resolution_priority() {
        let mut configuration = Configuration::new();
        configuration.set("rheem.test.map.load", r#"{"cpu": "5 * in0"}"#);

        let built_in = LoadProfileEstimator::cpu_only(ResourceEstimator::linear(1));
        let mut overrides = LoadEstimatorOverrides::default();

        // Configuration beats built-in.
        let resolved = resolve_load_estimator(
            Some("rheem.test.map.load"),
            Some(built_in.clone()),
            &configuration,
            &overrides,
        )
        .unwrap();
        let profile = resolved.estimate(&[CardinalityEstimate::exact(10)], &[], &no_vars);
        assert_eq!(profile.cpu.lower, 50);

        // Override beats configuration.
        overrides.insert(
            "rheem.test.map.load",
            LoadProfileEstimator::cpu_only(ResourceEstimator::linear(7)),
        );
        let resolved = resolve_load_estimator(
            Some("rheem.test.map.load"),
            Some(built_in),
            &configuration,
            &overrides,
        )
        .unwrap();
        let profile = resolved.estimate(&[CardinalityEstimate::exact(10)], &[], &no_vars);
        assert_eq!(profile.cpu.lower, 70);
    }

    #[test]
    fn test_cost_conversion() {
        let converter = TimeToCostConverter {
            fix_costs: 10.0,
            rate_per_millis: 2.0,
        };
        let cost = converter.convert(&TimeEstimate::new(100, 200, 0.8));
        assert!((cost.lower - 210.0).abs() < 1e-9);
        assert!((cost.upper - 410.0).abs() < 1e-9);
    }
}
