//! Per-subject z-scoring and feature selection ahead of the mapper.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::config::ReductionType;
use crate::error::{PipelineError, PipelineResult};
use crate::observation::Observation;

fn check_std(feature: &str, std: f64) -> PipelineResult<()> {
    if std > 0.0 && std.is_finite() {
        Ok(())
    } else {
        Err(PipelineError::ZeroStd {
            feature: feature.to_string(),
        })
    }
}

/// Elementwise `(x - mean) / std`. A non-positive or non-finite std is a
/// configuration error, never a NaN in the output.
pub fn normalize(values: &[f64], mean: &[f64], std: &[f64]) -> PipelineResult<Vec<f64>> {
    if values.len() != mean.len() || values.len() != std.len() {
        return Err(PipelineError::MalformedMapping(format!(
            "normalization expects {} values, mean has {}, std has {}",
            values.len(),
            mean.len(),
            std.len()
        )));
    }
    values
        .iter()
        .zip(mean.iter().zip(std))
        .enumerate()
        .map(|(i, (x, (m, s)))| {
            check_std(&format!("#{i}"), *s)?;
            Ok((x - m) / s)
        })
        .collect()
}

/// Normalization statistics keyed by feature name
#[derive(Debug, Clone)]
pub struct Normalizer {
    names: Arc<[String]>,
    mean: Vec<f64>,
    std: Vec<f64>,
}

impl Normalizer {
    pub fn new(names: Vec<String>, mean: Vec<f64>, std: Vec<f64>) -> PipelineResult<Self> {
        if names.len() != mean.len() || names.len() != std.len() {
            return Err(PipelineError::MalformedMapping(format!(
                "{} features but {} means and {} stds",
                names.len(),
                mean.len(),
                std.len()
            )));
        }
        for (name, s) in names.iter().zip(&std) {
            check_std(name, *s)?;
        }
        Ok(Self {
            names: names.into(),
            mean,
            std,
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Z-score the normalized features of `obs`, in normalizer order
    pub fn apply(&self, obs: &Observation) -> PipelineResult<Observation> {
        let values = obs.select(&self.names)?;
        let z = normalize(&values, &self.mean, &self.std)?;
        Ok(Observation::new(self.names.clone(), z))
    }
}

/// Features fed to the reducers: one list for every output, or one list per output
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FeatureList {
    Shared(Vec<String>),
    PerOutput(BTreeMap<String, Vec<String>>),
}

impl FeatureList {
    /// Feature count seen by `output`'s reducer
    pub fn width(&self, output: &str) -> Option<usize> {
        match self {
            FeatureList::Shared(list) => Some(list.len()),
            FeatureList::PerOutput(map) => map.get(output).map(Vec::len),
        }
    }
}

/// Output of the reduction stage
#[derive(Debug, Clone, PartialEq)]
pub enum ReducedFeatures {
    Shared(Vec<f64>),
    PerOutput(BTreeMap<String, Vec<f64>>),
}

impl ReducedFeatures {
    /// Feature row for one output channel
    pub fn for_output(&self, output: &str) -> PipelineResult<&[f64]> {
        match self {
            ReducedFeatures::Shared(row) => Ok(row),
            ReducedFeatures::PerOutput(map) => map.get(output).map(Vec::as_slice).ok_or_else(|| {
                PipelineError::MalformedMapping(format!("no feature list for output `{output}`"))
            }),
        }
    }

    pub fn shared(&self) -> PipelineResult<&[f64]> {
        match self {
            ReducedFeatures::Shared(row) => Ok(row),
            ReducedFeatures::PerOutput(_) => Err(PipelineError::MalformedMapping(
                "shared model needs a shared feature list".to_string(),
            )),
        }
    }
}

/// Select the features the mapper consumes.
///
/// `full` keeps every normalized feature. `signals` picks the named subsets.
/// `bones` is reserved for body-part level selection and currently passes
/// everything through like `full`.
pub fn reduce(
    normalized: &Observation,
    mode: ReductionType,
    features: &FeatureList,
) -> PipelineResult<ReducedFeatures> {
    match mode {
        ReductionType::Full | ReductionType::Bones => {
            Ok(ReducedFeatures::Shared(normalized.as_slice().to_vec()))
        }
        ReductionType::Signals => match features {
            FeatureList::Shared(list) => Ok(ReducedFeatures::Shared(normalized.select(list)?)),
            FeatureList::PerOutput(map) => {
                let mut rows = BTreeMap::new();
                for (output, list) in map {
                    rows.insert(output.clone(), normalized.select(list)?);
                }
                Ok(ReducedFeatures::PerOutput(rows))
            }
        },
    }
}
