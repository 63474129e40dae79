use std::collections::BTreeMap;
use std::f64::consts::FRAC_PI_2;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::command::CommandVector;
use crate::config::{ControlStyle, InputDevice, ReductionType, RuntimeConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::normalize::{reduce, FeatureList, Normalizer};
use crate::observation::Observation;

/// Shared-model output is in degrees; commands are normalized by this divisor
pub const DEGREES_PER_COMMAND_UNIT: f64 = 90.0;

/// Remote stick centre and half-range per used axis
const REMOTE_CENTER: [f64; 2] = [120.0, 124.0];
const REMOTE_RANGE: [f64; 2] = [107.0, 114.0];

const IMU_FULL_TURN_DEG: f64 = 360.0;

fn check_finite(values: &[f64], stage: &'static str) -> PipelineResult<()> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(PipelineError::NonFinite(stage))
    }
}

/// Features -> features (dimensionality reduction)
pub trait Reducer: Send + Sync {
    fn input_dim(&self) -> usize;
    fn output_dim(&self) -> usize;
    fn transform(&self, features: &[f64]) -> PipelineResult<Vec<f64>>;
}

/// Features -> one output value
pub trait Predictor: Send + Sync {
    fn input_dim(&self) -> usize;
    fn predict(&self, features: &[f64]) -> PipelineResult<f64>;
}

fn check_dim(expected: usize, got: usize, what: &str) -> PipelineResult<()> {
    if expected == got {
        Ok(())
    } else {
        Err(PipelineError::MalformedMapping(format!(
            "{what} expects {expected} inputs, got {got}"
        )))
    }
}

/// Centre, scale, then rotate: `((x - mean) / scale) * rotation`.
/// `rotation` has one row per input feature and one column per component.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LinearProjection {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
    pub rotation: Vec<Vec<f64>>,
}

impl LinearProjection {
    fn validate(&self) -> PipelineResult<()> {
        let n = self.rotation.len();
        if n == 0 {
            return Err(PipelineError::MalformedMapping(
                "projection has no rows".to_string(),
            ));
        }
        if self.mean.len() != n || self.scale.len() != n {
            return Err(PipelineError::MalformedMapping(format!(
                "projection has {} rows but {} means and {} scales",
                n,
                self.mean.len(),
                self.scale.len()
            )));
        }
        let k = self.rotation[0].len();
        if k == 0 || self.rotation.iter().any(|row| row.len() != k) {
            return Err(PipelineError::MalformedMapping(
                "projection rows must be non-empty and equally long".to_string(),
            ));
        }
        for (i, s) in self.scale.iter().enumerate() {
            if *s == 0.0 || !s.is_finite() {
                return Err(PipelineError::ZeroStd {
                    feature: format!("projection input #{i}"),
                });
            }
        }
        let all = self.mean.iter().chain(self.rotation.iter().flatten());
        if all.copied().any(|v| !v.is_finite()) {
            return Err(PipelineError::MalformedMapping(
                "projection holds non-finite values".to_string(),
            ));
        }
        Ok(())
    }
}

impl Reducer for LinearProjection {
    fn input_dim(&self) -> usize {
        self.rotation.len()
    }

    fn output_dim(&self) -> usize {
        self.rotation.first().map_or(0, Vec::len)
    }

    fn transform(&self, features: &[f64]) -> PipelineResult<Vec<f64>> {
        check_dim(self.input_dim(), features.len(), "projection")?;
        let mut out = vec![0.0; self.output_dim()];
        for (i, x) in features.iter().enumerate() {
            let centred = (x - self.mean[i]) / self.scale[i];
            for (o, r) in out.iter_mut().zip(&self.rotation[i]) {
                *o += centred * r;
            }
        }
        Ok(out)
    }
}

/// `intercept + coefficients . x`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LinearRegressor {
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl Predictor for LinearRegressor {
    fn input_dim(&self) -> usize {
        self.coefficients.len()
    }

    fn predict(&self, features: &[f64]) -> PipelineResult<f64> {
        check_dim(self.input_dim(), features.len(), "linear regressor")?;
        Ok(self.intercept
            + self
                .coefficients
                .iter()
                .zip(features)
                .map(|(c, x)| c * x)
                .sum::<f64>())
    }
}

/// Linear model over the powers `x, x^2 .. x^degree` of every input,
/// feature-major: coefficients for feature 0 come first.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PolynomialRegressor {
    pub degree: u32,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl PolynomialRegressor {
    fn expand(&self, features: &[f64]) -> Vec<f64> {
        features
            .iter()
            .flat_map(|x| (1..=self.degree as i32).map(move |p| x.powi(p)))
            .collect()
    }
}

impl Predictor for PolynomialRegressor {
    fn input_dim(&self) -> usize {
        match self.degree {
            0 => 0,
            d => self.coefficients.len() / d as usize,
        }
    }

    fn predict(&self, features: &[f64]) -> PipelineResult<f64> {
        check_dim(self.input_dim(), features.len(), "polynomial regressor")?;
        let expanded = self.expand(features);
        Ok(self.intercept
            + self
                .coefficients
                .iter()
                .zip(&expanded)
                .map(|(c, x)| c * x)
                .sum::<f64>())
    }
}

/// Reducer as stored in the mapping artifact
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReducerSpec {
    LinearProjection(LinearProjection),
}

impl ReducerSpec {
    fn build(self) -> PipelineResult<Box<dyn Reducer>> {
        match self {
            ReducerSpec::LinearProjection(p) => {
                p.validate()?;
                Ok(Box::new(p))
            }
        }
    }
}

/// Regressor as stored in the mapping artifact
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegressorSpec {
    Linear(LinearRegressor),
    Polynomial(PolynomialRegressor),
}

impl RegressorSpec {
    fn build(self) -> PipelineResult<Box<dyn Predictor>> {
        match self {
            RegressorSpec::Linear(r) => {
                if r.coefficients.is_empty() {
                    return Err(PipelineError::MalformedMapping(
                        "linear regressor has no coefficients".to_string(),
                    ));
                }
                Ok(Box::new(r))
            }
            RegressorSpec::Polynomial(r) => {
                if r.degree == 0
                    || r.coefficients.is_empty()
                    || r.coefficients.len() % r.degree as usize != 0
                {
                    return Err(PipelineError::MalformedMapping(format!(
                        "polynomial regressor of degree {} cannot use {} coefficients",
                        r.degree,
                        r.coefficients.len()
                    )));
                }
                Ok(Box::new(r))
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputModelSpec {
    pub reducer: ReducerSpec,
    pub regressor: RegressorSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SharedModelSpec {
    pub reducer: ReducerSpec,
    /// Per reduced component, as observed during calibration
    pub min_values: Vec<f64>,
    pub max_values: Vec<f64>,
    pub regressors: BTreeMap<String, RegressorSpec>,
}

/// Fitted calibration artifact, as persisted by the fitting tools
#[derive(Debug, Clone, Deserialize)]
pub struct CalibrationMapping {
    pub features: Vec<String>,
    pub normalization_mean: Vec<f64>,
    pub normalization_std: Vec<f64>,
    pub feature_list: FeatureList,
    /// Per-output models (`maxmin`)
    #[serde(default)]
    pub outputs: BTreeMap<String, OutputModelSpec>,
    /// Shared model (`new`)
    #[serde(default)]
    pub shared: Option<SharedModelSpec>,
}

impl CalibrationMapping {
    pub fn from_file(path: &Path) -> PipelineResult<Self> {
        if !path.exists() {
            return Err(PipelineError::MissingMapping(path.display().to_string()));
        }
        let data = fs::read_to_string(path).map_err(|e| {
            PipelineError::MissingMapping(format!("{}: {e}", path.display()))
        })?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> PipelineResult<Self> {
        serde_json::from_str(data).map_err(|e| PipelineError::MalformedMapping(e.to_string()))
    }
}

/// Maps a raw observation to command channels
enum MapperKind {
    Simple(SimpleMapper),
    Maxmin(MaxminMapper),
    Shared(SharedMapper),
}

struct SimpleMapper {
    device: InputDevice,
    /// Root body part, for pose devices
    root: Option<String>,
    remote_gain: f64,
    imu_gain: f64,
}

impl SimpleMapper {
    fn pick(obs: &Observation, name: &str) -> PipelineResult<f64> {
        obs.get(name)
            .ok_or_else(|| PipelineError::MissingFeature(name.to_string()))
    }

    fn map(&self, obs: &Observation) -> PipelineResult<[f64; 2]> {
        let out = match self.device {
            InputDevice::Motive | InputDevice::Imus => {
                let root = self.root.as_deref().unwrap_or_default();
                let scaled = |angle: &str| -> PipelineResult<f64> {
                    Ok(-Self::pick(obs, &format!("{angle}_{root}"))? / FRAC_PI_2)
                };
                let pitch = scaled("pitch")?;
                let roll = scaled("roll")?;
                let yaw = scaled("yaw")?;
                [pitch - 2.0 * yaw, roll]
            }
            InputDevice::Remote => {
                let raw = [Self::pick(obs, "remote4")?, Self::pick(obs, "remote3")?];
                [
                    (raw[0] - REMOTE_CENTER[0]) / (REMOTE_RANGE[0] / self.remote_gain),
                    (raw[1] - REMOTE_CENTER[1]) / (REMOTE_RANGE[1] / self.remote_gain),
                ]
            }
            InputDevice::Imu => {
                let divisor = IMU_FULL_TURN_DEG / self.imu_gain;
                [
                    Self::pick(obs, "yaw_imu")? / divisor,
                    Self::pick(obs, "pitch_imu")? / divisor,
                ]
            }
        };
        check_finite(&out, "simple command")?;
        Ok(out)
    }
}

struct OutputModel {
    reducer: Box<dyn Reducer>,
    regressor: Box<dyn Predictor>,
}

struct MaxminMapper {
    normalizer: Normalizer,
    feature_list: FeatureList,
    reduction: ReductionType,
    models: BTreeMap<String, OutputModel>,
}

struct SharedMapper {
    normalizer: Normalizer,
    feature_list: FeatureList,
    reduction: ReductionType,
    reducer: Box<dyn Reducer>,
    min_values: Vec<f64>,
    max_values: Vec<f64>,
    regressors: BTreeMap<String, Box<dyn Predictor>>,
}

/// Clamp each component to its calibration bounds
pub fn clamp_to_bounds(values: &[f64], min: &[f64], max: &[f64]) -> PipelineResult<Vec<f64>> {
    check_finite(values, "reduced features")?;
    Ok(values
        .iter()
        .zip(min.iter().zip(max))
        .map(|(v, (lo, hi))| v.clamp(*lo, *hi))
        .collect())
}

/// Reducer input width for a given output under the active reduction mode
fn reducer_width(
    reduction: ReductionType,
    feature_list: &FeatureList,
    n_features: usize,
    output: &str,
) -> Option<usize> {
    match reduction {
        ReductionType::Full | ReductionType::Bones => Some(n_features),
        ReductionType::Signals => feature_list.width(output),
    }
}

pub struct ControlMapper {
    style: ControlStyle,
    outputs: Vec<String>,
    kind: MapperKind,
}

impl ControlMapper {
    /// Simple mode, no fitted model
    pub fn simple(config: &RuntimeConfig) -> Self {
        Self {
            style: ControlStyle::Simple,
            outputs: config.regression_outputs.clone(),
            kind: MapperKind::Simple(SimpleMapper {
                device: config.input_device,
                root: config.body_parts.first().map(|p| p.name.clone()),
                remote_gain: config.remote_gain,
                imu_gain: config.imu_gain,
            }),
        }
    }

    /// Build the configured mapper, loading the artifact at `mapping_path` for learned styles
    pub fn from_config(config: &RuntimeConfig, mapping_path: &Path) -> PipelineResult<Self> {
        match config.control_style {
            ControlStyle::Simple => Ok(Self::simple(config)),
            _ => {
                let mapping = CalibrationMapping::from_file(mapping_path)?;
                Self::learned(config, mapping)
            }
        }
    }

    /// Build a `maxmin` or `new` mapper from an already-loaded artifact
    pub fn learned(config: &RuntimeConfig, mapping: CalibrationMapping) -> PipelineResult<Self> {
        let n_features = mapping.features.len();
        let normalizer = Normalizer::new(
            mapping.features,
            mapping.normalization_mean,
            mapping.normalization_std,
        )?;
        let reduction = config.dim_reduction;
        let feature_list = mapping.feature_list;

        let kind = match config.control_style {
            ControlStyle::Simple => return Ok(Self::simple(config)),
            ControlStyle::Maxmin => {
                if mapping.outputs.is_empty() {
                    return Err(PipelineError::MalformedMapping(
                        "maxmin mapping has no per-output models".to_string(),
                    ));
                }
                let mut models = BTreeMap::new();
                for (name, spec) in mapping.outputs {
                    let reducer = spec.reducer.build()?;
                    let regressor = spec.regressor.build()?;
                    if let Some(width) = reducer_width(reduction, &feature_list, n_features, &name)
                    {
                        check_dim(reducer.input_dim(), width, &format!("`{name}` reducer"))?;
                    }
                    check_dim(
                        regressor.input_dim(),
                        reducer.output_dim(),
                        &format!("`{name}` regressor"),
                    )?;
                    models.insert(name, OutputModel { reducer, regressor });
                }
                MapperKind::Maxmin(MaxminMapper {
                    normalizer,
                    feature_list,
                    reduction,
                    models,
                })
            }
            ControlStyle::New => {
                let spec = mapping.shared.ok_or_else(|| {
                    PipelineError::MalformedMapping("new mapping has no shared model".to_string())
                })?;
                if reduction == ReductionType::Signals
                    && matches!(feature_list, FeatureList::PerOutput(_))
                {
                    return Err(PipelineError::MalformedMapping(
                        "shared model needs a shared feature list".to_string(),
                    ));
                }
                let reducer = spec.reducer.build()?;
                if let Some(width) = reducer_width(reduction, &feature_list, n_features, "") {
                    check_dim(reducer.input_dim(), width, "shared reducer")?;
                }
                let k = reducer.output_dim();
                if spec.min_values.len() != k || spec.max_values.len() != k {
                    return Err(PipelineError::MalformedMapping(format!(
                        "{k} reduced components but {} min and {} max bounds",
                        spec.min_values.len(),
                        spec.max_values.len()
                    )));
                }
                for (i, (lo, hi)) in spec.min_values.iter().zip(&spec.max_values).enumerate() {
                    if !(lo <= hi) {
                        return Err(PipelineError::MalformedMapping(format!(
                            "bound #{i}: min {lo} is not below max {hi}"
                        )));
                    }
                }
                let mut regressors = BTreeMap::new();
                for (name, r) in spec.regressors {
                    let regressor = r.build()?;
                    check_dim(regressor.input_dim(), k, &format!("`{name}` regressor"))?;
                    regressors.insert(name, regressor);
                }
                MapperKind::Shared(SharedMapper {
                    normalizer,
                    feature_list,
                    reduction,
                    reducer,
                    min_values: spec.min_values,
                    max_values: spec.max_values,
                    regressors,
                })
            }
        };

        Ok(Self {
            style: config.control_style,
            outputs: config.regression_outputs.clone(),
            kind,
        })
    }

    pub fn style(&self) -> ControlStyle {
        self.style
    }

    /// Output channel -> value, before reindexing into the command vector
    pub fn predict(&self, obs: &Observation) -> PipelineResult<BTreeMap<String, f64>> {
        let mut values = BTreeMap::new();
        match &self.kind {
            MapperKind::Simple(m) => {
                let out = m.map(obs)?;
                for (name, v) in self.outputs.iter().zip(out) {
                    values.insert(name.clone(), v);
                }
            }
            MapperKind::Maxmin(m) => {
                let z = m.normalizer.apply(obs)?;
                check_finite(z.as_slice(), "normalized features")?;
                let reduced = reduce(&z, m.reduction, &m.feature_list)?;
                for (name, model) in &m.models {
                    let row = model.reducer.transform(reduced.for_output(name)?)?;
                    values.insert(name.clone(), model.regressor.predict(&row)?);
                }
            }
            MapperKind::Shared(m) => {
                let z = m.normalizer.apply(obs)?;
                check_finite(z.as_slice(), "normalized features")?;
                let reduced = reduce(&z, m.reduction, &m.feature_list)?;
                let row = m.reducer.transform(reduced.shared()?)?;
                let clamped = clamp_to_bounds(&row, &m.min_values, &m.max_values)?;
                for (name, regressor) in &m.regressors {
                    let v = regressor.predict(&clamped)? / DEGREES_PER_COMMAND_UNIT;
                    values.insert(name.clone(), v);
                }
            }
        }
        let all: Vec<f64> = values.values().copied().collect();
        check_finite(&all, "command")?;
        Ok(values)
    }

    /// Map one observation to the 10-slot command vector
    pub fn map(&self, obs: &Observation) -> PipelineResult<CommandVector> {
        let values: BTreeMap<String, f32> = self
            .predict(obs)?
            .into_iter()
            .map(|(k, v)| (k, v as f32))
            .collect();
        Ok(CommandVector::from_channels(&values, &self.outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::COMMAND_LEN;
    use std::sync::Arc;

    fn obs(pairs: &[(&str, f64)]) -> Observation {
        let names: Arc<[String]> = pairs
            .iter()
            .map(|(n, _)| n.to_string())
            .collect::<Vec<_>>()
            .into();
        Observation::new(names, pairs.iter().map(|(_, v)| *v).collect())
    }

    fn config(style: ControlStyle, device: InputDevice) -> RuntimeConfig {
        RuntimeConfig {
            control_style: style,
            input_device: device,
            dim_reduction: ReductionType::Signals,
            ..RuntimeConfig::default()
        }
    }

    const SHARED_MAPPING: &str = r#"{
        "features": ["a", "b"],
        "normalization_mean": [0.0, 0.0],
        "normalization_std": [1.0, 1.0],
        "feature_list": ["a", "b"],
        "shared": {
            "reducer": {"kind": "linear_projection", "mean": [0.0, 0.0], "scale": [1.0, 1.0],
                        "rotation": [[1.0], [0.0]]},
            "min_values": [-1.0],
            "max_values": [2.0],
            "regressors": {
                "pitch": {"kind": "linear", "coefficients": [90.0], "intercept": 0.0},
                "roll": {"kind": "linear", "coefficients": [-45.0], "intercept": 9.0}
            }
        }
    }"#;

    const MAXMIN_MAPPING: &str = r#"{
        "features": ["a", "b"],
        "normalization_mean": [1.0, 0.0],
        "normalization_std": [2.0, 1.0],
        "feature_list": {"pitch": ["a"], "roll": ["b", "a"]},
        "outputs": {
            "pitch": {
                "reducer": {"kind": "linear_projection", "mean": [0.0], "scale": [1.0], "rotation": [[1.0]]},
                "regressor": {"kind": "linear", "coefficients": [10.0], "intercept": 1.0}
            },
            "roll": {
                "reducer": {"kind": "linear_projection", "mean": [0.0, 0.0], "scale": [1.0, 1.0],
                            "rotation": [[1.0], [1.0]]},
                "regressor": {"kind": "polynomial", "degree": 2, "coefficients": [0.0, 1.0], "intercept": 0.0}
            }
        }
    }"#;

    fn shared_mapper() -> ControlMapper {
        let mapping = CalibrationMapping::from_json(SHARED_MAPPING).unwrap();
        ControlMapper::learned(&config(ControlStyle::New, InputDevice::Motive), mapping).unwrap()
    }

    #[test]
    fn test_clamp_law() {
        let min = [-1.0, 0.0];
        let max = [1.0, 5.0];
        assert_eq!(clamp_to_bounds(&[-3.0, 9.0], &min, &max).unwrap(), vec![-1.0, 5.0]);
        assert_eq!(clamp_to_bounds(&[0.25, 4.0], &min, &max).unwrap(), vec![0.25, 4.0]);
        assert!(matches!(
            clamp_to_bounds(&[f64::NAN, 1.0], &min, &max),
            Err(PipelineError::NonFinite(_))
        ));
    }

    #[test]
    fn test_shared_mapper_clamps_then_divides() {
        let mapper = shared_mapper();
        // reduced = a = 5.0, clamped to 2.0
        let out = mapper.predict(&obs(&[("a", 5.0), ("b", 0.0)])).unwrap();
        assert_eq!(out["pitch"], 2.0);
        assert_eq!(out["roll"], (9.0 - 90.0) / 90.0);

        // within bounds, unchanged before regression
        let out = mapper.predict(&obs(&[("a", 0.5), ("b", 7.0)])).unwrap();
        assert_eq!(out["pitch"], 0.5);
    }

    #[test]
    fn test_shared_mapper_rejects_nan() {
        let err = shared_mapper()
            .map(&obs(&[("a", f64::NAN), ("b", 0.0)]))
            .unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_maxmin_per_output_models() {
        let mapping = CalibrationMapping::from_json(MAXMIN_MAPPING).unwrap();
        let mapper =
            ControlMapper::learned(&config(ControlStyle::Maxmin, InputDevice::Motive), mapping)
                .unwrap();
        // z(a) = (5 - 1) / 2 = 2, z(b) = 1
        let out = mapper.predict(&obs(&[("a", 5.0), ("b", 1.0)])).unwrap();
        assert_eq!(out["pitch"], 21.0);
        // roll: reduced = b + a = 3, polynomial 0*x + 1*x^2
        assert_eq!(out["roll"], 9.0);

        let cmd = mapper.map(&obs(&[("a", 5.0), ("b", 1.0)])).unwrap();
        assert_eq!(cmd.as_slice()[..2], [21.0, 9.0]);
    }

    #[test]
    fn test_command_vector_always_ten_slots() {
        let mapper = shared_mapper();
        let cmd = mapper.map(&obs(&[("a", 1.0), ("b", 0.0)])).unwrap();
        assert_eq!(cmd.len(), COMMAND_LEN);
        assert!(cmd.as_slice()[2..].iter().all(|&x| x == 0.0));

        let simple = ControlMapper::simple(&config(ControlStyle::Simple, InputDevice::Remote));
        let cmd = simple
            .map(&obs(&[("remote1", 0.0), ("remote2", 0.0), ("remote3", 124.0), ("remote4", 227.0)]))
            .unwrap();
        assert_eq!(cmd.as_slice().len(), COMMAND_LEN);
        assert_eq!(cmd.as_slice()[..2], [1.0, 0.0]);
        assert!(cmd.as_slice()[2..].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_simple_pose_uses_root_angles() {
        let simple = ControlMapper::simple(&config(ControlStyle::Simple, InputDevice::Motive));
        let out = simple
            .predict(&obs(&[
                ("roll_torso", -FRAC_PI_2),
                ("pitch_torso", FRAC_PI_2),
                ("yaw_torso", 0.0),
            ]))
            .unwrap();
        assert_eq!(out["pitch"], -1.0);
        assert_eq!(out["roll"], 1.0);
    }

    #[test]
    fn test_simple_imu_scales_by_gain() {
        let mut cfg = config(ControlStyle::Simple, InputDevice::Imu);
        cfg.imu_gain = 2.0;
        let out = ControlMapper::simple(&cfg)
            .predict(&obs(&[("roll_imu", 0.0), ("pitch_imu", 90.0), ("yaw_imu", 45.0)]))
            .unwrap();
        assert_eq!(out["pitch"], 0.25);
        assert_eq!(out["roll"], 0.5);
    }

    #[test]
    fn test_missing_mapping_is_fatal() {
        let cfg = config(ControlStyle::New, InputDevice::Motive);
        let err = ControlMapper::from_config(&cfg, Path::new("/nonexistent/mapping.json"))
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::MissingMapping(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_malformed_mapping_rejected() {
        assert!(matches!(
            CalibrationMapping::from_json("{\"features\": 3}"),
            Err(PipelineError::MalformedMapping(_))
        ));

        // min above max
        let inverted = SHARED_MAPPING.replace("\"max_values\": [2.0]", "\"max_values\": [-2.0]");
        let mapping = CalibrationMapping::from_json(&inverted).unwrap();
        assert!(ControlMapper::learned(&config(ControlStyle::New, InputDevice::Motive), mapping)
            .is_err());

        // maxmin style with only a shared model
        let mapping = CalibrationMapping::from_json(SHARED_MAPPING).unwrap();
        assert!(ControlMapper::learned(
            &config(ControlStyle::Maxmin, InputDevice::Motive),
            mapping
        )
        .is_err());
    }

    #[test]
    fn test_zero_std_in_artifact_is_fatal() {
        let zero = SHARED_MAPPING.replace("\"normalization_std\": [1.0, 1.0]", "\"normalization_std\": [1.0, 0.0]");
        let mapping = CalibrationMapping::from_json(&zero).unwrap();
        assert!(matches!(
            ControlMapper::learned(&config(ControlStyle::New, InputDevice::Motive), mapping),
            Err(PipelineError::ZeroStd { .. })
        ));
    }
}
