use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::learner::BaseLearnerKind;
use crate::models::EventType;

/// Configuration for the feature cleaning stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CleanerConfig {
    /// Longest gap (in rows) the forward-fill is allowed to bridge.
    pub forward_fill_limit: usize,
    /// Columns with more than this fraction undefined are dropped.
    pub prune_missing_fraction: f64,
    /// Fraction of an indicator window that must hold real observations
    /// before the indicator is considered defined.
    pub min_periods_fraction: f64,

    // Indicator windows
    pub sma_windows: Vec<usize>,
    pub ema_windows: Vec<usize>,
    pub rsi_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub bollinger_period: usize,
    pub bollinger_std: f64,
    pub stochastic_period: usize,
    pub stochastic_smooth: usize,
    pub williams_period: usize,
    pub cci_period: usize,
    pub atr_period: usize,

    // Volume features (baselines shifted one day back)
    pub volume_ratio_windows: Vec<usize>,
    pub volume_trend_fast: usize,
    pub volume_trend_slow: usize,
    /// Ratio over the shifted baseline that counts as a volume spike.
    pub volume_spike_ratio: f64,

    // Derived features
    pub momentum_periods: Vec<usize>,
    pub volatility_windows: Vec<usize>,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            forward_fill_limit: 3,
            prune_missing_fraction: 0.8,
            min_periods_fraction: 0.5,
            sma_windows: vec![10, 20, 50],
            ema_windows: vec![12, 26],
            rsi_period: 14,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            bollinger_period: 20,
            bollinger_std: 2.0,
            stochastic_period: 14,
            stochastic_smooth: 3,
            williams_period: 14,
            cci_period: 20,
            atr_period: 14,
            volume_ratio_windows: vec![10, 20],
            volume_trend_fast: 10,
            volume_trend_slow: 50,
            volume_spike_ratio: 2.0,
            momentum_periods: vec![5, 10, 20],
            volatility_windows: vec![5, 20],
        }
    }
}

impl CleanerConfig {
    /// Real-observation count a window must contain before the indicator
    /// value is kept. Always at least 1 and strictly below the window for
    /// windows of three or more rows.
    pub fn min_periods(&self, window: usize) -> usize {
        if window <= 2 {
            return 1;
        }
        let scaled = (window as f64 * self.min_periods_fraction).ceil() as usize;
        scaled.clamp(2, window - 1)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.min_periods_fraction) || self.min_periods_fraction <= 0.0 {
            return Err(anyhow!(
                "cleaner.minPeriodsFraction must be within (0, 1) (value: {})",
                self.min_periods_fraction
            ));
        }
        if !(0.0..=1.0).contains(&self.prune_missing_fraction) || self.prune_missing_fraction <= 0.0
        {
            return Err(anyhow!(
                "cleaner.pruneMissingFraction must be within (0, 1] (value: {})",
                self.prune_missing_fraction
            ));
        }
        for window in self
            .sma_windows
            .iter()
            .chain(self.ema_windows.iter())
            .chain(self.volume_ratio_windows.iter())
            .chain(self.momentum_periods.iter())
            .chain(self.volatility_windows.iter())
        {
            if *window < 2 {
                return Err(anyhow!(
                    "cleaner window lengths must be >= 2 (value: {})",
                    window
                ));
            }
        }
        for (key, period) in [
            ("cleaner.rsiPeriod", self.rsi_period),
            ("cleaner.macdFast", self.macd_fast),
            ("cleaner.macdSlow", self.macd_slow),
            ("cleaner.macdSignal", self.macd_signal),
            ("cleaner.bollingerPeriod", self.bollinger_period),
            ("cleaner.stochasticPeriod", self.stochastic_period),
            ("cleaner.stochasticSmooth", self.stochastic_smooth),
            ("cleaner.williamsPeriod", self.williams_period),
            ("cleaner.cciPeriod", self.cci_period),
            ("cleaner.atrPeriod", self.atr_period),
            ("cleaner.volumeTrendFast", self.volume_trend_fast),
            ("cleaner.volumeTrendSlow", self.volume_trend_slow),
        ] {
            if period < 2 {
                return Err(anyhow!("{} must be >= 2 (value: {})", key, period));
            }
        }
        if self.macd_fast >= self.macd_slow {
            return Err(anyhow!(
                "cleaner.macdFast ({}) must be < cleaner.macdSlow ({})",
                self.macd_fast,
                self.macd_slow
            ));
        }
        if self.volume_trend_fast >= self.volume_trend_slow {
            return Err(anyhow!(
                "cleaner.volumeTrendFast ({}) must be < cleaner.volumeTrendSlow ({})",
                self.volume_trend_fast,
                self.volume_trend_slow
            ));
        }
        if !self.bollinger_std.is_finite() || self.bollinger_std <= 0.0 {
            return Err(anyhow!(
                "cleaner.bollingerStd must be > 0 (value: {})",
                self.bollinger_std
            ));
        }
        if !self.volume_spike_ratio.is_finite() || self.volume_spike_ratio <= 1.0 {
            return Err(anyhow!(
                "cleaner.volumeSpikeRatio must be > 1 (value: {})",
                self.volume_spike_ratio
            ));
        }
        Ok(())
    }
}

/// Configuration for hard-negative mining
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BalancerConfig {
    /// How far the positive rate may drift from its natural value.
    pub positive_rate_tolerance: f64,
    pub max_hard_negatives: usize,
    /// Forward return the labeler required for a qualifying event.
    pub label_return_threshold: f64,
    /// Near-miss band starts at this fraction of the qualifying threshold.
    pub almost_fraction: f64,
    pub breakout_momentum_min: f64,
    pub breakout_return_cap: f64,
    pub fake_volume_ratio_min: f64,
    pub fake_volume_move_cap: f64,
    pub jitter_relative: f64,
    pub jitter_absolute: f64,
    pub momentum_feature: String,
    pub volume_feature: String,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            positive_rate_tolerance: 0.01,
            max_hard_negatives: 256,
            label_return_threshold: 0.25,
            almost_fraction: 0.6,
            breakout_momentum_min: 10.0,
            breakout_return_cap: 0.0,
            fake_volume_ratio_min: 3.0,
            fake_volume_move_cap: 0.05,
            jitter_relative: 0.01,
            jitter_absolute: 1e-4,
            momentum_feature: "momentum_10".to_string(),
            volume_feature: "volume_ratio_10".to_string(),
        }
    }
}

impl BalancerConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.positive_rate_tolerance.is_finite() || self.positive_rate_tolerance < 0.0 {
            return Err(anyhow!(
                "balancer.positiveRateTolerance must be >= 0 (value: {})",
                self.positive_rate_tolerance
            ));
        }
        if !self.label_return_threshold.is_finite() || self.label_return_threshold <= 0.0 {
            return Err(anyhow!(
                "balancer.labelReturnThreshold must be > 0 (value: {})",
                self.label_return_threshold
            ));
        }
        if !(0.0..1.0).contains(&self.almost_fraction) {
            return Err(anyhow!(
                "balancer.almostFraction must be within [0, 1) (value: {})",
                self.almost_fraction
            ));
        }
        if !self.jitter_relative.is_finite() || self.jitter_relative < 0.0 {
            return Err(anyhow!(
                "balancer.jitterRelative must be >= 0 (value: {})",
                self.jitter_relative
            ));
        }
        if !self.jitter_absolute.is_finite() || self.jitter_absolute < 0.0 {
            return Err(anyhow!(
                "balancer.jitterAbsolute must be >= 0 (value: {})",
                self.jitter_absolute
            ));
        }
        Ok(())
    }
}

/// Configuration for purged cross-validation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SplitConfig {
    pub k_folds: usize,
    pub embargo_fraction: f64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            k_folds: 5,
            embargo_fraction: 0.01,
        }
    }
}

impl SplitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.k_folds < 2 {
            return Err(anyhow!(
                "split.kFolds must be >= 2 (value: {})",
                self.k_folds
            ));
        }
        if !(0.0..=0.25).contains(&self.embargo_fraction) {
            return Err(anyhow!(
                "split.embargoFraction must be within [0, 0.25] (value: {})",
                self.embargo_fraction
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerMode {
    /// Soft-voting ensemble of every enabled base learner.
    Ensemble,
    /// One base learner evaluated across the purged folds.
    Single,
}

impl TrainerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainerMode::Ensemble => "ensemble",
            TrainerMode::Single => "single",
        }
    }
}

impl FromStr for TrainerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ensemble" => Ok(TrainerMode::Ensemble),
            "single" => Ok(TrainerMode::Single),
            _ => Err(anyhow!("Unknown trainer mode '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassWeightMode {
    Natural,
    Balanced,
}

impl ClassWeightMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassWeightMode::Natural => "natural",
            ClassWeightMode::Balanced => "balanced",
        }
    }
}

impl FromStr for ClassWeightMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "natural" => Ok(ClassWeightMode::Natural),
            "balanced" => Ok(ClassWeightMode::Balanced),
            _ => Err(anyhow!("Unknown class weight mode '{}'", s)),
        }
    }
}

/// Explicit per-class weights, overriding the configured weight mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassWeights {
    pub negative: f64,
    pub positive: f64,
}

impl ClassWeights {
    pub fn validate(&self) -> Result<()> {
        for (key, value) in [("negative", self.negative), ("positive", self.positive)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(anyhow!(
                    "class weight {} must be > 0 (value: {})",
                    key,
                    value
                ));
            }
        }
        Ok(())
    }
}

/// Which base learner families this deployment may instantiate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LearnerCapabilities {
    pub bagged: bool,
    pub boosted: bool,
}

impl Default for LearnerCapabilities {
    fn default() -> Self {
        Self {
            bagged: true,
            boosted: true,
        }
    }
}

impl LearnerCapabilities {
    pub fn is_enabled(&self, kind: BaseLearnerKind) -> bool {
        match kind {
            BaseLearnerKind::Bagged => self.bagged,
            BaseLearnerKind::Boosted => self.boosted,
        }
    }

    pub fn enabled_kinds(&self) -> Vec<BaseLearnerKind> {
        let mut kinds = Vec::new();
        if self.bagged {
            kinds.push(BaseLearnerKind::Bagged);
        }
        if self.boosted {
            kinds.push(BaseLearnerKind::Boosted);
        }
        kinds
    }
}

/// Configuration for ensemble training
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrainerConfig {
    pub mode: TrainerMode,
    pub capabilities: LearnerCapabilities,
    /// Learner used when `mode` is `single`.
    pub single_learner: BaseLearnerKind,
    pub class_weight_mode: ClassWeightMode,

    // Bagged forest parameters
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Features tried per split; defaults to sqrt of the feature count.
    pub max_features: Option<usize>,

    // Boosting parameters
    pub boost_rounds: usize,
    pub boost_learning_rate: f64,
    pub boost_max_depth: usize,
    pub boost_subsample: f64,

    // Calibration and audit
    pub calibration_folds: usize,
    pub calibration_embargo_fraction: f64,
    pub importance_flag_threshold: f64,
    pub instability_ratio: f64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            mode: TrainerMode::Ensemble,
            capabilities: LearnerCapabilities::default(),
            single_learner: BaseLearnerKind::Bagged,
            class_weight_mode: ClassWeightMode::Natural,
            n_trees: 200,
            max_depth: 10,
            min_samples_split: 5,
            min_samples_leaf: 2,
            max_features: None,
            boost_rounds: 150,
            boost_learning_rate: 0.1,
            boost_max_depth: 3,
            boost_subsample: 1.0,
            calibration_folds: 3,
            calibration_embargo_fraction: 0.01,
            importance_flag_threshold: 0.4,
            instability_ratio: 0.25,
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("trainer.nTrees", self.n_trees),
            ("trainer.maxDepth", self.max_depth),
            ("trainer.boostRounds", self.boost_rounds),
            ("trainer.boostMaxDepth", self.boost_max_depth),
            ("trainer.minSamplesLeaf", self.min_samples_leaf),
        ] {
            if value < 1 {
                return Err(anyhow!("{} must be >= 1 (value: {})", key, value));
            }
        }
        if self.min_samples_split < 2 {
            return Err(anyhow!(
                "trainer.minSamplesSplit must be >= 2 (value: {})",
                self.min_samples_split
            ));
        }
        if !self.boost_learning_rate.is_finite()
            || self.boost_learning_rate <= 0.0
            || self.boost_learning_rate > 1.0
        {
            return Err(anyhow!(
                "trainer.boostLearningRate must be within (0, 1] (value: {})",
                self.boost_learning_rate
            ));
        }
        if !(0.0..=1.0).contains(&self.boost_subsample) || self.boost_subsample <= 0.0 {
            return Err(anyhow!(
                "trainer.boostSubsample must be within (0, 1] (value: {})",
                self.boost_subsample
            ));
        }
        if self.calibration_folds < 2 {
            return Err(anyhow!(
                "trainer.calibrationFolds must be >= 2 (value: {})",
                self.calibration_folds
            ));
        }
        if !(0.0..=0.25).contains(&self.calibration_embargo_fraction) {
            return Err(anyhow!(
                "trainer.calibrationEmbargoFraction must be within [0, 0.25] (value: {})",
                self.calibration_embargo_fraction
            ));
        }
        if !(0.0..=1.0).contains(&self.importance_flag_threshold)
            || self.importance_flag_threshold <= 0.0
        {
            return Err(anyhow!(
                "trainer.importanceFlagThreshold must be within (0, 1] (value: {})",
                self.importance_flag_threshold
            ));
        }
        if !self.instability_ratio.is_finite() || self.instability_ratio <= 0.0 {
            return Err(anyhow!(
                "trainer.instabilityRatio must be > 0 (value: {})",
                self.instability_ratio
            ));
        }
        if self.capabilities.enabled_kinds().is_empty() {
            return Err(anyhow!(
                "trainer.capabilities must enable at least one base learner"
            ));
        }
        if self.mode == TrainerMode::Single && !self.capabilities.is_enabled(self.single_learner) {
            return Err(anyhow!(
                "trainer.singleLearner '{}' is not enabled in trainer.capabilities",
                self.single_learner.as_str()
            ));
        }
        Ok(())
    }
}

/// Configuration for the model artifact store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreConfig {
    pub root: PathBuf,
    pub model_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("artifacts"),
            model_name: "moon-classifier".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.model_name.trim().is_empty() {
            return Err(anyhow!("store.modelName must not be empty"));
        }
        if self
            .model_name
            .chars()
            .any(|c| !c.is_ascii_alphanumeric() && c != '-' && c != '_')
        {
            return Err(anyhow!(
                "store.modelName must contain only alphanumerics, '-' or '_' (value: {})",
                self.model_name
            ));
        }
        Ok(())
    }
}

/// Top-level pipeline configuration, loadable from a JSON file. Every
/// field has a default so a missing file or empty object is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    pub seed: Option<u64>,
    pub target_event: Option<EventType>,
    pub cleaner: CleanerConfig,
    pub balancer: BalancerConfig,
    pub split: SplitConfig,
    pub trainer: TrainerConfig,
    pub store: StoreConfig,
}

impl PipelineConfig {
    pub fn seed(&self) -> u64 {
        self.seed.unwrap_or(42)
    }

    pub fn target_event(&self) -> EventType {
        self.target_event.unwrap_or(EventType::Moon)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: PipelineConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_event() == EventType::None {
            return Err(anyhow!("targetEvent must be moon or rug"));
        }
        self.cleaner.validate()?;
        self.balancer.validate()?;
        self.split.validate()?;
        self.trainer.validate()?;
        self.store.validate()?;
        Ok(())
    }
}
