//! Mode dispatch: one `Calculator` capability, four implementations.
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::clear::{ClearCurveSpec, ClearReport, tune_clear_curve};
use crate::combat::{CombatConfig, CombatReport, run_combat};
use crate::economy::{EconomyConfig, EconomyReport, simulate_economy};
use crate::enhancement::{EnhancementConfig, EnhancementReport, simulate_enhancement};
use crate::error::{BalanceError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    TtkEhp,
    EconomyFlow,
    EnhancementCost,
    ClearProbability,
}

impl Mode {
    pub const ALL: [Self; 4] = [
        Self::TtkEhp,
        Self::EconomyFlow,
        Self::EnhancementCost,
        Self::ClearProbability,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TtkEhp => "ttk_ehp",
            Self::EconomyFlow => "economy_flow",
            Self::EnhancementCost => "enhancement_cost",
            Self::ClearProbability => "clear_probability",
        }
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::TtkEhp => "time-to-kill and effective HP, forward and inverse",
            Self::EconomyFlow => "faucet/sink ledger over a fixed horizon",
            Self::EnhancementCost => "expected and percentile cost of an enhancement ladder",
            Self::ClearProbability => "logistic clear curve inversion and retry allowance",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = BalanceError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| {
                BalanceError::config(
                    "mode",
                    format!(
                        "unknown mode '{s}' (expected one of {})",
                        Self::ALL.map(Self::as_str).join(", ")
                    ),
                )
            })
    }
}

/// Caller-side overrides applied after the configuration is parsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub seed: Option<u64>,
    pub trials: Option<usize>,
}

pub trait Calculator {
    type Config: DeserializeOwned + Serialize;
    type Report: Serialize;

    const MODE: Mode;

    /// Built-in configuration used when the caller supplies none.
    fn sample_config() -> Self::Config;

    /// # Errors
    ///
    /// Any `BalanceError` raised by the calculator.
    fn run(config: &Self::Config) -> Result<Self::Report>;

    /// Apply seed and trial overrides; deterministic calculators ignore them.
    fn apply_options(_config: &mut Self::Config, _options: RunOptions) {}

    /// # Errors
    ///
    /// Returns `BalanceError::Config` on field `parameters` when the document
    /// does not match the mode's configuration shape.
    fn parse(parameters: Value) -> Result<Self::Config> {
        serde_json::from_value(parameters)
            .map_err(|err| BalanceError::config("parameters", err.to_string()))
    }
}

pub struct CombatCalculator;
pub struct EconomyCalculator;
pub struct EnhancementCalculator;
pub struct ClearCalculator;

impl Calculator for CombatCalculator {
    type Config = CombatConfig;
    type Report = CombatReport;
    const MODE: Mode = Mode::TtkEhp;

    fn sample_config() -> Self::Config {
        CombatConfig::load_from_static()
    }

    fn run(config: &Self::Config) -> Result<Self::Report> {
        run_combat(config)
    }
}

impl Calculator for EconomyCalculator {
    type Config = EconomyConfig;
    type Report = EconomyReport;
    const MODE: Mode = Mode::EconomyFlow;

    fn sample_config() -> Self::Config {
        EconomyConfig::load_from_static()
    }

    fn run(config: &Self::Config) -> Result<Self::Report> {
        simulate_economy(config)
    }
}

impl Calculator for EnhancementCalculator {
    type Config = EnhancementConfig;
    type Report = EnhancementReport;
    const MODE: Mode = Mode::EnhancementCost;

    fn sample_config() -> Self::Config {
        EnhancementConfig::load_from_static()
    }

    fn run(config: &Self::Config) -> Result<Self::Report> {
        simulate_enhancement(config)
    }

    fn apply_options(config: &mut Self::Config, options: RunOptions) {
        if let Some(seed) = options.seed {
            config.seed = seed;
        }
        if let Some(trials) = options.trials {
            config.trials = trials;
        }
    }
}

impl Calculator for ClearCalculator {
    type Config = ClearCurveSpec;
    type Report = ClearReport;
    const MODE: Mode = Mode::ClearProbability;

    fn sample_config() -> Self::Config {
        ClearCurveSpec::load_from_static()
    }

    fn run(config: &Self::Config) -> Result<Self::Report> {
        tune_clear_curve(config)
    }
}

/// Top-level request document: `{ "mode": ..., "parameters": { ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceRequest {
    pub mode: Mode,
    /// Absent or null parameters select the mode's built-in sample.
    #[serde(default)]
    pub parameters: Option<Value>,
}

impl BalanceRequest {
    #[must_use]
    pub const fn sample(mode: Mode) -> Self {
        Self {
            mode,
            parameters: None,
        }
    }

    /// Parse a request document.
    ///
    /// # Errors
    ///
    /// Returns `BalanceError::Config` on field `payload` for malformed JSON
    /// and on field `mode` for a missing or unknown mode.
    pub fn from_json(text: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(text)
            .map_err(|err| BalanceError::config("payload", err.to_string()))?;
        let mode = document
            .get("mode")
            .and_then(Value::as_str)
            .ok_or_else(|| BalanceError::config("mode", "a mode string is required"))?
            .parse::<Mode>()?;
        let parameters = document
            .get("parameters")
            .filter(|value| !value.is_null())
            .cloned();
        Ok(Self { mode, parameters })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "report", rename_all = "snake_case")]
pub enum BalanceReport {
    TtkEhp(CombatReport),
    EconomyFlow(EconomyReport),
    EnhancementCost(EnhancementReport),
    ClearProbability(ClearReport),
}

impl BalanceReport {
    #[must_use]
    pub const fn mode(&self) -> Mode {
        match self {
            Self::TtkEhp(_) => Mode::TtkEhp,
            Self::EconomyFlow(_) => Mode::EconomyFlow,
            Self::EnhancementCost(_) => Mode::EnhancementCost,
            Self::ClearProbability(_) => Mode::ClearProbability,
        }
    }
}

fn dispatch<C: Calculator>(
    parameters: Option<&Value>,
    options: RunOptions,
) -> Result<C::Report> {
    let mut config = match parameters {
        Some(value) => C::parse(value.clone())?,
        None => {
            log::debug!("no parameters for {}; using built-in sample", C::MODE);
            C::sample_config()
        }
    };
    C::apply_options(&mut config, options);
    C::run(&config)
}

/// Run a request with caller overrides.
///
/// # Errors
///
/// Any `BalanceError` raised while parsing or running the request.
pub fn run_request_with(request: &BalanceRequest, options: RunOptions) -> Result<BalanceReport> {
    let parameters = request.parameters.as_ref();
    Ok(match request.mode {
        Mode::TtkEhp => BalanceReport::TtkEhp(dispatch::<CombatCalculator>(parameters, options)?),
        Mode::EconomyFlow => {
            BalanceReport::EconomyFlow(dispatch::<EconomyCalculator>(parameters, options)?)
        }
        Mode::EnhancementCost => {
            BalanceReport::EnhancementCost(dispatch::<EnhancementCalculator>(parameters, options)?)
        }
        Mode::ClearProbability => {
            BalanceReport::ClearProbability(dispatch::<ClearCalculator>(parameters, options)?)
        }
    })
}

/// # Errors
///
/// Any `BalanceError` raised while parsing or running the request.
pub fn run_request(request: &BalanceRequest) -> Result<BalanceReport> {
    run_request_with(request, RunOptions::default())
}

/// Run the built-in sample for `mode`.
///
/// # Errors
///
/// Any `BalanceError` raised by the sample, which would indicate a broken
/// sample document.
pub fn run_sample(mode: Mode) -> Result<BalanceReport> {
    run_request(&BalanceRequest::sample(mode))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_parse_and_reject_unknown() {
        for mode in Mode::ALL {
            assert_eq!(mode.as_str().parse::<Mode>().unwrap(), mode);
        }
        let err = "loot_table".parse::<Mode>().unwrap_err();
        assert_eq!(err.field(), Some("mode"));
    }

    #[test]
    fn request_parsing_reports_payload_and_mode_errors() {
        assert_eq!(
            BalanceRequest::from_json("{not json").unwrap_err().field(),
            Some("payload")
        );
        assert_eq!(
            BalanceRequest::from_json(r#"{"parameters":{}}"#)
                .unwrap_err()
                .field(),
            Some("mode")
        );
        let request =
            BalanceRequest::from_json(r#"{"mode":"economy_flow","parameters":null}"#).unwrap();
        assert_eq!(request, BalanceRequest::sample(Mode::EconomyFlow));
    }

    #[test]
    fn ttk_request_runs_inverse() {
        let request = BalanceRequest::from_json(
            r#"{"mode":"ttk_ehp","parameters":{"profiles":[{"dps":500,"target_ttk_seconds":60}]}}"#,
        )
        .unwrap();
        let BalanceReport::TtkEhp(report) = run_request(&request).unwrap() else {
            panic!("wrong report variant");
        };
        assert_eq!(report.profiles[0].hp, 30_000.0);
    }

    #[test]
    fn mismatched_parameters_are_config_errors() {
        let request = BalanceRequest {
            mode: Mode::EnhancementCost,
            parameters: Some(serde_json::json!({ "levels": "many" })),
        };
        assert_eq!(run_request(&request).unwrap_err().field(), Some("parameters"));
    }

    #[test]
    fn seed_override_reaches_enhancement() {
        let mut config = EnhancementCalculator::sample_config();
        EnhancementCalculator::apply_options(
            &mut config,
            RunOptions {
                seed: Some(7),
                trials: Some(250),
            },
        );
        assert_eq!(config.seed, 7);
        assert_eq!(config.trials, 250);
    }
}
