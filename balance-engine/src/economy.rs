//! Economy flow simulator: a resource ledger advanced over a fixed horizon.
//!
//! Each step evaluates the faucet and sink flows, applies any active
//! shocks, updates the stock and records the step. Flows read either the
//! step index or the stock carried into the step, which is how feedback
//! loops such as stock-scaled sinks are expressed.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::{DEFAULT_STABILITY_BAND, MAX_HORIZON};
use crate::curves::CurveSpec;
use crate::error::{BalanceError, Result};
use crate::numbers::{approx_eq, usize_to_f64};

const DEFAULT_SAMPLE: &str = include_str!("../data/economy_flow.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateInput {
    #[default]
    Step,
    Stock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowSide {
    Faucet,
    Sink,
}

/// A named faucet or sink driven by a curve from the config's curve table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub name: String,
    pub curve: String,
    #[serde(default)]
    pub input: RateInput,
    #[serde(default = "default_scale")]
    pub scale: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShockEffect {
    Multiplier(f64),
    Delta(f64),
}

/// A patch applied from `step` onward (or for `duration` steps).
///
/// With `flow` set the effect applies to that flow; otherwise it applies to
/// the whole side's total for the step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shock {
    #[serde(default)]
    pub label: Option<String>,
    pub step: u32,
    pub target: FlowSide,
    #[serde(default)]
    pub flow: Option<String>,
    #[serde(flatten)]
    pub effect: ShockEffect,
    #[serde(default)]
    pub duration: Option<u32>,
}

impl Shock {
    fn is_active(&self, step: u32) -> bool {
        step >= self.step
            && self
                .duration
                .is_none_or(|duration| step < self.step.saturating_add(duration))
    }

    fn apply(&self, amount: f64) -> f64 {
        match self.effect {
            ShockEffect::Multiplier(factor) => amount * factor,
            ShockEffect::Delta(delta) => amount + delta,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EconomyConfig {
    #[serde(default)]
    pub initial_stock: f64,
    pub horizon: i64,
    #[serde(default)]
    pub allow_deficit: bool,
    #[serde(default)]
    pub curves: BTreeMap<String, CurveSpec>,
    #[serde(default)]
    pub faucets: Vec<Flow>,
    #[serde(default)]
    pub sinks: Vec<Flow>,
    #[serde(default)]
    pub shocks: Vec<Shock>,
    /// Sink-to-faucet ratio band considered stable.
    #[serde(default = "default_stability_band")]
    pub stability_band: (f64, f64),
}

const fn default_scale() -> f64 {
    1.0
}

const fn default_stability_band() -> (f64, f64) {
    DEFAULT_STABILITY_BAND
}

impl Default for EconomyConfig {
    fn default() -> Self {
        Self {
            initial_stock: 0.0,
            horizon: 1,
            allow_deficit: false,
            curves: BTreeMap::new(),
            faucets: Vec::new(),
            sinks: Vec::new(),
            shocks: Vec::new(),
            stability_band: DEFAULT_STABILITY_BAND,
        }
    }
}

impl EconomyConfig {
    /// Built-in demo configuration used when no payload is supplied.
    #[must_use]
    pub fn load_from_static() -> Self {
        serde_json::from_str(DEFAULT_SAMPLE).unwrap_or_default()
    }

    /// # Errors
    ///
    /// Returns `BalanceError::Config` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.horizon <= 0 || self.horizon > MAX_HORIZON {
            return Err(BalanceError::config(
                "horizon",
                format!("must lie in 1..={MAX_HORIZON}"),
            ));
        }
        if !self.initial_stock.is_finite() {
            return Err(BalanceError::config("initial_stock", "must be finite"));
        }
        if !self.allow_deficit && self.initial_stock < 0.0 {
            return Err(BalanceError::config(
                "initial_stock",
                "must be >= 0 unless allow_deficit is set",
            ));
        }
        let (low, high) = self.stability_band;
        if !(low > 0.0 && low <= high) {
            return Err(BalanceError::config(
                "stability_band",
                "expects 0 < low <= high",
            ));
        }
        for (name, curve) in &self.curves {
            let field = format!("curves.{name}");
            curve.validate(&field)?;
            if matches!(curve, CurveSpec::Weighted { .. }) {
                return Err(BalanceError::config(
                    field,
                    "weighted curves select indices and cannot drive a rate",
                ));
            }
        }
        self.validate_flows("faucets", &self.faucets)?;
        self.validate_flows("sinks", &self.sinks)?;
        for (idx, shock) in self.shocks.iter().enumerate() {
            self.validate_shock(idx, shock)?;
        }
        Ok(())
    }

    fn validate_flows(&self, field: &str, flows: &[Flow]) -> Result<()> {
        for (idx, flow) in flows.iter().enumerate() {
            if !self.curves.contains_key(&flow.curve) {
                return Err(BalanceError::config(
                    format!("{field}[{idx}].curve"),
                    format!("references undefined curve '{}'", flow.curve),
                ));
            }
            if !flow.scale.is_finite() {
                return Err(BalanceError::config(
                    format!("{field}[{idx}].scale"),
                    "must be finite",
                ));
            }
        }
        Ok(())
    }

    fn validate_shock(&self, idx: usize, shock: &Shock) -> Result<()> {
        let field = format!("shocks[{idx}]");
        if shock.step == 0 || i64::from(shock.step) > self.horizon {
            return Err(BalanceError::config(
                format!("{field}.step"),
                format!("must lie in 1..={}", self.horizon),
            ));
        }
        if shock.duration == Some(0) {
            return Err(BalanceError::config(format!("{field}.duration"), "must be > 0"));
        }
        let value = match shock.effect {
            ShockEffect::Multiplier(v) | ShockEffect::Delta(v) => v,
        };
        if !value.is_finite() {
            return Err(BalanceError::config(field, "shock effect must be finite"));
        }
        if let Some(name) = &shock.flow {
            let flows = match shock.target {
                FlowSide::Faucet => &self.faucets,
                FlowSide::Sink => &self.sinks,
            };
            if !flows.iter().any(|flow| &flow.name == name) {
                return Err(BalanceError::config(
                    format!("{field}.flow"),
                    format!("no {:?} flow named '{name}'", shock.target).to_lowercase(),
                ));
            }
        }
        Ok(())
    }
}

/// One recorded step of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerStep {
    pub step_index: u32,
    pub faucet_amount: f64,
    pub sink_amount: f64,
    pub stock_balance: f64,
    pub deficit: bool,
    /// Sink demand that could not be met because the stock was clamped at zero.
    pub unmet_sink: f64,
}

/// Ordered stock trajectory; step 0 carries the configured initial stock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EconomyLedger {
    pub initial_stock: f64,
    pub allow_deficit: bool,
    pub steps: Vec<LedgerStep>,
}

impl EconomyLedger {
    /// Whether every step reconstructs from its predecessor via
    /// `stock[t] = stock[t-1] + faucet[t] - sink[t]` (deficit steps clamp to zero).
    #[must_use]
    pub fn is_conserved(&self) -> bool {
        let Some(first) = self.steps.first() else {
            return false;
        };
        if first.stock_balance != self.initial_stock {
            return false;
        }
        self.steps.windows(2).all(|pair| {
            let expected = pair[0].stock_balance + pair[1].faucet_amount - pair[1].sink_amount;
            if pair[1].deficit {
                pair[1].stock_balance == 0.0 && approx_eq(-expected, pair[1].unmet_sink, 1e-9)
            } else {
                approx_eq(pair[1].stock_balance, expected, 1e-12)
            }
        })
    }

    #[must_use]
    pub fn final_stock(&self) -> f64 {
        self.steps
            .last()
            .map_or(self.initial_stock, |step| step.stock_balance)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Inflationary,
    Stable,
    Deflationary,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EconomyDiagnostics {
    pub final_stock: f64,
    pub peak_stock: f64,
    pub min_stock: f64,
    pub total_faucet: f64,
    pub total_sink: f64,
    pub mean_net_flow: f64,
    pub sink_faucet_ratio: Option<f64>,
    pub trend: Trend,
    pub deficit_steps: Vec<u32>,
    /// First step whose balance, before clamping, fell to zero or below.
    pub time_to_exhaust: Option<u32>,
}

/// Aggregate over a contiguous run of ledger steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSummary {
    pub first_step: u32,
    pub last_step: u32,
    pub start_stock: f64,
    pub end_stock: f64,
    pub total_faucet: f64,
    pub total_sink: f64,
    pub mean_net_flow: f64,
}

/// Trajectory split around one shock, for patch-impact comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchImpact {
    pub label: String,
    pub step: u32,
    pub before: Option<SegmentSummary>,
    pub after: SegmentSummary,
    pub net_flow_change: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EconomyReport {
    pub ledger: EconomyLedger,
    pub diagnostics: EconomyDiagnostics,
    pub patch_impacts: Vec<PatchImpact>,
}

struct FlowCursor<'a> {
    config: &'a EconomyConfig,
}

impl FlowCursor<'_> {
    fn side_total(&self, side: FlowSide, step: u32, stock: f64) -> Result<f64> {
        let flows = match side {
            FlowSide::Faucet => &self.config.faucets,
            FlowSide::Sink => &self.config.sinks,
        };
        let mut total = 0.0;
        for flow in flows {
            let Some(curve) = self.config.curves.get(&flow.curve) else {
                return Err(BalanceError::config(
                    format!("{side:?}.curve").to_lowercase(),
                    format!("references undefined curve '{}'", flow.curve),
                ));
            };
            let x = match flow.input {
                RateInput::Step => f64::from(step),
                RateInput::Stock => stock.max(0.0),
            };
            let mut amount = curve.evaluate(x)? * flow.scale;
            for shock in self.active_shocks(side, step) {
                if shock.flow.as_deref() == Some(flow.name.as_str()) {
                    amount = shock.apply(amount);
                }
            }
            total += amount.max(0.0);
        }
        for shock in self.active_shocks(side, step) {
            if shock.flow.is_none() {
                total = shock.apply(total);
            }
        }
        Ok(total.max(0.0))
    }

    fn active_shocks(&self, side: FlowSide, step: u32) -> impl Iterator<Item = &Shock> {
        self.config
            .shocks
            .iter()
            .filter(move |shock| shock.target == side && shock.is_active(step))
    }
}

/// Advance the ledger over the configured horizon.
///
/// # Errors
///
/// Returns `BalanceError::Config` for an invalid configuration and
/// `BalanceError::Domain` if a curve cannot be evaluated at some input.
pub fn simulate_economy(config: &EconomyConfig) -> Result<EconomyReport> {
    config.validate()?;
    let horizon = u32::try_from(config.horizon)
        .map_err(|_| BalanceError::config("horizon", "exceeds the supported step range"))?;
    let cursor = FlowCursor { config };

    let mut steps = Vec::with_capacity(horizon as usize + 1);
    steps.push(LedgerStep {
        step_index: 0,
        faucet_amount: 0.0,
        sink_amount: 0.0,
        stock_balance: config.initial_stock,
        deficit: false,
        unmet_sink: 0.0,
    });
    let mut stock = config.initial_stock;
    let mut time_to_exhaust = None;

    for step in 1..=horizon {
        let faucet = cursor.side_total(FlowSide::Faucet, step, stock)?;
        let sink = cursor.side_total(FlowSide::Sink, step, stock)?;
        let raw = stock + faucet - sink;
        if time_to_exhaust.is_none() && sink > 0.0 && raw <= 0.0 {
            time_to_exhaust = Some(step);
        }
        let deficit = !config.allow_deficit && raw < 0.0;
        stock = if deficit { 0.0 } else { raw };
        steps.push(LedgerStep {
            step_index: step,
            faucet_amount: faucet,
            sink_amount: sink,
            stock_balance: stock,
            deficit,
            unmet_sink: if deficit { -raw } else { 0.0 },
        });
    }

    let ledger = EconomyLedger {
        initial_stock: config.initial_stock,
        allow_deficit: config.allow_deficit,
        steps,
    };
    let diagnostics = diagnose(&ledger, config.stability_band, time_to_exhaust);
    if !diagnostics.deficit_steps.is_empty() {
        log::warn!(
            "economy stock clamped at zero on {} of {} steps",
            diagnostics.deficit_steps.len(),
            horizon
        );
    }
    let patch_impacts = config
        .shocks
        .iter()
        .enumerate()
        .map(|(idx, shock)| patch_impact(&ledger, idx, shock))
        .collect();

    Ok(EconomyReport {
        ledger,
        diagnostics,
        patch_impacts,
    })
}

fn diagnose(
    ledger: &EconomyLedger,
    band: (f64, f64),
    time_to_exhaust: Option<u32>,
) -> EconomyDiagnostics {
    let flows = &ledger.steps[1..];
    let total_faucet: f64 = flows.iter().map(|s| s.faucet_amount).sum();
    let total_sink: f64 = flows.iter().map(|s| s.sink_amount).sum();
    let stocks = ledger.steps.iter().map(|s| s.stock_balance);
    let peak_stock = stocks.clone().fold(f64::NEG_INFINITY, f64::max);
    let min_stock = stocks.fold(f64::INFINITY, f64::min);
    let sink_faucet_ratio = (total_faucet > 0.0).then(|| total_sink / total_faucet);
    let trend = match sink_faucet_ratio {
        Some(ratio) if ratio < band.0 => Trend::Inflationary,
        Some(ratio) if ratio > band.1 => Trend::Deflationary,
        Some(_) => Trend::Stable,
        None if total_sink > 0.0 => Trend::Deflationary,
        None => Trend::Stable,
    };
    EconomyDiagnostics {
        final_stock: ledger.final_stock(),
        peak_stock,
        min_stock,
        total_faucet,
        total_sink,
        mean_net_flow: if flows.is_empty() {
            0.0
        } else {
            (total_faucet - total_sink) / usize_to_f64(flows.len())
        },
        sink_faucet_ratio,
        trend,
        deficit_steps: flows
            .iter()
            .filter(|s| s.deficit)
            .map(|s| s.step_index)
            .collect(),
        time_to_exhaust,
    }
}

fn summarize(ledger: &EconomyLedger, first: u32, last: u32) -> Option<SegmentSummary> {
    if first == 0 || first > last {
        return None;
    }
    let start = first as usize;
    let end = last as usize;
    let segment = ledger.steps.get(start..=end)?;
    let total_faucet: f64 = segment.iter().map(|s| s.faucet_amount).sum();
    let total_sink: f64 = segment.iter().map(|s| s.sink_amount).sum();
    Some(SegmentSummary {
        first_step: first,
        last_step: last,
        start_stock: ledger.steps[start - 1].stock_balance,
        end_stock: ledger.steps[end].stock_balance,
        total_faucet,
        total_sink,
        mean_net_flow: (total_faucet - total_sink) / usize_to_f64(segment.len()),
    })
}

fn patch_impact(ledger: &EconomyLedger, idx: usize, shock: &Shock) -> PatchImpact {
    let horizon = ledger.steps.last().map_or(0, |s| s.step_index);
    let before = summarize(ledger, 1, shock.step.saturating_sub(1));
    let after = summarize(ledger, shock.step, horizon).unwrap_or(SegmentSummary {
        first_step: shock.step,
        last_step: horizon,
        start_stock: ledger.final_stock(),
        end_stock: ledger.final_stock(),
        total_faucet: 0.0,
        total_sink: 0.0,
        mean_net_flow: 0.0,
    });
    let net_flow_change = after.mean_net_flow - before.as_ref().map_or(0.0, |b| b.mean_net_flow);
    PatchImpact {
        label: shock
            .label
            .clone()
            .unwrap_or_else(|| format!("shock[{idx}]")),
        step: shock.step,
        before,
        after,
        net_flow_change,
    }
}
