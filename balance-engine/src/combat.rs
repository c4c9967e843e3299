//! Combat pacing: damage, effective health and time-to-kill.
use serde::{Deserialize, Serialize};

use crate::constants::FLOAT_TOLERANCE;
use crate::curves::diminishing;
use crate::error::{BalanceError, Result};
use crate::numbers::approx_eq;

const DEFAULT_SAMPLE: &str = include_str!("../data/ttk_ehp.json");

/// Damage/health relationship for one target. Exactly one of
/// `target_ttk_seconds` and `hp` is supplied; the other is solved for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DamageProfile {
    #[serde(default)]
    pub label: Option<String>,
    pub dps: f64,
    #[serde(default)]
    pub target_ttk_seconds: Option<f64>,
    #[serde(default)]
    pub hp: Option<f64>,
    /// Armor rating mitigated through `armor / (armor + armor_constant)`.
    #[serde(default)]
    pub armor: Option<f64>,
}

/// One phase of a multi-phase encounter. A phase may fix its HP, fix its
/// TTK, or fix neither and take a weighted share of the remaining budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BossPhase {
    #[serde(flatten)]
    pub profile: DamageProfile,
    #[serde(default = "default_budget_weight")]
    pub budget_weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BossPlan {
    pub total_time_budget: f64,
    pub phases: Vec<BossPhase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombatConfig {
    #[serde(default = "default_armor_constant")]
    pub armor_constant: f64,
    #[serde(default)]
    pub profiles: Vec<DamageProfile>,
    #[serde(default)]
    pub boss: Option<BossPlan>,
}

const fn default_budget_weight() -> f64 {
    1.0
}

const fn default_armor_constant() -> f64 {
    100.0
}

impl Default for CombatConfig {
    fn default() -> Self {
        Self {
            armor_constant: default_armor_constant(),
            profiles: Vec::new(),
            boss: None,
        }
    }
}

impl CombatConfig {
    /// Built-in demo configuration used when no payload is supplied.
    #[must_use]
    pub fn load_from_static() -> Self {
        serde_json::from_str(DEFAULT_SAMPLE).unwrap_or_default()
    }

    /// Check the payload before any solving happens.
    ///
    /// # Errors
    ///
    /// Returns `BalanceError::Config` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if !(self.armor_constant > 0.0) {
            return Err(BalanceError::config("armor_constant", "must be > 0"));
        }
        if self.profiles.is_empty() && self.boss.is_none() {
            return Err(BalanceError::config(
                "profiles",
                "supply at least one profile or a boss plan",
            ));
        }
        for (idx, profile) in self.profiles.iter().enumerate() {
            validate_profile(&format!("profiles[{idx}]"), profile, true)?;
        }
        if let Some(boss) = &self.boss {
            if !(boss.total_time_budget > 0.0) {
                return Err(BalanceError::config("boss.total_time_budget", "must be > 0"));
            }
            if boss.phases.is_empty() {
                return Err(BalanceError::config("boss.phases", "at least one phase is required"));
            }
            for (idx, phase) in boss.phases.iter().enumerate() {
                let field = format!("boss.phases[{idx}]");
                validate_profile(&field, &phase.profile, false)?;
                if !(phase.budget_weight > 0.0) {
                    return Err(BalanceError::config(
                        format!("{field}.budget_weight"),
                        "must be > 0",
                    ));
                }
            }
        }
        Ok(())
    }
}

fn validate_profile(field: &str, profile: &DamageProfile, require_unknown: bool) -> Result<()> {
    if !(profile.dps > 0.0) || !profile.dps.is_finite() {
        return Err(BalanceError::config(format!("{field}.dps"), "must be > 0"));
    }
    if let Some(ttk) = profile.target_ttk_seconds
        && !(ttk > 0.0)
    {
        return Err(BalanceError::config(
            format!("{field}.target_ttk_seconds"),
            "must be > 0",
        ));
    }
    if let Some(hp) = profile.hp
        && !(hp > 0.0)
    {
        return Err(BalanceError::config(format!("{field}.hp"), "must be > 0"));
    }
    if let Some(armor) = profile.armor
        && !(armor >= 0.0)
    {
        return Err(BalanceError::config(format!("{field}.armor"), "must be >= 0"));
    }
    match (profile.target_ttk_seconds, profile.hp) {
        (Some(_), Some(_)) => Err(BalanceError::config(
            field,
            "set exactly one of target_ttk_seconds and hp",
        )),
        (None, None) if require_unknown => Err(BalanceError::config(
            field,
            "set exactly one of target_ttk_seconds and hp",
        )),
        _ => Ok(()),
    }
}

/// Which side of `dps * ttk == ehp` was solved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolvedFor {
    Ttk,
    Hp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DamageSolution {
    pub label: String,
    pub dps: f64,
    pub hp: f64,
    pub ehp: f64,
    pub mitigation: f64,
    pub ttk_seconds: f64,
    pub solved_for: SolvedFor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BossSolution {
    pub total_time_budget: f64,
    pub allocated_seconds: f64,
    pub total_hp: f64,
    pub phases: Vec<DamageSolution>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombatReport {
    pub profiles: Vec<DamageSolution>,
    pub boss: Option<BossSolution>,
}

/// Forward mode: `ttk = hp / dps`.
///
/// # Errors
///
/// Returns `BalanceError::Config` if `dps <= 0` or `hp <= 0`.
pub fn ttk_forward(dps: f64, hp: f64) -> Result<f64> {
    if !(dps > 0.0) {
        return Err(BalanceError::config("dps", "must be > 0"));
    }
    if !(hp > 0.0) {
        return Err(BalanceError::config("hp", "must be > 0"));
    }
    Ok(hp / dps)
}

/// Inverse mode: `hp = dps * target_ttk`.
///
/// # Errors
///
/// Returns `BalanceError::Config` if `dps <= 0` or `target_ttk <= 0`.
pub fn ttk_inverse(dps: f64, target_ttk: f64) -> Result<f64> {
    if !(dps > 0.0) {
        return Err(BalanceError::config("dps", "must be > 0"));
    }
    if !(target_ttk > 0.0) {
        return Err(BalanceError::config("target_ttk_seconds", "must be > 0"));
    }
    Ok(dps * target_ttk)
}

/// Fraction of incoming damage removed by `armor`.
///
/// # Errors
///
/// Returns `BalanceError::Domain` for negative armor or a non-positive constant.
pub fn mitigation(armor: f64, armor_constant: f64) -> Result<f64> {
    diminishing(armor, armor_constant)
}

/// Health adjusted for mitigation: `hp / (1 - mitigation)`.
///
/// # Errors
///
/// Returns `BalanceError::Domain` when mitigation is outside `[0, 1)`.
pub fn effective_hp(hp: f64, mitigation: f64) -> Result<f64> {
    if !(0.0..1.0).contains(&mitigation) {
        return Err(BalanceError::domain(
            "effective hp",
            format!("mitigation {mitigation} must lie in [0, 1)"),
        ));
    }
    Ok(hp / (1.0 - mitigation))
}

/// Solve one profile for whichever of TTK/HP is missing.
///
/// # Errors
///
/// Returns `BalanceError::Config` unless exactly one of TTK/HP is supplied.
pub fn solve_profile(profile: &DamageProfile, armor_constant: f64) -> Result<DamageSolution> {
    let mitigation = mitigation(profile.armor.unwrap_or(0.0), armor_constant)?;
    let label = profile.label.clone().unwrap_or_else(|| String::from("target"));
    match (profile.hp, profile.target_ttk_seconds) {
        (Some(hp), None) => {
            let ehp = effective_hp(hp, mitigation)?;
            Ok(DamageSolution {
                label,
                dps: profile.dps,
                hp,
                ehp,
                mitigation,
                ttk_seconds: ttk_forward(profile.dps, ehp)?,
                solved_for: SolvedFor::Ttk,
            })
        }
        (None, Some(ttk)) => {
            let ehp = ttk_inverse(profile.dps, ttk)?;
            Ok(DamageSolution {
                label,
                dps: profile.dps,
                hp: ehp * (1.0 - mitigation),
                ehp,
                mitigation,
                ttk_seconds: ttk,
                solved_for: SolvedFor::Hp,
            })
        }
        _ => Err(BalanceError::config(
            "profile",
            "set exactly one of target_ttk_seconds and hp",
        )),
    }
}

/// Allocate a time budget across boss phases and report the HP each needs.
///
/// # Errors
///
/// Returns `BalanceError::Config` when fixed phases overrun the budget, leave
/// no time for unfixed phases, or (all phases fixed) miss the budget.
pub fn solve_boss(plan: &BossPlan, armor_constant: f64) -> Result<BossSolution> {
    let mut fixed_seconds = 0.0;
    let mut free_weight = 0.0;
    let mut solved: Vec<Option<DamageSolution>> = Vec::with_capacity(plan.phases.len());
    for phase in &plan.phases {
        let profile = &phase.profile;
        if profile.hp.is_some() || profile.target_ttk_seconds.is_some() {
            let solution = solve_profile(profile, armor_constant)?;
            fixed_seconds += solution.ttk_seconds;
            solved.push(Some(solution));
        } else {
            free_weight += phase.budget_weight;
            solved.push(None);
        }
    }

    let budget = plan.total_time_budget;
    let tolerance = FLOAT_TOLERANCE * budget.max(1.0);
    if fixed_seconds > budget + tolerance {
        return Err(BalanceError::config(
            "boss.total_time_budget",
            format!("fixed phases need {fixed_seconds:.3}s, exceeding the {budget:.3}s budget"),
        ));
    }
    let remaining = budget - fixed_seconds;
    if free_weight > 0.0 && remaining <= tolerance {
        return Err(BalanceError::config(
            "boss.phases",
            "fixed phases leave no time for phases without hp or target_ttk_seconds",
        ));
    }
    if free_weight == 0.0 && !approx_eq(fixed_seconds, budget, FLOAT_TOLERANCE) {
        return Err(BalanceError::config(
            "boss.total_time_budget",
            format!("phase TTKs sum to {fixed_seconds:.3}s but the budget is {budget:.3}s"),
        ));
    }

    let mut phases = Vec::with_capacity(plan.phases.len());
    for (phase, slot) in plan.phases.iter().zip(solved) {
        let solution = match slot {
            Some(solution) => solution,
            None => {
                let share = remaining * phase.budget_weight / free_weight;
                let allocated = DamageProfile {
                    target_ttk_seconds: Some(share),
                    hp: None,
                    ..phase.profile.clone()
                };
                solve_profile(&allocated, armor_constant)?
            }
        };
        phases.push(solution);
    }

    log::debug!(
        "boss plan allocated {:.3}s across {} phases",
        budget,
        phases.len()
    );
    Ok(BossSolution {
        total_time_budget: budget,
        allocated_seconds: phases.iter().map(|p| p.ttk_seconds).sum(),
        total_hp: phases.iter().map(|p| p.hp).sum(),
        phases,
    })
}

/// Solve every profile and the optional boss plan.
///
/// # Errors
///
/// Returns the first validation or solving error.
pub fn run_combat(config: &CombatConfig) -> Result<CombatReport> {
    config.validate()?;
    let mut profiles = Vec::with_capacity(config.profiles.len());
    for (idx, profile) in config.profiles.iter().enumerate() {
        let solution = solve_profile(profile, config.armor_constant).map_err(|err| match err {
            BalanceError::Config { field, reason } => {
                BalanceError::config(format!("profiles[{idx}].{field}"), reason)
            }
            other => other,
        })?;
        profiles.push(solution);
    }
    let boss = config
        .boss
        .as_ref()
        .map(|plan| solve_boss(plan, config.armor_constant))
        .transpose()?;
    Ok(CombatReport { profiles, boss })
}
