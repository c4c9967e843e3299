use balance_engine::{
    BalanceReport, Calculator, ClearCalculator, CombatCalculator, EconomyCalculator,
    EnhancementCalculator, Mode, PercentileSource, Strategy, run_sample,
};

#[test]
fn every_mode_runs_its_built_in_sample() {
    for mode in Mode::ALL {
        let report = run_sample(mode).unwrap_or_else(|err| panic!("{mode} sample failed: {err}"));
        assert_eq!(report.mode(), mode);
    }
}

#[test]
fn samples_parse_from_embedded_documents() {
    assert!(!CombatCalculator::sample_config().profiles.is_empty());
    assert_eq!(EconomyCalculator::sample_config().horizon, 30);
    assert_eq!(EnhancementCalculator::sample_config().levels.len(), 6);
    assert!(ClearCalculator::sample_config().curve.is_some());
}

#[test]
fn combat_sample_solves_inverse_and_boss() {
    let BalanceReport::TtkEhp(report) = run_sample(Mode::TtkEhp).unwrap() else {
        panic!("wrong variant");
    };
    assert_eq!(report.profiles[0].hp, 30_000.0);
    let boss = report.boss.expect("sample has a boss plan");
    assert!((boss.allocated_seconds - 180.0).abs() < 1e-9);
}

#[test]
fn economy_sample_reports_patch_impacts() {
    let BalanceReport::EconomyFlow(report) = run_sample(Mode::EconomyFlow).unwrap() else {
        panic!("wrong variant");
    };
    assert_eq!(report.ledger.steps.len(), 31);
    assert_eq!(report.patch_impacts.len(), 2);
    assert!(report.ledger.is_conserved());
}

#[test]
fn enhancement_sample_is_exact_and_ordered() {
    let BalanceReport::EnhancementCost(report) = run_sample(Mode::EnhancementCost).unwrap()
    else {
        panic!("wrong variant");
    };
    assert_eq!(report.strategy_used, Strategy::Exact);
    assert_eq!(report.steps.len(), 6);
    assert_eq!(
        report.cumulative.attempt_percentile_source,
        PercentileSource::Exact
    );
    for segment in report.steps.iter().chain(std::iter::once(&report.cumulative)) {
        let attempts = &segment.percentile_attempts;
        assert!(attempts["p50"] <= attempts["p90"] && attempts["p90"] <= attempts["p95"]);
        let cost = &segment.percentile_cost;
        assert!(cost["p50"] <= cost["p90"] && cost["p90"] <= cost["p95"]);
    }
    // The first level always succeeds.
    assert_eq!(report.steps[0].expected_attempts, 1.0);
    assert!(!report.truncated);
}

#[test]
fn enhancement_sample_replays_bit_identically() {
    let first = run_sample(Mode::EnhancementCost).unwrap();
    let second = run_sample(Mode::EnhancementCost).unwrap();
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[test]
fn clear_sample_fits_and_tabulates() {
    let BalanceReport::ClearProbability(report) = run_sample(Mode::ClearProbability).unwrap()
    else {
        panic!("wrong variant");
    };
    assert!(report.fit.is_some());
    assert_eq!(report.table.len(), 6);
    assert!((report.curve.evaluate(report.solved_gap) - 0.6).abs() < 1e-9);
}
