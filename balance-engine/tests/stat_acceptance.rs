use std::collections::BTreeMap;

use balance_engine::{
    BalanceError, CurveSpec, EconomyConfig, EnhancementConfig, EnhancementLevel, Flow, LogisticCurve,
    RateInput, Shock, ShockEffect, FlowSide, Strategy, TrialBatch, diminishing, pity_linear,
    run_batch, sigmoid, simulate_economy, simulate_enhancement, ttk_inverse, weighted_pick_with,
};
use balance_engine::curves::Breakpoint;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

const DRAWS: usize = 10_000;
/// Chi-square critical value for 3 degrees of freedom at p = 0.001.
const CHI_SQUARE_CRITICAL_DF3: f64 = 16.266;

#[test]
fn weighted_pick_converges_to_weight_shares() {
    let weights = [1.0, 2.0, 3.0, 4.0];
    let total: f64 = weights.iter().sum();
    let mut rng = ChaCha20Rng::seed_from_u64(0x5EED_BA1A);
    let mut counts = [0usize; 4];
    for _ in 0..DRAWS {
        let idx = weighted_pick_with(&weights, &mut rng).expect("valid weights");
        counts[idx] += 1;
    }
    let n = f64::from(u32::try_from(DRAWS).expect("draws fit u32"));
    let chi_square: f64 = weights
        .iter()
        .zip(counts)
        .map(|(weight, observed)| {
            let expected = n * weight / total;
            let observed = f64::from(u32::try_from(observed).expect("count fits u32"));
            (observed - expected).powi(2) / expected
        })
        .sum();
    assert!(
        chi_square < CHI_SQUARE_CRITICAL_DF3,
        "weighted pick drifted: chi-square {chi_square:.3}, counts {counts:?}"
    );
}

#[test]
fn sigmoid_is_monotonic_and_bounded() {
    let (l, k, x0) = (0.9, 0.3, 2.0);
    let mut previous = 0.0;
    for step in -40..=40 {
        let x = f64::from(step) * 0.5;
        let value = sigmoid(x, l, k, x0);
        assert!(value > 0.0 && value < l, "sigmoid({x}) = {value} escaped (0, {l})");
        assert!(value > previous, "sigmoid not increasing at {x}");
        previous = value;
    }
    assert_eq!(sigmoid(x0, l, k, x0), l / 2.0);
}

#[test]
fn diminishing_is_half_at_k_and_increasing() {
    for k in [0.1, 1.0, 3.0, 7.5, 250.0, 1e6] {
        assert_eq!(diminishing(k, k).expect("valid"), 0.5);
    }
    let mut previous = -1.0;
    for x in [0.0, 1.0, 10.0, 100.0, 1e4, 1e8] {
        let value = diminishing(x, 10.0).expect("valid");
        assert!(value > previous);
        previous = value;
    }
    assert!(1.0 - previous < 1e-6);
}

#[test]
fn pity_ladder_hits_documented_points() {
    assert_eq!(pity_linear(100, 0.01, 0.01, 1.0), 1.0);
    assert_eq!(pity_linear(50, 0.01, 0.01, 1.0), 0.50);
}

#[test]
fn simulated_percentiles_are_ordered() {
    let batch = run_batch(2_000, 99, "tests/exponential", |rng| {
        let u: f64 = rng.r#gen::<f64>();
        -(1.0 - u).ln() * 30.0
    });
    let batch = TrialBatch::from_samples(batch.outcomes).expect("finite samples");
    let summary = batch.summary(&[0.5, 0.9, 0.95]).expect("valid percentiles");
    let p50 = summary.percentiles["p50"];
    let p90 = summary.percentiles["p90"];
    let p95 = summary.percentiles["p95"];
    assert!(p50 <= p90 && p90 <= p95 && p95 <= summary.max);
}

fn flow(name: &str, curve: &str, input: RateInput) -> Flow {
    Flow {
        name: name.to_string(),
        curve: curve.to_string(),
        input,
        scale: 1.0,
    }
}

#[test]
fn ledger_reconstructs_from_flow_history() {
    let config = EconomyConfig {
        initial_stock: 250.0,
        horizon: 60,
        allow_deficit: true,
        curves: BTreeMap::from([
            (
                "ramp".to_string(),
                CurveSpec::Piecewise {
                    breakpoints: vec![
                        Breakpoint {
                            threshold: 0.0,
                            slope: 3.0,
                            intercept: 40.0,
                        },
                        Breakpoint {
                            threshold: 20.0,
                            slope: -1.5,
                            intercept: 100.0,
                        },
                    ],
                },
            ),
            (
                "upkeep".to_string(),
                CurveSpec::Sigmoid {
                    l: 120.0,
                    k: 0.2,
                    x0: 30.0,
                },
            ),
            (
                "tax".to_string(),
                CurveSpec::Inverse {
                    k: 500.0,
                    scale: 25.0,
                },
            ),
        ]),
        faucets: vec![flow("quests", "ramp", RateInput::Step)],
        sinks: vec![
            flow("upkeep", "upkeep", RateInput::Step),
            flow("tax", "tax", RateInput::Stock),
        ],
        shocks: vec![Shock {
            label: None,
            step: 25,
            target: FlowSide::Faucet,
            flow: None,
            effect: ShockEffect::Delta(-10.0),
            duration: Some(5),
        }],
        ..EconomyConfig::default()
    };
    let report = simulate_economy(&config).expect("valid economy");
    assert!(report.ledger.is_conserved());
    for pair in report.ledger.steps.windows(2) {
        let rebuilt = pair[0].stock_balance + pair[1].faucet_amount - pair[1].sink_amount;
        assert!((rebuilt - pair[1].stock_balance).abs() < 1e-9);
    }
}

#[test]
fn clear_curve_round_trips() {
    let curve = LogisticCurve {
        l: 0.97,
        k: 0.12,
        x0: -4.0,
    };
    for step in 1..97 {
        let target = f64::from(step) / 100.0;
        let gap = curve.inverse(target).expect("inside (0, L)");
        assert!(
            (curve.evaluate(gap) - target).abs() < 1e-9,
            "round trip drifted at {target}"
        );
    }
}

#[test]
fn single_level_enhancement_expects_twenty_attempts() {
    let config = EnhancementConfig {
        levels: vec![EnhancementLevel {
            label: None,
            success_probability: 0.05,
            cost_per_attempt: 1.0,
            pity_threshold: None,
            pity_curve: None,
            protection_consumed_on_fail: false,
            downgrade_on_fail: 0,
        }],
        strategy: Strategy::Exact,
        ..EnhancementConfig::default()
    };
    let report = simulate_enhancement(&config).expect("valid ladder");
    assert_eq!(report.cumulative.expected_attempts, 20.0);
    assert_eq!(report.steps.len(), 1);
}

#[test]
fn constant_flows_scenario_ends_at_two_hundred() {
    let config = EconomyConfig {
        initial_stock: 0.0,
        horizon: 10,
        curves: BTreeMap::from([
            ("faucet".to_string(), CurveSpec::Constant { value: 100.0 }),
            ("sink".to_string(), CurveSpec::Constant { value: 80.0 }),
        ]),
        faucets: vec![flow("income", "faucet", RateInput::Step)],
        sinks: vec![flow("spend", "sink", RateInput::Step)],
        ..EconomyConfig::default()
    };
    let report = simulate_economy(&config).expect("valid economy");
    assert_eq!(report.diagnostics.final_stock, 200.0);
    assert!(report.ledger.steps.iter().all(|step| !step.deficit));
}

#[test]
fn ttk_inverse_scenario() {
    assert_eq!(ttk_inverse(500.0, 60.0).expect("valid"), 30_000.0);
    assert!(matches!(
        ttk_inverse(0.0, 60.0),
        Err(BalanceError::Config { .. })
    ));
}
