use anyhow::Result;
use balance_engine::{
    BalanceReport, ClearReport, CombatReport, DamageSolution, EconomyReport, EnhancementReport,
    ExpectedCostReport, PercentileSource, SegmentSummary, SolvedFor,
};
use balance_engine::percentile::ordered_labels;
use colored::Colorize;
use std::io::Write;

/// Renderer-neutral block of a report: key facts, one table, trailing notes.
struct Section {
    title: String,
    facts: Vec<(String, String)>,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    notes: Vec<String>,
}

impl Section {
    fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            facts: Vec::new(),
            headers: Vec::new(),
            rows: Vec::new(),
            notes: Vec::new(),
        }
    }

    fn fact(mut self, key: &str, value: impl ToString) -> Self {
        self.facts.push((key.to_string(), value.to_string()));
        self
    }

    fn headers(mut self, headers: &[&str]) -> Self {
        self.headers = headers.iter().map(ToString::to_string).collect();
        self
    }
}

fn num(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        format!("{value:.3}")
    }
}

fn source(source: PercentileSource) -> &'static str {
    match source {
        PercentileSource::Exact => "exact",
        PercentileSource::Simulated => "simulated",
    }
}

fn combat_sections(report: &CombatReport) -> Vec<Section> {
    fn row(solution: &DamageSolution) -> Vec<String> {
        let solved = match solution.solved_for {
            SolvedFor::Ttk => "ttk",
            SolvedFor::Hp => "hp",
        };
        vec![
            solution.label.clone(),
            num(solution.dps),
            num(solution.hp),
            num(solution.ehp),
            format!("{:.1}%", solution.mitigation * 100.0),
            num(solution.ttk_seconds),
            solved.to_string(),
        ]
    }
    const HEADERS: [&str; 7] = ["target", "dps", "hp", "ehp", "mitigation", "ttk (s)", "solved"];

    let mut sections = Vec::new();
    if !report.profiles.is_empty() {
        let mut section = Section::new("Combat pacing").headers(&HEADERS);
        section.rows = report.profiles.iter().map(row).collect();
        sections.push(section);
    }
    if let Some(boss) = &report.boss {
        let mut section = Section::new("Boss phases")
            .fact("time budget (s)", num(boss.total_time_budget))
            .fact("allocated (s)", num(boss.allocated_seconds))
            .fact("total hp", num(boss.total_hp))
            .headers(&HEADERS);
        section.rows = boss.phases.iter().map(row).collect();
        sections.push(section);
    }
    sections
}

fn segment_row(label: &str, segment: Option<&SegmentSummary>) -> Vec<String> {
    segment.map_or_else(
        || vec![label.to_string(), "-".into(), "-".into(), "-".into(), "-".into()],
        |s| {
            vec![
                label.to_string(),
                format!("{}..={}", s.first_step, s.last_step),
                num(s.start_stock),
                num(s.end_stock),
                num(s.mean_net_flow),
            ]
        },
    )
}

fn economy_sections(report: &EconomyReport) -> Vec<Section> {
    let d = &report.diagnostics;
    let mut summary = Section::new("Economy flow")
        .fact("final stock", num(d.final_stock))
        .fact("peak stock", num(d.peak_stock))
        .fact("min stock", num(d.min_stock))
        .fact("total faucet", num(d.total_faucet))
        .fact("total sink", num(d.total_sink))
        .fact(
            "sink/faucet ratio",
            d.sink_faucet_ratio.map_or_else(|| "-".to_string(), num),
        )
        .fact("trend", format!("{:?}", d.trend).to_lowercase())
        .fact(
            "time to exhaust",
            d.time_to_exhaust
                .map_or_else(|| "never".to_string(), |step| format!("step {step}")),
        )
        .headers(&["step", "faucet", "sink", "stock", "deficit"]);
    summary.rows = report
        .ledger
        .steps
        .iter()
        .map(|step| {
            vec![
                step.step_index.to_string(),
                num(step.faucet_amount),
                num(step.sink_amount),
                num(step.stock_balance),
                if step.deficit {
                    format!("unmet {}", num(step.unmet_sink))
                } else {
                    String::new()
                },
            ]
        })
        .collect();
    if !d.deficit_steps.is_empty() {
        summary.notes.push(format!(
            "stock clamped at zero on {} steps",
            d.deficit_steps.len()
        ));
    }

    let mut sections = vec![summary];
    for impact in &report.patch_impacts {
        let mut section = Section::new(format!("Patch impact: {}", impact.label))
            .fact("step", impact.step)
            .fact("net flow change", num(impact.net_flow_change))
            .headers(&["segment", "steps", "start stock", "end stock", "mean net flow"]);
        section.rows = vec![
            segment_row("before", impact.before.as_ref()),
            segment_row("after", Some(&impact.after)),
        ];
        sections.push(section);
    }
    sections
}

fn enhancement_sections(report: &EnhancementReport) -> Vec<Section> {
    let labels = ordered_labels(report.cumulative.percentile_attempts.keys());
    let mut headers = vec!["segment".to_string(), "E[attempts]".into(), "E[cost]".into()];
    for label in &labels {
        headers.push(format!("{label} attempts"));
    }
    for label in &labels {
        headers.push(format!("{label} cost"));
    }
    headers.push("percentiles".into());

    let row = |segment: &ExpectedCostReport| {
        let mut cells = vec![
            format!("+{} -> +{}", segment.from_level, segment.to_level),
            num(segment.expected_attempts),
            num(segment.expected_cost),
        ];
        for label in &labels {
            cells.push(
                segment
                    .percentile_attempts
                    .get(*label)
                    .map_or_else(|| "-".to_string(), ToString::to_string),
            );
        }
        for label in &labels {
            cells.push(
                segment
                    .percentile_cost
                    .get(*label)
                    .map_or_else(|| "-".to_string(), |c| num(*c)),
            );
        }
        cells.push(format!(
            "{}/{}",
            source(segment.attempt_percentile_source),
            source(segment.cost_percentile_source)
        ));
        cells
    };

    let mut section = Section::new("Enhancement cost")
        .fact("strategy", format!("{:?}", report.strategy_used))
        .fact("chain states", report.state_count)
        .fact("trials per batch", report.trials)
        .fact("draws", report.draws);
    section.headers = headers;
    section.rows = report.steps.iter().map(row).collect();
    section.rows.push(row(&report.cumulative));
    section.notes.clone_from(&report.warnings);
    for segment in report.steps.iter().chain(std::iter::once(&report.cumulative)) {
        if !segment.truncated_percentiles.is_empty() {
            section.notes.push(format!(
                "+{} -> +{}: {} capped at the attempt limit",
                segment.from_level,
                segment.to_level,
                segment.truncated_percentiles.join(", ")
            ));
        }
    }
    if report.truncated {
        section
            .notes
            .push("report is truncated: some results hit the attempt limit".to_string());
    }
    vec![section]
}

fn clear_sections(report: &ClearReport) -> Vec<Section> {
    let mut section = Section::new("Clear probability")
        .fact(
            "curve",
            format!(
                "L={} k={} x0={}",
                num(report.curve.l),
                num(report.curve.k),
                num(report.curve.x0)
            ),
        )
        .fact("target clear rate", num(report.target_clear_probability))
        .fact("solved gap", num(report.solved_gap))
        .fact("expected attempts", num(report.expected_attempts))
        .fact(
            &format!("retries for {:.0}%", report.retry_target * 100.0),
            report.retry_allowance,
        );
    if let Some(fit) = &report.fit {
        section = section.fact(
            "fitted curve",
            format!(
                "k={} x0={} rmse={} ({} points)",
                num(fit.curve.k),
                num(fit.curve.x0),
                num(fit.rmse),
                fit.points
            ),
        );
    }
    if let Some(gap) = report.reference_gap {
        if let Some(x0) = report.midpoint_for_reference {
            section = section.fact(&format!("x0 for target at gap {}", num(gap)), num(x0));
        }
        if let Some(k) = report.steepness_for_reference {
            section = section.fact(&format!("k for target at gap {}", num(gap)), num(k));
        }
        if let Some(why) = &report.steepness_unavailable {
            section = section.fact(&format!("k for target at gap {}", num(gap)), why);
        }
    }
    section = section.headers(&["gap", "clear rate", "expected attempts", "retry allowance"]);
    section.rows = report
        .table
        .iter()
        .map(|row| {
            vec![
                num(row.gap),
                format!("{:.4}", row.clear_probability),
                row.expected_attempts
                    .map_or_else(|| "unreachable".to_string(), num),
                row.retry_allowance
                    .map_or_else(|| "-".to_string(), |k| k.to_string()),
            ]
        })
        .collect();
    vec![section]
}

fn sections(report: &BalanceReport) -> Vec<Section> {
    match report {
        BalanceReport::TtkEhp(r) => combat_sections(r),
        BalanceReport::EconomyFlow(r) => economy_sections(r),
        BalanceReport::EnhancementCost(r) => enhancement_sections(r),
        BalanceReport::ClearProbability(r) => clear_sections(r),
    }
}

fn column_widths(section: &Section) -> Vec<usize> {
    let mut widths: Vec<usize> = section.headers.iter().map(|h| h.chars().count()).collect();
    for row in &section.rows {
        for (idx, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(idx) {
                *width = (*width).max(cell.chars().count());
            }
        }
    }
    widths
}

pub fn generate_console_report(out: &mut dyn Write, report: &BalanceReport) -> Result<()> {
    writeln!(
        out,
        "{}",
        format!("📊 {} report", report.mode()).bright_cyan().bold()
    )?;
    for section in sections(report) {
        writeln!(out)?;
        writeln!(out, "{}", section.title.bold())?;
        writeln!(out, "{}", "=".repeat(section.title.chars().count()).cyan())?;
        for (key, value) in &section.facts {
            writeln!(out, "{key}: {}", value.green())?;
        }
        if !section.headers.is_empty() {
            let widths = column_widths(&section);
            let header: Vec<String> = section
                .headers
                .iter()
                .zip(&widths)
                .map(|(h, &w)| format!("{h:>w$}"))
                .collect();
            writeln!(out, "{}", header.join("  ").bright_yellow())?;
            for row in &section.rows {
                let cells: Vec<String> = row
                    .iter()
                    .zip(&widths)
                    .map(|(c, &w)| format!("{c:>w$}"))
                    .collect();
                writeln!(out, "{}", cells.join("  "))?;
            }
        }
        for note in &section.notes {
            writeln!(out, "{} {}", "⚠".yellow(), note.yellow())?;
        }
    }
    Ok(())
}

pub fn generate_json_report(out: &mut dyn Write, report: &BalanceReport) -> Result<()> {
    let json_output = serde_json::to_string_pretty(report)?;
    writeln!(out, "{json_output}")?;
    Ok(())
}

pub fn generate_markdown_report(out: &mut dyn Write, report: &BalanceReport) -> Result<()> {
    writeln!(out, "# Balance Report: {}\n", report.mode())?;
    for section in sections(report) {
        writeln!(out, "## {}\n", section.title)?;
        for (key, value) in &section.facts {
            writeln!(out, "- **{key}**: {value}")?;
        }
        if !section.facts.is_empty() {
            writeln!(out)?;
        }
        if !section.headers.is_empty() {
            writeln!(out, "| {} |", section.headers.join(" | "))?;
            let rule: Vec<&str> = section.headers.iter().map(|_| "---").collect();
            writeln!(out, "| {} |", rule.join(" | "))?;
            for row in &section.rows {
                writeln!(out, "| {} |", row.join(" | "))?;
            }
            writeln!(out)?;
        }
        for note in &section.notes {
            writeln!(out, "> ⚠ {note}\n")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use balance_engine::{
        EnhancementConfig, EnhancementLevel, Mode, run_sample, simulate_enhancement,
    };

    fn render(
        report: &BalanceReport,
        render: fn(&mut dyn Write, &BalanceReport) -> Result<()>,
    ) -> String {
        let mut buffer = Vec::new();
        render(&mut buffer, report).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn markdown_renders_pipe_tables_for_every_mode() {
        for mode in Mode::ALL {
            let report = run_sample(mode).unwrap();
            let text = render(&report, generate_markdown_report);
            assert!(text.starts_with(&format!("# Balance Report: {mode}")));
            assert!(text.contains("| --- |"));
        }
    }

    #[test]
    fn json_report_is_tagged_by_mode() {
        let report = run_sample(Mode::TtkEhp).unwrap();
        let text = render(&report, generate_json_report);
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["mode"], "ttk_ehp");
        assert_eq!(value["report"]["profiles"][0]["hp"], 30_000.0);
    }

    #[test]
    fn percentile_columns_follow_rank_order() {
        let config = EnhancementConfig {
            levels: vec![EnhancementLevel {
                label: None,
                success_probability: 0.5,
                cost_per_attempt: 1.0,
                pity_threshold: Some(3),
                pity_curve: None,
                protection_consumed_on_fail: false,
                downgrade_on_fail: 0,
            }],
            percentiles: vec![1.0, 0.5],
            ..EnhancementConfig::default()
        };
        let report = BalanceReport::EnhancementCost(simulate_enhancement(&config).unwrap());
        let text = render(&report, generate_markdown_report);
        let p50 = text.find("p50 attempts").unwrap();
        let p100 = text.find("p100 attempts").unwrap();
        assert!(p50 < p100);
    }

    #[test]
    fn console_report_lists_boss_phases() {
        let report = run_sample(Mode::TtkEhp).unwrap();
        let text = render(&report, generate_console_report);
        assert!(text.contains("Boss phases"));
        assert!(text.contains("raid boss"));
    }

    #[test]
    fn whole_numbers_render_without_decimals() {
        assert_eq!(num(30_000.0), "30000");
        assert_eq!(num(0.125), "0.125");
    }
}
