//! Markdown report generation.
//!
//! Renders a finished query (parameters, result tables, warnings, error)
//! and history pages as Markdown, plus JSON renderings of both.

use crate::models::{
    AnalyticsQuery, AnovaResult, ChiSquareResult, DescriptiveResult, GroupSummary, QueryPage,
    QueryResult, QueryWarning, TTestResult,
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Generate a complete Markdown report for one query.
pub fn generate_markdown_report(query: &AnalyticsQuery) -> String {
    let mut output = String::new();

    output.push_str("# fedstat Query Report\n\n");
    output.push_str(&generate_metadata_section(query));

    if let Some(ref result) = query.result {
        output.push_str(&generate_result_section(result));
    }
    output.push_str(&generate_warnings_section(&query.warnings));

    if let Some(ref error) = query.error {
        output.push_str("## Error\n\n");
        output.push_str(&format!("**{}:** {}\n\n", error.kind, error.message));
    }

    output.push_str(&generate_footer());
    output
}

/// Generate the metadata section.
fn generate_metadata_section(query: &AnalyticsQuery) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Query:** `{}`\n", query.id));
    section.push_str(&format!("- **Federation:** {}\n", query.federation_id));
    section.push_str(&format!("- **Test:** {}\n", query.kind));
    section.push_str(&format!(
        "- **Status:** {} {}\n",
        query.status.emoji(),
        query.status
    ));
    section.push_str(&format!(
        "- **Submitted:** {}\n",
        query.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if let Some(duration) = query.duration_seconds() {
        section.push_str(&format!("- **Duration:** {:.1}s\n", duration));
    }
    section.push('\n');

    section
}

fn generate_result_section(result: &QueryResult) -> String {
    match result {
        QueryResult::Descriptive(r) => generate_descriptive_section(r),
        QueryResult::TTest(r) => generate_ttest_section(r),
        QueryResult::ChiSquare(r) => generate_chisquare_section(r),
        QueryResult::Anova(r) => generate_anova_section(r),
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map(|v| format!("{:.4}", v)).unwrap_or_else(|| "-".to_string())
}

fn fmt_p(p: f64) -> String {
    if p < 1e-4 {
        "< 0.0001".to_string()
    } else {
        format!("{:.4}", p)
    }
}

fn group_table(groups: &[&GroupSummary]) -> String {
    let mut table = String::new();
    table.push_str("| Group | n | Mean | Std Dev | Variance | Min | Max |\n");
    table.push_str("|:---|---:|---:|---:|---:|---:|---:|\n");
    for g in groups {
        table.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} | {} |\n",
            g.group_id,
            g.n,
            fmt_opt(g.mean),
            fmt_opt(g.std_dev),
            fmt_opt(g.variance),
            fmt_opt(g.min),
            fmt_opt(g.max)
        ));
    }
    table.push('\n');
    table
}

fn generate_descriptive_section(result: &DescriptiveResult) -> String {
    let mut section = String::new();

    section.push_str(&format!(
        "## Descriptive Statistics: `{}` by {}\n\n",
        result.variable, result.group_by
    ));
    let mut rows: Vec<&GroupSummary> = result.groups.iter().collect();
    rows.push(&result.overall);
    section.push_str(&group_table(&rows));

    if result.percentiles_approximate {
        section.push_str("### Percentiles (approximate)\n\n");
        section.push_str("| Group | p5 | p25 | p50 | p75 | p95 |\n");
        section.push_str("|:---|---:|---:|---:|---:|---:|\n");
        for g in rows {
            let Some(ref percentiles) = g.percentiles else {
                continue;
            };
            let cells: Vec<String> = percentiles.iter().map(|p| format!("{:.4}", p.value)).collect();
            section.push_str(&format!("| {} | {} |\n", g.group_id, cells.join(" | ")));
        }
        section.push('\n');
    }

    section
}

fn generate_ttest_section(result: &TTestResult) -> String {
    let mut section = String::new();

    section.push_str(&format!(
        "## Welch t-test: `{}` ({} vs {})\n\n",
        result.variable, result.group_a.group_id, result.group_b.group_id
    ));
    section.push_str(&group_table(&[&result.group_a, &result.group_b]));

    section.push_str("| Statistic | Value |\n");
    section.push_str("|:---|---:|\n");
    section.push_str(&format!("| Mean difference | {:.4} |\n", result.mean_difference));
    section.push_str(&format!("| t | {:.4} |\n", result.t_statistic));
    section.push_str(&format!("| df | {:.2} |\n", result.degrees_of_freedom));
    section.push_str(&format!("| p-value | {} |\n", fmt_p(result.p_value)));
    section.push_str(&format!(
        "| {:.0}% CI | [{:.4}, {:.4}] |\n",
        result.confidence_level * 100.0,
        result.confidence_interval.lower,
        result.confidence_interval.upper
    ));
    section.push_str(&format!("| Cohen's d | {:.4} |\n\n", result.effect_size));
    section.push_str(&significance_line(result.significant, result.confidence_level));

    section
}

fn generate_chisquare_section(result: &ChiSquareResult) -> String {
    let mut section = String::new();

    section.push_str(&format!(
        "## Chi-square Test: `{}` x `{}`\n\n",
        result.variable1, result.variable2
    ));
    section.push_str(&format!(
        "- **Levels:** {} ({}) x {} ({})\n",
        result.rows.len(),
        result.rows.join(", "),
        result.columns.len(),
        result.columns.join(", ")
    ));
    section.push_str(&format!("- **Observations:** {}\n\n", result.total));

    section.push_str("| Statistic | Value |\n");
    section.push_str("|:---|---:|\n");
    section.push_str(&format!("| χ² | {:.4} |\n", result.statistic));
    section.push_str(&format!("| df | {} |\n", result.degrees_of_freedom));
    section.push_str(&format!("| p-value | {} |\n", fmt_p(result.p_value)));
    section.push_str(&format!("| Cramér's V | {:.4} |\n\n", result.effect_size));
    section.push_str(&significance_line(result.significant, result.confidence_level));

    section
}

fn generate_anova_section(result: &AnovaResult) -> String {
    let mut section = String::new();

    section.push_str(&format!(
        "## One-way ANOVA: `{}` by {}\n\n",
        result.variable, result.group_by
    ));
    let rows: Vec<&GroupSummary> = result.groups.iter().collect();
    section.push_str(&group_table(&rows));

    section.push_str("| Source | SS | df | F | p-value |\n");
    section.push_str("|:---|---:|---:|---:|---:|\n");
    section.push_str(&format!(
        "| Between | {:.4} | {} | {:.4} | {} |\n",
        result.ss_between,
        result.df_between,
        result.f_statistic,
        fmt_p(result.p_value)
    ));
    section.push_str(&format!(
        "| Within | {:.4} | {} | | |\n\n",
        result.ss_within, result.df_within
    ));
    section.push_str(&format!("- **η²:** {:.4}\n\n", result.effect_size));
    section.push_str(&significance_line(result.significant, result.confidence_level));

    if let Some(ref pairs) = result.post_hoc {
        section.push_str("### Tukey-Kramer Comparisons\n\n");
        section.push_str("| Pair | Difference | q | p-value | CI | Significant |\n");
        section.push_str("|:---|---:|---:|---:|:---:|:---:|\n");
        for pair in pairs {
            section.push_str(&format!(
                "| {} - {} | {:.4} | {:.4} | {} | [{:.4}, {:.4}] | {} |\n",
                pair.group_a,
                pair.group_b,
                pair.mean_difference,
                pair.q_statistic,
                fmt_p(pair.p_value),
                pair.confidence_interval.lower,
                pair.confidence_interval.upper,
                if pair.significant { "yes" } else { "no" }
            ));
        }
        section.push('\n');
    }
    if let Some(ref note) = result.post_hoc_note {
        section.push_str(&format!("> {}\n\n", note));
    }

    section
}

fn significance_line(significant: bool, level: f64) -> String {
    let alpha = 1.0 - level;
    if significant {
        format!("**Significant** at α = {:.3}.\n\n", alpha)
    } else {
        format!("Not significant at α = {:.3}.\n\n", alpha)
    }
}

/// Generate the warnings section.
fn generate_warnings_section(warnings: &[QueryWarning]) -> String {
    if warnings.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## Warnings\n\n");
    for warning in warnings {
        section.push_str(&format!("- ⚠️ **{}:** {}\n", warning.kind, warning.message));
        for site in &warning.excluded_sites {
            section.push_str(&format!("  - `{}`: {}\n", site.site_id, site.reason));
        }
    }
    section.push('\n');

    section
}

/// Generate a history page as a Markdown table.
pub fn generate_history_markdown(federation_id: &str, page: &QueryPage) -> String {
    let mut output = String::new();

    output.push_str(&format!("# Query History: {}\n\n", federation_id));
    if page.items.is_empty() {
        output.push_str("No queries found.\n\n");
        return output;
    }

    output.push_str(&format!(
        "Showing {}-{} of {}\n\n",
        page.offset + 1,
        page.offset + page.items.len(),
        page.total
    ));
    output.push_str("| Query | Test | Status | Submitted | Error |\n");
    output.push_str("|:---|:---|:---|:---|:---|\n");
    for item in &page.items {
        output.push_str(&format!(
            "| `{}` | {} | {} {} | {} | {} |\n",
            item.id,
            item.kind,
            item.status.emoji(),
            item.status,
            item.created_at.format("%Y-%m-%d %H:%M:%S"),
            item.error_kind.map(|k| k.to_string()).unwrap_or_default()
        ));
    }
    output.push('\n');

    output
}

/// Generate the report footer.
fn generate_footer() -> String {
    "---\n\n*Report generated by fedstat*\n".to_string()
}

/// Generate a JSON report of any serializable value.
pub fn generate_json_report<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).context("Failed to serialize report")
}

/// Write rendered report content to a file.
pub fn write_report(content: &str, path: &Path) -> Result<()> {
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("Failed to write report to {}", path.display()))?;

    Ok(())
}
