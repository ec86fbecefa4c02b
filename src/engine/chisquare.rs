//! Pearson chi-square test of independence.

use super::aggregate::ContingencyTable;
use super::distributions::chi_square_sf;
use crate::error::{AnalyticsError, ErrorKind, Result};
use crate::models::{ChiSquareRequest, ChiSquareResult};

pub fn chi_square_test(request: &ChiSquareRequest, table: &ContingencyTable) -> Result<ChiSquareResult> {
    let r = table.rows.len();
    let c = table.columns.len();
    if r < 2 || c < 2 {
        return Err(degenerate(format!(
            "Need at least 2 levels of each variable, got {} x {}",
            r, c
        )));
    }

    let total = table.total()?;
    if total == 0 {
        return Err(degenerate("Contingency table is empty".to_string()));
    }

    let row_totals = table.row_totals()?;
    let column_totals = table.column_totals()?;
    if let Some(i) = row_totals.iter().position(|&t| t == 0) {
        return Err(degenerate(format!(
            "Level '{}' of '{}' has no records, expected counts would be zero",
            table.rows[i], request.variable1
        )));
    }
    if let Some(j) = column_totals.iter().position(|&t| t == 0) {
        return Err(degenerate(format!(
            "Level '{}' of '{}' has no records, expected counts would be zero",
            table.columns[j], request.variable2
        )));
    }

    let n = total as f64;
    let mut statistic = 0.0;
    for (i, row) in table.counts.iter().enumerate() {
        for (j, &observed) in row.iter().enumerate() {
            let expected = row_totals[i] as f64 * column_totals[j] as f64 / n;
            let diff = observed as f64 - expected;
            statistic += diff * diff / expected;
        }
    }

    let df = ((r - 1) * (c - 1)) as u64;
    let p_value = chi_square_sf(statistic, df as f64);
    let min_dim = (r.min(c) - 1) as f64;
    let effect_size = (statistic / (n * min_dim)).sqrt();
    let level = request.confidence_level;

    Ok(ChiSquareResult {
        variable1: request.variable1.clone(),
        variable2: request.variable2.clone(),
        statistic,
        degrees_of_freedom: df,
        p_value,
        confidence_level: level,
        significant: p_value < 1.0 - level,
        effect_size,
        rows: table.rows.clone(),
        columns: table.columns.clone(),
        total,
    })
}

fn degenerate(message: String) -> AnalyticsError {
    AnalyticsError::new(ErrorKind::DegenerateTable, message)
}
