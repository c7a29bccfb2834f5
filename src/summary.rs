//! Cross-period summary, built once from the retained records after the
//! period loop has stopped.
//!
//! Layout of the rendered sheet:
//!
//! ```text
//! Period | credit descriptors... | Total Credits | debit descriptors... | Total Debits | Net
//! ```
//!
//! Both descriptor axes are sorted by their header text, so the column order
//! depends only on the set of descriptors and never on the order they were
//! first seen in. The three computed columns are formulas over the row's own
//! cells; the exact decimal values are kept alongside for callers that do not
//! evaluate formulas.

use crate::schema::{Category, ItemDescriptor, Period, PeriodRecord};
use crate::sink::{Cell, SheetData};
use crate::utils::column_letter;
use log::{debug, info};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

pub const SUMMARY_SHEET: &str = "Summary";
pub const PERIOD_COLUMN: &str = "Period";
pub const TOTAL_CREDITS_COLUMN: &str = "Total Credits";
pub const TOTAL_DEBITS_COLUMN: &str = "Total Debits";
pub const NET_COLUMN: &str = "Net";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryRow {
    pub period: Period,
    /// Aligned with [`CrossPeriodSummary::credit_columns`].
    pub credits: Vec<Option<Decimal>>,
    /// Aligned with [`CrossPeriodSummary::debit_columns`].
    pub debits: Vec<Option<Decimal>>,
    pub total_credits: Decimal,
    pub total_debits: Decimal,
    pub net: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrossPeriodSummary {
    credit_columns: Vec<ItemDescriptor>,
    debit_columns: Vec<ItemDescriptor>,
    rows: Vec<SummaryRow>,
}

impl CrossPeriodSummary {
    pub fn credit_columns(&self) -> &[ItemDescriptor] {
        &self.credit_columns
    }

    pub fn debit_columns(&self) -> &[ItemDescriptor] {
        &self.debit_columns
    }

    pub fn rows(&self) -> &[SummaryRow] {
        &self.rows
    }

    pub fn row(&self, period: Period) -> Option<&SummaryRow> {
        self.rows.iter().find(|r| r.period == period)
    }

    pub fn columns(&self) -> Vec<String> {
        let mut columns = Vec::with_capacity(self.credit_columns.len() + self.debit_columns.len() + 4);
        columns.push(PERIOD_COLUMN.to_string());
        columns.extend(self.credit_columns.iter().map(|d| d.to_string()));
        columns.push(TOTAL_CREDITS_COLUMN.to_string());
        columns.extend(self.debit_columns.iter().map(|d| d.to_string()));
        columns.push(TOTAL_DEBITS_COLUMN.to_string());
        columns.push(NET_COLUMN.to_string());
        columns
    }

    /// Renders the summary with formula cells for the computed columns.
    pub fn to_sheet_data(&self) -> SheetData {
        let credits_start = 1;
        let total_credits_col = credits_start + self.credit_columns.len();
        let debits_start = total_credits_col + 1;
        let total_debits_col = debits_start + self.debit_columns.len();

        let rows = self
            .rows
            .iter()
            .enumerate()
            .map(|(idx, row)| {
                let sheet_row = idx + 2;
                let mut cells = Vec::new();
                cells.push(Cell::Text(row.period.to_string()));
                cells.extend(row.credits.iter().map(amount_cell));
                cells.push(sum_formula(credits_start, total_credits_col, sheet_row));
                cells.extend(row.debits.iter().map(amount_cell));
                cells.push(sum_formula(debits_start, total_debits_col, sheet_row));
                cells.push(Cell::Formula(format!(
                    "={}{}-{}{}",
                    column_letter(total_credits_col),
                    sheet_row,
                    column_letter(total_debits_col),
                    sheet_row
                )));
                cells
            })
            .collect();

        SheetData {
            name: SUMMARY_SHEET.to_string(),
            columns: self.columns(),
            rows,
        }
    }
}

fn amount_cell(value: &Option<Decimal>) -> Cell {
    match value {
        Some(amount) => Cell::Amount(*amount),
        None => Cell::Empty,
    }
}

/// `=SUM(..)` over columns `[first, end)` of one row, or a literal zero when
/// the range is empty.
fn sum_formula(first: usize, end: usize, sheet_row: usize) -> Cell {
    if first == end {
        return Cell::Amount(Decimal::ZERO);
    }
    Cell::Formula(format!(
        "=SUM({}{}:{}{})",
        column_letter(first),
        sheet_row,
        column_letter(end - 1),
        sheet_row
    ))
}

pub struct SummaryBuilder;

impl SummaryBuilder {
    /// Builds the summary, or `None` when no record was retained.
    ///
    /// Rows come out in chronological order. When the same period appears
    /// more than once the last record for it wins, matching the replace
    /// semantics of the aggregation sheets.
    pub fn build(records: &[PeriodRecord]) -> Option<CrossPeriodSummary> {
        if records.is_empty() {
            return None;
        }

        let mut by_period: BTreeMap<Period, &PeriodRecord> = BTreeMap::new();
        for record in records {
            if by_period.insert(record.period(), record).is_some() {
                debug!("Period {} retained twice, keeping the later record", record.period());
            }
        }

        let credit_columns = descriptor_axis(by_period.values().copied(), Category::Credits);
        let debit_columns = descriptor_axis(by_period.values().copied(), Category::Debits);

        let rows: Vec<SummaryRow> = by_period
            .values()
            .map(|record| {
                let credits = aligned(record, Category::Credits, &credit_columns);
                let debits = aligned(record, Category::Debits, &debit_columns);
                let total_credits: Decimal = credits.iter().filter_map(|c| *c).sum();
                let total_debits: Decimal = debits.iter().filter_map(|c| *c).sum();
                SummaryRow {
                    period: record.period(),
                    credits,
                    debits,
                    total_credits,
                    total_debits,
                    net: total_credits - total_debits,
                }
            })
            .collect();

        info!(
            "Built summary: {} periods, {} credit columns, {} debit columns",
            rows.len(),
            credit_columns.len(),
            debit_columns.len()
        );

        Some(CrossPeriodSummary {
            credit_columns,
            debit_columns,
            rows,
        })
    }
}

fn descriptor_axis<'a>(
    records: impl Iterator<Item = &'a PeriodRecord>,
    category: Category,
) -> Vec<ItemDescriptor> {
    let mut axis: Vec<ItemDescriptor> = records
        .flat_map(|r| r.items(category).descriptors().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    // Header text order; ties keep the descriptor order.
    axis.sort_by_cached_key(|d| d.to_string());
    axis
}

fn aligned(
    record: &PeriodRecord,
    category: Category,
    columns: &[ItemDescriptor],
) -> Vec<Option<Decimal>> {
    let items = record.items(category);
    columns.iter().map(|d| items.get(d)).collect()
}
