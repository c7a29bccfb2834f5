//! Schema-evolving period tables.
//!
//! Each [`AggregationSheet`] keeps one row per period and one column per item
//! descriptor. Columns are appended the first time a descriptor shows up and
//! never move afterwards. Upserting a period that already has a row replaces
//! that row in place. A cell is `None` when the period did not list the item;
//! an explicit zero stays `Some(0)`.

use crate::error::{HarvestError, Result};
use crate::schema::{Category, ItemDescriptor, Period, PeriodRecord};
use crate::sink::{Cell, SheetData};
use crate::utils::column_letter;
use log::debug;
use rust_decimal::Decimal;
use std::collections::HashMap;

pub const PERIOD_COLUMN: &str = "Period";
pub const TOTAL_COLUMN: &str = "Total";

#[derive(Debug, Clone, PartialEq)]
pub struct SheetRow {
    pub period: Period,
    pub cells: Vec<Option<Decimal>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// The period got a fresh row (as opposed to replacing its old one).
    pub inserted: bool,
    pub new_columns: usize,
}

#[derive(Debug, Clone)]
pub struct AggregationSheet {
    category: Category,
    columns: Vec<ItemDescriptor>,
    column_index: HashMap<ItemDescriptor, usize>,
    rows: Vec<SheetRow>,
    row_index: HashMap<Period, usize>,
    has_total: bool,
}

impl AggregationSheet {
    pub fn new(category: Category) -> Self {
        Self {
            category,
            columns: Vec::new(),
            column_index: HashMap::new(),
            rows: Vec::new(),
            row_index: HashMap::new(),
            has_total: false,
        }
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn name(&self) -> &'static str {
        self.category.sheet_name()
    }

    pub fn columns(&self) -> &[ItemDescriptor] {
        &self.columns
    }

    pub fn rows(&self) -> &[SheetRow] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_total(&self) -> bool {
        self.has_total
    }

    /// Inserts or replaces the row for `record`'s period with its items of
    /// this sheet's category.
    ///
    /// A record with no items of this category leaves an absent period
    /// absent, and clears the row of a period that is already present.
    pub fn upsert(&mut self, record: &PeriodRecord) -> Result<UpsertOutcome> {
        if self.has_total {
            return Err(HarvestError::SheetSealed(self.name().to_string()));
        }

        let items = record.items(self.category);
        let period = record.period();

        if items.is_empty() && !self.row_index.contains_key(&period) {
            return Ok(UpsertOutcome {
                inserted: false,
                new_columns: 0,
            });
        }

        let mut new_columns = 0;
        for descriptor in items.descriptors() {
            if !self.column_index.contains_key(descriptor) {
                self.column_index
                    .insert(descriptor.clone(), self.columns.len());
                self.columns.push(descriptor.clone());
                new_columns += 1;
            }
        }

        if new_columns > 0 {
            let width = self.columns.len();
            for row in &mut self.rows {
                row.cells.resize(width, None);
            }
            debug!(
                "{} sheet: {} new columns, {} total",
                self.name(),
                new_columns,
                width
            );
        }

        let mut cells = vec![None; self.columns.len()];
        for item in items.iter() {
            cells[self.column_index[&item.descriptor]] = Some(item.amount);
        }

        let inserted = match self.row_index.get(&period) {
            Some(&idx) => {
                self.rows[idx].cells = cells;
                debug!("{} sheet: replaced row for {}", self.name(), period);
                false
            }
            None => {
                self.row_index.insert(period, self.rows.len());
                self.rows.push(SheetRow { period, cells });
                debug!("{} sheet: new row for {}", self.name(), period);
                true
            }
        };

        Ok(UpsertOutcome {
            inserted,
            new_columns,
        })
    }

    pub fn cell(&self, period: Period, descriptor: &ItemDescriptor) -> Option<Decimal> {
        let row = self.row_index.get(&period)?;
        let col = self.column_index.get(descriptor)?;
        self.rows[*row].cells[*col]
    }

    /// Exact sum of the populated cells of a period's row.
    pub fn row_total(&self, period: Period) -> Option<Decimal> {
        let row = self.row_index.get(&period)?;
        Some(self.rows[*row].cells.iter().filter_map(|c| *c).sum())
    }

    /// Appends the total column. Happens once; later calls return `false`.
    /// The sheet rejects upserts from then on.
    pub fn finalize_totals(&mut self) -> bool {
        if self.has_total {
            return false;
        }
        self.has_total = true;
        true
    }

    /// Renders the sheet with a header row; data rows start at row 2.
    pub fn to_sheet_data(&self) -> SheetData {
        let mut columns = Vec::with_capacity(self.columns.len() + 2);
        columns.push(PERIOD_COLUMN.to_string());
        columns.extend(self.columns.iter().map(|d| d.to_string()));
        if self.has_total {
            columns.push(TOTAL_COLUMN.to_string());
        }

        let rows = self
            .rows
            .iter()
            .enumerate()
            .map(|(idx, row)| {
                let mut cells = Vec::with_capacity(columns.len());
                cells.push(Cell::Text(row.period.to_string()));
                cells.extend(row.cells.iter().map(|c| match c {
                    Some(amount) => Cell::Amount(*amount),
                    None => Cell::Empty,
                }));
                if self.has_total {
                    cells.push(self.total_formula(idx + 2));
                }
                cells
            })
            .collect();

        SheetData {
            name: self.name().to_string(),
            columns,
            rows,
        }
    }

    fn total_formula(&self, sheet_row: usize) -> Cell {
        if self.columns.is_empty() {
            return Cell::Amount(Decimal::ZERO);
        }
        let first = column_letter(1);
        let last = column_letter(self.columns.len());
        Cell::Formula(format!("=SUM({first}{sheet_row}:{last}{sheet_row})"))
    }
}

/// The Credits and Debits sheets of one run.
#[derive(Debug, Clone)]
pub struct AggregationStore {
    credits: AggregationSheet,
    debits: AggregationSheet,
}

impl Default for AggregationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AggregationStore {
    pub fn new() -> Self {
        Self {
            credits: AggregationSheet::new(Category::Credits),
            debits: AggregationSheet::new(Category::Debits),
        }
    }

    pub fn sheet(&self, category: Category) -> &AggregationSheet {
        match category {
            Category::Credits => &self.credits,
            Category::Debits => &self.debits,
        }
    }

    pub fn upsert(&mut self, record: &PeriodRecord, category: Category) -> Result<UpsertOutcome> {
        match category {
            Category::Credits => self.credits.upsert(record),
            Category::Debits => self.debits.upsert(record),
        }
    }

    /// Upserts both categories of a record.
    pub fn upsert_record(&mut self, record: &PeriodRecord) -> Result<()> {
        self.upsert(record, Category::Credits)?;
        self.upsert(record, Category::Debits)?;
        Ok(())
    }

    pub fn finalize_totals(&mut self) {
        self.credits.finalize_totals();
        self.debits.finalize_totals();
    }

    /// Non-empty sheets, Credits first.
    pub fn sheets(&self) -> Vec<SheetData> {
        [&self.credits, &self.debits]
            .into_iter()
            .filter(|s| !s.is_empty())
            .map(AggregationSheet::to_sheet_data)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::LineItems;

    fn d(code: &str) -> ItemDescriptor {
        ItemDescriptor::new(code, "000", format!("Item {}", code))
    }

    fn amount(v: i64) -> Decimal {
        Decimal::new(v, 0)
    }

    fn record(month: u32, credits: &[(&str, i64)], debits: &[(&str, i64)]) -> PeriodRecord {
        PeriodRecord::new(
            Period::new(2024, month).unwrap(),
            credits.iter().map(|(c, v)| (d(c), amount(*v))).collect(),
            debits.iter().map(|(c, v)| (d(c), amount(*v))).collect(),
        )
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let rec = record(1, &[("A", 100), ("B", 20)], &[]);

        let mut once = AggregationSheet::new(Category::Credits);
        once.upsert(&rec).unwrap();

        let mut twice = AggregationSheet::new(Category::Credits);
        let first = twice.upsert(&rec).unwrap();
        let second = twice.upsert(&rec).unwrap();

        assert!(first.inserted);
        assert!(!second.inserted);
        assert_eq!(second.new_columns, 0);
        assert_eq!(once.rows(), twice.rows());
        assert_eq!(once.columns(), twice.columns());
        assert_eq!(once.to_sheet_data(), twice.to_sheet_data());
    }

    #[test]
    fn test_columns_only_append_in_first_seen_order() {
        let mut sheet = AggregationSheet::new(Category::Credits);
        let steps = [
            record(1, &[("B", 1), ("A", 2)], &[]),
            record(2, &[("C", 3)], &[]),
            record(3, &[("A", 4)], &[]),
            record(4, &[("D", 5), ("B", 6)], &[]),
        ];

        let mut previous: Vec<ItemDescriptor> = Vec::new();
        for step in &steps {
            sheet.upsert(step).unwrap();
            let current = sheet.columns().to_vec();
            assert_eq!(&current[..previous.len()], &previous[..]);
            previous = current;
        }

        assert_eq!(previous, vec![d("B"), d("A"), d("C"), d("D")]);
    }

    #[test]
    fn test_rows_stay_aligned_with_empty_cells() {
        let mut sheet = AggregationSheet::new(Category::Credits);
        sheet.upsert(&record(1, &[("A", 100)], &[])).unwrap();
        sheet.upsert(&record(2, &[("B", 20)], &[])).unwrap();

        for row in sheet.rows() {
            assert_eq!(row.cells.len(), 2);
        }
        let jan = Period::new(2024, 1).unwrap();
        assert_eq!(sheet.cell(jan, &d("A")), Some(amount(100)));
        assert_eq!(sheet.cell(jan, &d("B")), None);
    }

    #[test]
    fn test_replacing_row_keeps_position_and_clears_stale_cells() {
        let mut sheet = AggregationSheet::new(Category::Credits);
        sheet.upsert(&record(1, &[("A", 100), ("B", 5)], &[])).unwrap();
        sheet.upsert(&record(2, &[("A", 50)], &[])).unwrap();
        sheet.upsert(&record(1, &[("A", 110)], &[])).unwrap();

        let jan = Period::new(2024, 1).unwrap();
        assert_eq!(sheet.rows()[0].period, jan);
        assert_eq!(sheet.rows().len(), 2);
        assert_eq!(sheet.cell(jan, &d("A")), Some(amount(110)));
        assert_eq!(sheet.cell(jan, &d("B")), None);
        assert_eq!(sheet.columns().len(), 2);
    }

    #[test]
    fn test_zero_differs_from_absent() {
        let mut sheet = AggregationSheet::new(Category::Debits);
        sheet.upsert(&record(1, &[], &[("X", 0)])).unwrap();
        sheet.upsert(&record(2, &[], &[("Y", 3)])).unwrap();

        let data = sheet.to_sheet_data();
        assert_eq!(data.rows[0][1], Cell::Amount(Decimal::ZERO));
        assert_eq!(data.rows[0][2], Cell::Empty);
    }

    #[test]
    fn test_empty_category_does_not_create_row() {
        let mut sheet = AggregationSheet::new(Category::Debits);
        let outcome = sheet.upsert(&record(1, &[("A", 1)], &[])).unwrap();
        assert!(!outcome.inserted);
        assert!(sheet.is_empty());
    }

    #[test]
    fn test_total_column_added_once_and_seals() {
        let mut sheet = AggregationSheet::new(Category::Credits);
        sheet.upsert(&record(1, &[("A", 100)], &[])).unwrap();
        sheet.upsert(&record(2, &[("A", 50), ("B", 20)], &[])).unwrap();

        assert!(sheet.finalize_totals());
        assert!(!sheet.finalize_totals());

        let data = sheet.to_sheet_data();
        assert_eq!(data.columns.last().map(String::as_str), Some(TOTAL_COLUMN));
        assert_eq!(
            data.columns.iter().filter(|c| c.as_str() == TOTAL_COLUMN).count(),
            1
        );
        assert_eq!(data.rows[0][3], Cell::Formula("=SUM(B2:C2)".to_string()));
        assert_eq!(data.rows[1][3], Cell::Formula("=SUM(B3:C3)".to_string()));
        assert_eq!(
            sheet.row_total(Period::new(2024, 2).unwrap()),
            Some(amount(70))
        );

        assert!(matches!(
            sheet.upsert(&record(3, &[("A", 1)], &[])),
            Err(HarvestError::SheetSealed(_))
        ));
    }

    #[test]
    fn test_store_keeps_independent_sheets() {
        let mut store = AggregationStore::new();
        store
            .upsert_record(&record(1, &[("A", 100)], &[]))
            .unwrap();
        store
            .upsert_record(&record(2, &[("A", 50)], &[("X", 10)]))
            .unwrap();

        assert_eq!(store.sheet(Category::Credits).rows().len(), 2);
        assert_eq!(store.sheet(Category::Debits).rows().len(), 1);
        assert_eq!(store.sheets().len(), 2);

        let empty = PeriodRecord::new(Period::new(2024, 5).unwrap(), LineItems::new(), LineItems::new());
        store.upsert(&empty, Category::Credits).unwrap();
        assert_eq!(store.sheet(Category::Credits).rows().len(), 2);
    }
}
