//! Turns one rendered period page into a [`PeriodRecord`].
//!
//! The concepts table lists one line item per row: concept code, entity,
//! description, credit amount, debit amount. A cell that does not parse as a
//! comma-decimal amount is dropped on its own; it never invalidates the row
//! or the period. Only building an [`Extractor`] from bad selectors can fail;
//! extraction itself never returns an error.

use crate::error::{HarvestError, Result};
use crate::schema::{ItemDescriptor, LineItems, Period, PeriodRecord, PortalProfile};
use crate::utils::parse_amount;
use log::debug;
use scraper::{ElementRef, Html, Selector};

const MIN_CELLS: usize = 5;

/// What a single extraction pass saw, besides the record itself.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub record: Option<PeriodRecord>,
    pub table_found: bool,
    pub rows_seen: usize,
    pub skipped_cells: usize,
}

impl Extraction {
    /// Human readable reason for a missing record.
    pub fn failure_reason(&self) -> Option<String> {
        if self.record.is_some() {
            return None;
        }
        if !self.table_found {
            Some("concepts table not present on the page".to_string())
        } else {
            Some(format!(
                "no parseable amounts in {} rows ({} malformed cells)",
                self.rows_seen, self.skipped_cells
            ))
        }
    }
}

pub struct Extractor {
    table: Selector,
    rows: Selector,
    cells: Selector,
}

impl Extractor {
    pub fn new(profile: &PortalProfile) -> Result<Self> {
        Ok(Self {
            table: parse_selector(&profile.concepts_table)?,
            rows: parse_selector(&profile.concept_rows)?,
            cells: parse_selector("td")?,
        })
    }

    pub fn extract(&self, html: &str, period: Period) -> Option<PeriodRecord> {
        self.extract_detailed(html, period).record
    }

    pub fn extract_detailed(&self, html: &str, period: Period) -> Extraction {
        let document = Html::parse_document(html);
        let mut extraction = Extraction::default();

        let Some(table) = document.select(&self.table).next() else {
            debug!("Period {}: concepts table not found", period);
            return extraction;
        };
        extraction.table_found = true;

        let mut credits = LineItems::new();
        let mut debits = LineItems::new();

        for row in table.select(&self.rows) {
            extraction.rows_seen += 1;

            let cells: Vec<String> = row.select(&self.cells).map(cell_text).collect();
            if cells.len() < MIN_CELLS {
                debug!(
                    "Period {}: row {} has {} cells, skipping",
                    period,
                    extraction.rows_seen,
                    cells.len()
                );
                continue;
            }

            let descriptor = ItemDescriptor::new(&cells[0], &cells[1], &cells[2]);

            for (raw, items) in [(&cells[3], &mut credits), (&cells[4], &mut debits)] {
                if raw.is_empty() {
                    continue;
                }
                match parse_amount(raw) {
                    Some(amount) => items.insert(descriptor.clone(), amount),
                    None => {
                        extraction.skipped_cells += 1;
                        debug!(
                            "Period {}: unparseable amount '{}' for {}",
                            period, raw, descriptor
                        );
                    }
                }
            }
        }

        debug!(
            "Period {}: {} credits, {} debits from {} rows ({} malformed cells)",
            period,
            credits.len(),
            debits.len(),
            extraction.rows_seen,
            extraction.skipped_cells
        );

        if !(credits.is_empty() && debits.is_empty()) {
            extraction.record = Some(PeriodRecord::new(period, credits, debits));
        }

        extraction
    }
}

fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| {
        HarvestError::InvalidConfig(format!("invalid CSS selector '{}': {:?}", selector, e))
    })
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
