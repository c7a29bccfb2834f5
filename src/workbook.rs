//! One styled xlsx workbook per run holding every sheet.
//!
//! Each write rewrites `<root>/<run id>/receipt_analysis.xlsx` with all sheets
//! of the run known so far, in the order they were first written. Formula
//! cells go in as formulas; the spreadsheet application computes them.

use crate::error::Result;
use crate::sink::{Cell, RunId, RunStore, SheetData, SpreadsheetSink};
use calamine::{open_workbook, Data, Reader, Xlsx};
use log::debug;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_xlsxwriter::{Color, Format, FormatBorder, Workbook, Worksheet};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

pub const WORKBOOK_NAME: &str = "receipt_analysis.xlsx";

const HEADER_BG: u32 = 0x1E40AF;
const ALT_ROW_BG: u32 = 0xF1F5F9;
const PERIOD_BG: u32 = 0xF8FAFC;
const TEXT_DARK: u32 = 0x1F2937;
const AMOUNT_FORMAT: &str = "$#,##0.00";
const PERIOD_WIDTH: f64 = 12.0;

/// Spreadsheet sink writing xlsx workbooks under a [`RunStore`] layout.
#[derive(Debug, Clone)]
pub struct WorkbookStore {
    store: RunStore,
    runs: HashMap<RunId, Vec<SheetData>>,
}

impl WorkbookStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            store: RunStore::new(root),
            runs: HashMap::new(),
        }
    }

    pub fn workbook_path(&self, run_id: RunId) -> PathBuf {
        self.store.run_dir(run_id).join(WORKBOOK_NAME)
    }

    /// Sheets of a run in workbook order, read from disk.
    pub fn read_all(&self, run_id: RunId) -> Result<Vec<SheetData>> {
        let path = self.workbook_path(run_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut workbook: Xlsx<_> = open_workbook(&path)?;
        let names = workbook.sheet_names();
        names
            .iter()
            .map(|name| read_worksheet(&mut workbook, name))
            .collect()
    }

    /// Sheets of a run, loading an existing workbook the first time a run
    /// is touched.
    fn sheets_mut(&mut self, run_id: RunId) -> Result<&mut Vec<SheetData>> {
        if !self.runs.contains_key(&run_id) {
            let existing = self.read_all(run_id)?;
            self.runs.insert(run_id, existing);
        }
        Ok(self.runs.entry(run_id).or_default())
    }
}

impl SpreadsheetSink for WorkbookStore {
    fn write_sheet(&mut self, run_id: RunId, sheet: &SheetData) -> Result<()> {
        let sheets = self.sheets_mut(run_id)?;
        match sheets.iter_mut().find(|s| s.name == sheet.name) {
            Some(existing) => *existing = sheet.clone(),
            None => sheets.push(sheet.clone()),
        }

        let mut workbook = Workbook::new();
        for data in sheets.iter() {
            let worksheet = workbook.add_worksheet();
            write_worksheet(worksheet, data)?;
        }

        std::fs::create_dir_all(self.store.run_dir(run_id))?;
        let path = self.workbook_path(run_id);
        workbook.save(&path)?;
        debug!(
            "Wrote sheet '{}' ({} columns, {} rows) into {}",
            sheet.name,
            sheet.columns.len(),
            sheet.rows.len(),
            path.display()
        );
        Ok(())
    }

    fn read_sheet(&self, run_id: RunId, name: &str) -> Result<Option<SheetData>> {
        let path = self.workbook_path(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let mut workbook: Xlsx<_> = open_workbook(&path)?;
        if !workbook.sheet_names().iter().any(|n| n == name) {
            return Ok(None);
        }
        read_worksheet(&mut workbook, name).map(Some)
    }
}

struct Styles {
    header: Format,
    period: Format,
    amount: Format,
    amount_alt: Format,
    text: Format,
    text_alt: Format,
}

impl Styles {
    fn new() -> Self {
        let cell = Format::new()
            .set_font_color(Color::RGB(TEXT_DARK))
            .set_border(FormatBorder::Thin)
            .set_border_color(Color::RGB(0xE5E7EB));
        let amount = cell.clone().set_num_format(AMOUNT_FORMAT);
        Self {
            header: Format::new()
                .set_bold()
                .set_font_color(Color::White)
                .set_background_color(Color::RGB(HEADER_BG))
                .set_border(FormatBorder::Thin),
            period: Format::new()
                .set_bold()
                .set_font_color(Color::RGB(HEADER_BG))
                .set_background_color(Color::RGB(PERIOD_BG))
                .set_border(FormatBorder::Thin)
                .set_border_color(Color::RGB(0xE5E7EB)),
            amount_alt: amount.clone().set_background_color(Color::RGB(ALT_ROW_BG)),
            amount,
            text_alt: cell.clone().set_background_color(Color::RGB(ALT_ROW_BG)),
            text: cell,
        }
    }
}

fn write_worksheet(worksheet: &mut Worksheet, data: &SheetData) -> Result<()> {
    let styles = Styles::new();
    worksheet.set_name(&data.name)?;

    for (col, title) in data.columns.iter().enumerate() {
        let col = col as u16;
        worksheet.write_string_with_format(0, col, title, &styles.header)?;
        let width = if col == 0 {
            PERIOD_WIDTH
        } else {
            (title.chars().count() + 2).clamp(15, 30) as f64
        };
        worksheet.set_column_width(col, width)?;
    }

    for (idx, row) in data.rows.iter().enumerate() {
        let sheet_row = (idx + 1) as u32;
        let alternate = idx % 2 == 1;
        let (amount, text) = if alternate {
            (&styles.amount_alt, &styles.text_alt)
        } else {
            (&styles.amount, &styles.text)
        };

        for (col, cell) in row.iter().enumerate() {
            let col = col as u16;
            let format = if col == 0 { &styles.period } else { text };
            match cell {
                Cell::Empty => {
                    worksheet.write_blank(sheet_row, col, format)?;
                }
                Cell::Text(value) => {
                    worksheet.write_string_with_format(sheet_row, col, value, format)?;
                }
                Cell::Amount(value) => match value.to_f64() {
                    Some(number) => {
                        worksheet.write_number_with_format(sheet_row, col, number, amount)?;
                    }
                    None => {
                        worksheet.write_string_with_format(sheet_row, col, value.to_string(), amount)?;
                    }
                },
                Cell::Formula(formula) => {
                    worksheet.write_formula_with_format(sheet_row, col, formula.as_str(), amount)?;
                }
            }
        }
    }

    if !data.columns.is_empty() {
        worksheet.set_freeze_panes(1, 1)?;
        let last_col = (data.columns.len() - 1) as u16;
        worksheet.autofilter(0, 0, data.rows.len() as u32, last_col)?;
    }
    Ok(())
}

fn read_worksheet<R>(workbook: &mut Xlsx<R>, name: &str) -> Result<SheetData>
where
    R: std::io::Read + std::io::Seek,
{
    let values = workbook.worksheet_range(name)?;
    let formulas = workbook.worksheet_formula(name)?;

    let Some((last_row, last_col)) = values.end() else {
        return Ok(SheetData {
            name: name.to_string(),
            columns: Vec::new(),
            rows: Vec::new(),
        });
    };

    let columns: Vec<String> = (0..=last_col)
        .map(|col| match values.get_value((0, col)) {
            Some(Data::String(title)) => title.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        })
        .collect();

    let rows = (1..=last_row)
        .map(|row| {
            (0..=last_col)
                .map(|col| {
                    let formula = formulas.get_value((row, col)).filter(|f| !f.is_empty());
                    match formula {
                        Some(f) if f.starts_with('=') => Cell::Formula(f.clone()),
                        Some(f) => Cell::Formula(format!("={}", f)),
                        None => cell_from(values.get_value((row, col))),
                    }
                })
                .collect()
        })
        .collect();

    Ok(SheetData {
        name: name.to_string(),
        columns,
        rows,
    })
}

fn cell_from(value: Option<&Data>) -> Cell {
    match value {
        None | Some(Data::Empty) => Cell::Empty,
        Some(Data::String(text)) => Cell::Text(text.clone()),
        Some(Data::Int(n)) => Cell::Amount(Decimal::from(*n)),
        Some(Data::Float(f)) => match Decimal::from_str(&f.to_string()) {
            Ok(amount) => Cell::Amount(amount),
            Err(_) => Cell::Text(f.to_string()),
        },
        Some(other) => Cell::Text(other.to_string()),
    }
}
