//! Output sinks and the run-scoped store behind them.
//!
//! A [`SpreadsheetSink`] takes `(sheet name, ordered columns, rows)` and keeps
//! it under a run identifier. A [`DocumentSink`] takes the ordered per-period
//! PDF chunks and hands back one combined document. [`RunStore`] implements
//! both on top of a directory per run: one CSV file per sheet and a single
//! merged PDF.

use crate::error::{HarvestError, Result};
use log::{debug, info, warn};
use lopdf::{Document, Object, ObjectId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

pub const COMBINED_DOCUMENT_NAME: &str = "combined.pdf";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for RunId {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| HarvestError::InvalidConfig(format!("invalid run id '{}': {}", s, e)))
    }
}

/// One spreadsheet cell. Formulas are kept verbatim, including the leading `=`.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Amount(Decimal),
    Formula(String),
}

impl Cell {
    pub fn render(&self) -> String {
        match self {
            Cell::Empty => String::new(),
            Cell::Text(text) => text.clone(),
            Cell::Amount(amount) => amount.to_string(),
            Cell::Formula(formula) => formula.clone(),
        }
    }

    fn parse(raw: &str) -> Self {
        if raw.is_empty() {
            Cell::Empty
        } else if raw.starts_with('=') {
            Cell::Formula(raw.to_string())
        } else if let Ok(amount) = Decimal::from_str(raw) {
            Cell::Amount(amount)
        } else {
            Cell::Text(raw.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SheetData {
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl SheetData {
    /// CSV rendering; same sheet, same bytes.
    pub fn to_csv_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::CRLF)
            .from_writer(Vec::new());

        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row.iter().map(Cell::render))?;
        }

        writer
            .into_inner()
            .map_err(|e| HarvestError::IoError(e.into_error()))
    }

    pub fn from_csv_bytes(name: &str, bytes: &[u8]) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(bytes);

        let columns = reader.headers()?.iter().map(str::to_string).collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            rows.push(record?.iter().map(Cell::parse).collect());
        }

        Ok(Self {
            name: name.to_string(),
            columns,
            rows,
        })
    }
}

pub trait SpreadsheetSink {
    /// Stores the sheet, replacing an earlier version with the same name.
    fn write_sheet(&mut self, run_id: RunId, sheet: &SheetData) -> Result<()>;

    fn read_sheet(&self, run_id: RunId, name: &str) -> Result<Option<SheetData>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentHandle {
    pub path: PathBuf,
    pub parts: usize,
    pub pages: usize,
}

pub trait DocumentSink {
    /// Combines the chunks, in the given order, into one document.
    fn combine(&mut self, run_id: RunId, chunks: &[Vec<u8>]) -> Result<DocumentHandle>;
}

/// Directory-backed store: `<root>/<run id>/<sheet>.csv` and
/// `<root>/<run id>/combined.pdf`.
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    pub fn sheet_path(&self, run_id: RunId, name: &str) -> PathBuf {
        self.run_dir(run_id).join(format!("{}.csv", name))
    }

    pub fn document_path(&self, run_id: RunId) -> PathBuf {
        self.run_dir(run_id).join(COMBINED_DOCUMENT_NAME)
    }

    pub fn read_document(&self, run_id: RunId) -> Result<Option<Vec<u8>>> {
        read_if_exists(&self.document_path(run_id))
    }

    /// Removes run directories last modified more than `ttl` ago.
    pub fn cleanup_older_than(&self, ttl: Duration) -> Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }

        let cutoff = SystemTime::now()
            .checked_sub(ttl)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;

        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            let is_run_dir = entry
                .file_name()
                .to_str()
                .is_some_and(|name| RunId::from_str(name).is_ok());
            if !metadata.is_dir() || !is_run_dir {
                continue;
            }
            if metadata.modified()? <= cutoff {
                std::fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!("Removed {} expired run directories from {}", removed, self.root.display());
        }
        Ok(removed)
    }

    fn ensure_run_dir(&self, run_id: RunId) -> Result<PathBuf> {
        let dir = self.run_dir(run_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

impl SpreadsheetSink for RunStore {
    fn write_sheet(&mut self, run_id: RunId, sheet: &SheetData) -> Result<()> {
        self.ensure_run_dir(run_id)?;
        let path = self.sheet_path(run_id, &sheet.name);
        std::fs::write(&path, sheet.to_csv_bytes()?)?;
        debug!(
            "Wrote sheet '{}' ({} columns, {} rows) to {}",
            sheet.name,
            sheet.columns.len(),
            sheet.rows.len(),
            path.display()
        );
        Ok(())
    }

    fn read_sheet(&self, run_id: RunId, name: &str) -> Result<Option<SheetData>> {
        match read_if_exists(&self.sheet_path(run_id, name))? {
            Some(bytes) => Ok(Some(SheetData::from_csv_bytes(name, &bytes)?)),
            None => Ok(None),
        }
    }
}

impl DocumentSink for RunStore {
    fn combine(&mut self, run_id: RunId, chunks: &[Vec<u8>]) -> Result<DocumentHandle> {
        let (bytes, parts, pages) = merge_pdfs(chunks)?;
        self.ensure_run_dir(run_id)?;
        let path = self.document_path(run_id);
        std::fs::write(&path, bytes)?;
        info!(
            "Combined {} documents ({} pages) into {}",
            parts,
            pages,
            path.display()
        );
        Ok(DocumentHandle { path, parts, pages })
    }
}

fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn object_type(object: &Object) -> Option<&[u8]> {
    object.as_dict().ok()?.get(b"Type").ok()?.as_name().ok()
}

/// Concatenates PDF documents page by page, in order.
///
/// A chunk that is not a readable PDF is skipped with a warning; the merge
/// fails only when no chunk could be read. Returns the combined bytes, the
/// number of chunks used and the number of pages.
pub fn merge_pdfs(chunks: &[Vec<u8>]) -> Result<(Vec<u8>, usize, usize)> {
    let mut max_id = 1;
    let mut parts = 0;
    let mut pages: Vec<(ObjectId, Object)> = Vec::new();
    let mut objects: BTreeMap<ObjectId, Object> = BTreeMap::new();

    for (idx, chunk) in chunks.iter().enumerate() {
        let mut doc = match Document::load_mem(chunk) {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Skipping unreadable document #{} in merge: {}", idx + 1, e);
                continue;
            }
        };

        doc.renumber_objects_with(max_id);
        max_id = doc.max_id + 1;

        for page_id in doc.get_pages().into_values() {
            pages.push((page_id, doc.get_object(page_id)?.to_owned()));
        }
        objects.extend(doc.objects);
        parts += 1;
    }

    if parts == 0 {
        return Err(HarvestError::Merge(format!(
            "none of the {} documents could be read",
            chunks.len()
        )));
    }

    let mut merged = Document::with_version("1.5");
    let mut catalog: Option<(ObjectId, Object)> = None;
    let mut pages_root: Option<ObjectId> = None;
    let mut pages_dict: Option<lopdf::Dictionary> = None;

    for (id, object) in objects {
        match object_type(&object) {
            Some(b"Catalog") => {
                if catalog.is_none() {
                    catalog = Some((id, object));
                }
            }
            Some(b"Pages") => {
                if pages_root.is_none() {
                    pages_root = Some(id);
                    pages_dict = object.as_dict().ok().cloned();
                }
            }
            Some(b"Page") | Some(b"Outlines") | Some(b"Outline") => {}
            _ => {
                merged.objects.insert(id, object);
            }
        }
    }

    let (catalog_id, catalog_object) =
        catalog.ok_or_else(|| HarvestError::Merge("no document catalog found".to_string()))?;
    let pages_id =
        pages_root.ok_or_else(|| HarvestError::Merge("no page tree found".to_string()))?;
    let page_count = pages.len();

    for (id, object) in &pages {
        if let Ok(dict) = object.as_dict() {
            let mut dict = dict.clone();
            dict.set("Parent", Object::Reference(pages_id));
            merged.objects.insert(*id, Object::Dictionary(dict));
        }
    }

    let mut root_dict = pages_dict.unwrap_or_default();
    root_dict.set("Type", Object::Name(b"Pages".to_vec()));
    root_dict.set("Count", Object::Integer(page_count as i64));
    root_dict.set(
        "Kids",
        Object::Array(pages.iter().map(|(id, _)| Object::Reference(*id)).collect()),
    );
    root_dict.remove(b"Parent");
    merged.objects.insert(pages_id, Object::Dictionary(root_dict));

    let mut catalog_dict = catalog_object.as_dict()?.clone();
    catalog_dict.set("Pages", Object::Reference(pages_id));
    catalog_dict.remove(b"Outlines");
    merged.objects.insert(catalog_id, Object::Dictionary(catalog_dict));

    merged.trailer.set("Root", Object::Reference(catalog_id));
    merged.max_id = merged.objects.keys().map(|(id, _)| *id).max().unwrap_or(0);
    merged.renumber_objects();
    merged.compress();

    let mut bytes = Vec::new();
    merged.save_to(&mut bytes)?;
    Ok((bytes, parts, page_count))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use lopdf::dictionary;

    /// A minimal PDF with `page_count` blank pages.
    pub(crate) fn blank_pdf(page_count: usize) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let mut kids = Vec::new();
        for _ in 0..page_count {
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => Object::Reference(pages_id),
                "MediaBox" => Object::Array(vec![
                    Object::Integer(0),
                    Object::Integer(0),
                    Object::Integer(595),
                    Object::Integer(842),
                ]),
            });
            kids.push(Object::Reference(page_id));
        }
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => Object::Array(kids),
                "Count" => Object::Integer(page_count as i64),
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => Object::Reference(pages_id),
        });
        doc.trailer.set("Root", Object::Reference(catalog_id));

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    fn sample_sheet() -> SheetData {
        SheetData {
            name: "Credits".to_string(),
            columns: vec![
                "Period".to_string(),
                "001-000: HABER, MENSUAL".to_string(),
                "Total".to_string(),
            ],
            rows: vec![
                vec![
                    Cell::Text("01/2024".to_string()),
                    Cell::Amount(Decimal::new(10050, 2)),
                    Cell::Formula("=SUM(B2:B2)".to_string()),
                ],
                vec![
                    Cell::Text("02/2024".to_string()),
                    Cell::Empty,
                    Cell::Formula("=SUM(B3:B3)".to_string()),
                ],
            ],
        }
    }

    #[test]
    fn test_csv_keeps_formulas_and_empty_cells() {
        let bytes = sample_sheet().to_csv_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(
            text,
            "Period,\"001-000: HABER, MENSUAL\",Total\r\n\
             01/2024,100.50,=SUM(B2:B2)\r\n\
             02/2024,,=SUM(B3:B3)\r\n"
        );
    }

    #[test]
    fn test_run_store_persists_and_retrieves_sheets() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RunStore::new(dir.path());
        let run_id = RunId::new();

        store.write_sheet(run_id, &sample_sheet()).unwrap();
        let loaded = store.read_sheet(run_id, "Credits").unwrap().unwrap();
        assert_eq!(loaded, sample_sheet());

        assert!(store.read_sheet(run_id, "Debits").unwrap().is_none());
        assert!(store.read_sheet(RunId::new(), "Credits").unwrap().is_none());
    }

    #[test]
    fn test_merge_keeps_page_order_and_count() {
        let chunks = vec![blank_pdf(1), blank_pdf(2), blank_pdf(1)];
        let (bytes, parts, pages) = merge_pdfs(&chunks).unwrap();
        assert_eq!(parts, 3);
        assert_eq!(pages, 4);

        let merged = Document::load_mem(&bytes).unwrap();
        assert_eq!(merged.get_pages().len(), 4);
    }

    #[test]
    fn test_merge_skips_unreadable_chunks() {
        let chunks = vec![b"not a pdf".to_vec(), blank_pdf(2)];
        let (_, parts, pages) = merge_pdfs(&chunks).unwrap();
        assert_eq!(parts, 1);
        assert_eq!(pages, 2);

        assert!(merge_pdfs(&[b"junk".to_vec()]).is_err());
        assert!(merge_pdfs(&[]).is_err());
    }

    #[test]
    fn test_document_sink_writes_combined_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RunStore::new(dir.path());
        let run_id = RunId::new();

        let handle = store.combine(run_id, &[blank_pdf(1), blank_pdf(1)]).unwrap();
        assert_eq!(handle.path, store.document_path(run_id));
        assert_eq!(handle.pages, 2);
        assert!(store.read_document(run_id).unwrap().is_some());
    }

    #[test]
    fn test_cleanup_removes_only_expired_run_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RunStore::new(dir.path());
        let run_id = RunId::new();
        store.write_sheet(run_id, &sample_sheet()).unwrap();
        std::fs::create_dir_all(dir.path().join("not-a-run")).unwrap();

        assert_eq!(store.cleanup_older_than(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(store.cleanup_older_than(Duration::ZERO).unwrap(), 1);
        assert!(!store.run_dir(run_id).exists());
        assert!(dir.path().join("not-a-run").exists());
    }

    #[test]
    fn test_run_id_roundtrip() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("nope".parse::<RunId>().is_err());
    }
}
