//! # Receipt Harvester
//!
//! A library for retrieving monthly benefit receipts from a web portal, one
//! period at a time, and consolidating them into multi-period spreadsheets and
//! a single combined PDF.
//!
//! ## Core Concepts
//!
//! - **Period**: One calendar month; a run walks every period from start to end inclusive
//! - **Navigator**: One authenticated portal session driven through query, extract, download and return
//! - **Extractor**: Turns a rendered period page into credit and debit line items
//! - **Aggregation Store**: Credits and Debits sheets whose columns grow as new line items appear
//! - **Summary**: A deterministic cross-period sheet with per-row totals and net, built once at the end
//! - **Artifacts**: Per-period PDFs captured from the download folder and merged in capture order
//!
//! ## Example
//!
//! ```rust,ignore
//! use receipt_harvester::*;
//! use std::sync::Arc;
//!
//! let config = RunConfig::from_json_file(std::path::Path::new("run.json"))?;
//! let portal = browser::ChromiumPortal::launch(&config).await?;
//! let tracker = ProgressTracker::new();
//!
//! let report = Harvester::new(config, portal)
//!     .with_observer(Arc::new(tracker.clone()))
//!     .with_cancellation(tracker.cancellation_token())
//!     .run()
//!     .await?;
//!
//! println!(
//!     "{} of {} periods retrieved, {} skipped",
//!     report.succeeded, report.periods_total, report.skipped
//! );
//! ```

pub mod activation;
pub mod aggregation;
pub mod artifacts;
pub mod error;
pub mod events;
pub mod extractor;
pub mod navigator;
pub mod run;
pub mod schema;
pub mod sink;
pub mod summary;
pub mod utils;
pub mod workbook;

#[cfg(feature = "browser")]
pub mod browser;

pub use activation::{ensure_active, machine_id, ActivationGate, ActivationStatus, StaticGate};
pub use aggregation::{AggregationSheet, AggregationStore, UpsertOutcome};
pub use artifacts::{ArtifactCollector, ArtifactHandle, CapturedArtifact};
pub use error::{FailureClass, HarvestError, Result};
pub use events::{
    ArtifactKind, CancellationToken, NoopObserver, ProgressSnapshot, ProgressTracker,
    RunObserver, TaskState,
};
pub use extractor::{Extraction, Extractor};
pub use navigator::{
    LoginOutcome, Navigator, PeriodFailure, PeriodOutcome, Portal, SessionState,
};
pub use run::{Harvester, RunContext, RunReport, RunStatus};
pub use schema::*;
pub use sink::{
    Cell, DocumentHandle, DocumentSink, RunId, RunStore, SheetData, SpreadsheetSink,
};
pub use summary::{CrossPeriodSummary, SummaryBuilder, SummaryRow};
pub use utils::*;
pub use workbook::{WorkbookStore, WORKBOOK_NAME};

#[cfg(feature = "http-gate")]
pub use activation::HttpActivationGate;
