//! One retrieval run from start to terminal report.
//!
//! Everything a run accumulates lives in a [`RunContext`] owned by that run,
//! so several runs can proceed side by side in one process. The loop is
//! strictly sequential: one period is queried, extracted, downloaded and
//! left before the next one starts.

use crate::activation::{ensure_active, machine_id, ActivationGate};
use crate::aggregation::AggregationStore;
use crate::artifacts::ArtifactCollector;
use crate::error::{FailureClass, HarvestError, Result};
use crate::events::{ArtifactKind, CancellationToken, NoopObserver, RunObserver};
use crate::navigator::{Navigator, PeriodFailure, PeriodOutcome, Portal};
use crate::schema::{Period, PeriodRecord, RunConfig};
use crate::sink::{DocumentHandle, DocumentSink, RunId, RunStore, SheetData, SpreadsheetSink};
use crate::summary::{CrossPeriodSummary, SummaryBuilder};
use crate::workbook::WorkbookStore;
use log::{error, info, warn};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    /// Every period in range was attempted.
    Completed,
    /// Stopped at a period boundary on request.
    Cancelled,
    /// Stopped by an authentication or navigation failure.
    Aborted,
}

/// Terminal outcome of a run. Always carries whatever was gathered before
/// the run stopped.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub periods_total: usize,
    pub attempted: usize,
    /// Periods that produced a record.
    pub succeeded: usize,
    /// Periods that produced no record.
    pub skipped: usize,
    /// Every recoverable per-period failure, in the order it happened.
    pub failures: Vec<PeriodFailure>,
    /// The failure that stopped the run, if any.
    pub fatal: Option<(FailureClass, String)>,
    pub records: Vec<PeriodRecord>,
    pub artifacts_captured: usize,
    pub combined_document: Option<DocumentHandle>,
    pub summary: Option<CrossPeriodSummary>,
    /// Final sheet writes or the document merge that failed.
    pub sink_errors: Vec<String>,
}

impl RunReport {
    pub fn records_retained(&self) -> usize {
        self.records.len()
    }

    pub fn failures_of(&self, class: FailureClass) -> impl Iterator<Item = &PeriodFailure> {
        self.failures.iter().filter(move |f| f.class == class)
    }
}

/// Mutable state of a single run.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: RunId,
    pub periods: Vec<Period>,
    pub records: Vec<PeriodRecord>,
    pub store: AggregationStore,
    pub failures: Vec<PeriodFailure>,
    pub attempted: usize,
    pub artifacts_captured: usize,
}

impl RunContext {
    pub fn new(run_id: RunId, periods: Vec<Period>) -> Self {
        Self {
            run_id,
            periods,
            records: Vec::new(),
            store: AggregationStore::new(),
            failures: Vec::new(),
            attempted: 0,
            artifacts_captured: 0,
        }
    }

    /// Folds one period's outcome into the run.
    pub fn absorb(&mut self, outcome: PeriodOutcome) -> Result<()> {
        self.attempted += 1;
        if outcome.artifact.is_some() {
            self.artifacts_captured += 1;
        }
        self.failures.extend(outcome.failures);
        if let Some(record) = outcome.record {
            self.store.upsert_record(&record)?;
            self.records.push(record);
        }
        Ok(())
    }

    fn into_report(
        self,
        status: RunStatus,
        fatal: Option<(FailureClass, String)>,
        combined_document: Option<DocumentHandle>,
        summary: Option<CrossPeriodSummary>,
        sink_errors: Vec<String>,
    ) -> RunReport {
        let succeeded = self.records.len();
        RunReport {
            run_id: self.run_id,
            status,
            periods_total: self.periods.len(),
            attempted: self.attempted,
            succeeded,
            skipped: self.attempted - succeeded,
            failures: self.failures,
            fatal,
            records: self.records,
            artifacts_captured: self.artifacts_captured,
            combined_document,
            summary,
            sink_errors,
        }
    }
}

/// Drives a [`Portal`] over the configured period range and writes the
/// results to the sinks.
pub struct Harvester<P: Portal> {
    config: RunConfig,
    portal: P,
    run_id: RunId,
    observer: Arc<dyn RunObserver>,
    cancel: CancellationToken,
    gate: Option<Arc<dyn ActivationGate>>,
    sheets: Box<dyn SpreadsheetSink + Send>,
    documents: Box<dyn DocumentSink + Send>,
}

impl<P: Portal> Harvester<P> {
    /// Sheets default to one [`WorkbookStore`] workbook per run and documents
    /// to a [`RunStore`], both under the configured output directory. Pass a
    /// [`RunStore`] to [`Harvester::with_spreadsheet_sink`] for CSV sheets.
    pub fn new(config: RunConfig, portal: P) -> Self {
        let sheets = WorkbookStore::new(&config.output_dir);
        let documents = RunStore::new(&config.output_dir);
        Self {
            config,
            portal,
            run_id: RunId::new(),
            observer: Arc::new(NoopObserver),
            cancel: CancellationToken::new(),
            gate: None,
            sheets: Box::new(sheets),
            documents: Box::new(documents),
        }
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_activation_gate(mut self, gate: Arc<dyn ActivationGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_spreadsheet_sink(mut self, sink: Box<dyn SpreadsheetSink + Send>) -> Self {
        self.sheets = sink;
        self
    }

    pub fn with_document_sink(mut self, sink: Box<dyn DocumentSink + Send>) -> Self {
        self.documents = sink;
        self
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Runs to a terminal state.
    ///
    /// `Err` means the run never started (bad configuration, activation
    /// refused). Authentication and navigation failures end the run early
    /// but still produce a report, and output that could not be written is
    /// listed in [`RunReport::sink_errors`].
    pub async fn run(self) -> Result<RunReport> {
        let Harvester {
            config,
            portal,
            run_id,
            observer,
            cancel,
            gate,
            mut sheets,
            mut documents,
        } = self;

        config.validate()?;
        if let Some(gate) = &gate {
            ensure_active(gate.as_ref(), &machine_id()).await?;
        }

        let periods = config.periods()?;
        info!(
            "Run {}: {} periods from {} to {}",
            run_id,
            periods.len(),
            config.start,
            config.end
        );

        let collector = ArtifactCollector::new(config.download_dir(), &config.timeouts)?;
        let mut navigator =
            Navigator::new(portal, &config, collector)?.with_observer(Arc::clone(&observer));
        let mut ctx = RunContext::new(run_id, periods.clone());
        let mut fatal: Option<(FailureClass, String)> = None;
        let mut status = RunStatus::Completed;

        match navigator.authenticate(&config.credentials).await {
            Ok(()) => {
                let total = periods.len();
                for (idx, period) in periods.into_iter().enumerate() {
                    if cancel.is_cancelled() {
                        info!("Cancellation observed before period {}", period);
                        status = RunStatus::Cancelled;
                        break;
                    }
                    observer.on_progress(idx + 1, total);

                    let outcome = match navigator.advance(period).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            ctx.attempted += 1;
                            report_fatal(&*observer, &e, &mut fatal);
                            status = RunStatus::Aborted;
                            break;
                        }
                    };

                    for failure in &outcome.failures {
                        observer.on_error(&failure.detail, failure.class);
                    }
                    if let Some(handle) = &outcome.artifact {
                        observer.on_artifact_ready(
                            ArtifactKind::PeriodDocument,
                            &handle.path.display().to_string(),
                        );
                    }

                    let has_record = outcome.record.is_some();
                    ctx.absorb(outcome)?;
                    if has_record {
                        write_incremental(sheets.as_mut(), &ctx);
                    }
                }
            }
            Err(e) => {
                report_fatal(&*observer, &e, &mut fatal);
                status = RunStatus::Aborted;
            }
        }

        navigator.finish();
        navigator.close().await;

        let (_, collector) = navigator.into_parts();
        let (combined, summary, sink_errors) =
            finalize(&mut ctx, sheets.as_mut(), documents.as_mut(), &collector, &*observer);

        let report = ctx.into_report(status, fatal, combined, summary, sink_errors);
        info!(
            "Run {} finished {:?}: {} attempted, {} succeeded, {} skipped, {} documents",
            report.run_id,
            report.status,
            report.attempted,
            report.succeeded,
            report.skipped,
            report.artifacts_captured
        );
        observer.on_completed(&report);
        Ok(report)
    }
}

fn report_fatal(
    observer: &dyn RunObserver,
    err: &HarvestError,
    fatal: &mut Option<(FailureClass, String)>,
) {
    let class = err.class().unwrap_or(FailureClass::NavigationFailure);
    error!("Run stopped ({}): {}", class, err);
    observer.on_error(&err.to_string(), class);
    *fatal = Some((class, err.to_string()));
}

/// Rewrites the category sheets after a new record. A failed write is only
/// logged; failures of the final write land in the report.
fn write_incremental(sheets: &mut (dyn SpreadsheetSink + Send), ctx: &RunContext) {
    for sheet in ctx.store.sheets() {
        if let Err(e) = sheets.write_sheet(ctx.run_id, &sheet) {
            warn!("Incremental write of sheet '{}' failed: {}", sheet.name, e);
        }
    }
}

/// Deferred work once the loop has stopped: total columns, the summary,
/// and the combined document. Sheet writes and the merge fail separately.
fn finalize(
    ctx: &mut RunContext,
    sheets: &mut (dyn SpreadsheetSink + Send),
    documents: &mut (dyn DocumentSink + Send),
    collector: &ArtifactCollector,
    observer: &dyn RunObserver,
) -> (Option<DocumentHandle>, Option<CrossPeriodSummary>, Vec<String>) {
    let mut sink_errors = Vec::new();
    ctx.store.finalize_totals();

    let mut written: Vec<SheetData> = ctx.store.sheets();
    let summary = SummaryBuilder::build(&ctx.records);
    if let Some(summary) = &summary {
        written.push(summary.to_sheet_data());
    }

    for sheet in &written {
        match sheets.write_sheet(ctx.run_id, sheet) {
            Ok(()) => observer.on_artifact_ready(ArtifactKind::Sheet, &sheet.name),
            Err(e) => {
                warn!("Final write of sheet '{}' failed: {}", sheet.name, e);
                sink_errors.push(format!("sheet '{}': {}", sheet.name, e));
            }
        }
    }

    let combined = match collector.merge(documents, ctx.run_id) {
        Ok(handle) => handle,
        Err(e) => {
            warn!("Combined document not produced: {}", e);
            sink_errors.push(format!("combined document: {}", e));
            None
        }
    };
    if let Some(handle) = &combined {
        observer.on_artifact_ready(
            ArtifactKind::CombinedDocument,
            &handle.path.display().to_string(),
        );
    }

    (combined, summary, sink_errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ItemDescriptor, LineItems};
    use rust_decimal::Decimal;

    fn record(month: u32, amount: i64) -> PeriodRecord {
        let credits: LineItems = [(ItemDescriptor::new("001", "000", "HABER"), Decimal::new(amount, 0))]
            .into_iter()
            .collect();
        PeriodRecord::new(Period::new(2024, month).unwrap(), credits, LineItems::new())
    }

    fn failure(month: u32, class: FailureClass) -> PeriodFailure {
        PeriodFailure {
            period: Period::new(2024, month).unwrap(),
            class,
            detail: "x".to_string(),
        }
    }

    #[test]
    fn test_context_counts() {
        let periods = vec![Period::new(2024, 1).unwrap(), Period::new(2024, 2).unwrap()];
        let mut ctx = RunContext::new(RunId::new(), periods);

        ctx.absorb(PeriodOutcome {
            record: Some(record(1, 10)),
            artifact: None,
            failures: vec![failure(1, FailureClass::ArtifactTimeout)],
        })
        .unwrap();
        ctx.absorb(PeriodOutcome {
            record: None,
            artifact: None,
            failures: vec![failure(2, FailureClass::ExtractionFailure)],
        })
        .unwrap();

        let report = ctx.into_report(RunStatus::Completed, None, None, None, Vec::new());
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.records_retained(), 1);
        assert_eq!(report.failures_of(FailureClass::ArtifactTimeout).count(), 1);
        assert_eq!(report.failures_of(FailureClass::ExtractionFailure).count(), 1);
    }

    #[test]
    fn test_context_upserts_into_store() {
        let mut ctx = RunContext::new(RunId::new(), vec![Period::new(2024, 1).unwrap()]);
        ctx.absorb(PeriodOutcome {
            record: Some(record(1, 10)),
            ..PeriodOutcome::default()
        })
        .unwrap();
        assert_eq!(ctx.store.sheets().len(), 1);
        assert_eq!(
            ctx.store
                .sheet(crate::schema::Category::Credits)
                .row_total(Period::new(2024, 1).unwrap()),
            Some(Decimal::new(10, 0))
        );
    }
}
