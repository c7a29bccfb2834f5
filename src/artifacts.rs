//! Per-period document capture from the browser download folder.
//!
//! The portal saves each period's receipt as a PDF into a folder we watch.
//! A file is taken once it has a non-zero size that did not change between
//! two polls. Captured bytes are kept in memory, in capture order, and the
//! file is removed from the folder. At the end of the run everything that
//! was captured is handed to a [`DocumentSink`] in that same order.

use crate::error::{HarvestError, Result};
use crate::schema::{Period, Timeouts};
use crate::sink::{DocumentHandle, DocumentSink, RunId, COMBINED_DOCUMENT_NAME};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where a captured period document came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub period: Period,
    pub path: PathBuf,
    /// Position in capture order, starting at 0.
    pub index: usize,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct CapturedArtifact {
    pub handle: ArtifactHandle,
    pub bytes: Vec<u8>,
}

pub struct ArtifactCollector {
    download_dir: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
    seen: HashSet<PathBuf>,
    captured: Vec<CapturedArtifact>,
}

impl ArtifactCollector {
    /// Creates the download folder if needed. PDFs already in it are ignored.
    pub fn new(download_dir: impl Into<PathBuf>, timeouts: &Timeouts) -> Result<Self> {
        let download_dir = download_dir.into();
        std::fs::create_dir_all(&download_dir)?;

        let mut collector = Self {
            download_dir,
            timeout: timeouts.artifact(),
            poll_interval: timeouts.poll_interval(),
            seen: HashSet::new(),
            captured: Vec::new(),
        };
        collector.mark_existing()?;
        Ok(collector)
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn captured(&self) -> &[CapturedArtifact] {
        &self.captured
    }

    pub fn len(&self) -> usize {
        self.captured.len()
    }

    pub fn is_empty(&self) -> bool {
        self.captured.is_empty()
    }

    /// Snapshots the PDFs currently in the folder; only files that show up
    /// afterwards can be captured. A name freed by an earlier capture becomes
    /// available again.
    pub fn mark_existing(&mut self) -> Result<()> {
        self.seen.clear();
        for entry in std::fs::read_dir(&self.download_dir)? {
            let path = entry?.path();
            if is_candidate(&path) {
                self.seen.insert(path);
            }
        }
        Ok(())
    }

    /// Waits for a new PDF to settle and takes it.
    pub async fn capture(&mut self, period: Period) -> Result<ArtifactHandle> {
        let wait = tokio::time::timeout(self.timeout, self.wait_for_stable_file());
        let (path, size) = match wait.await {
            Ok(found) => found?,
            Err(_) => {
                return Err(HarvestError::ArtifactTimeout {
                    period,
                    reason: format!(
                        "no stable PDF in {} after {:?}",
                        self.download_dir.display(),
                        self.timeout
                    ),
                })
            }
        };

        let bytes = tokio::fs::read(&path).await?;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("Could not remove captured file {}: {}", path.display(), e);
            self.seen.insert(path.clone());
        }

        let handle = ArtifactHandle {
            period,
            path,
            index: self.captured.len(),
            size,
        };
        info!(
            "Captured document for period {} ({} bytes) from {}",
            period,
            size,
            handle.path.display()
        );
        self.captured.push(CapturedArtifact {
            handle: handle.clone(),
            bytes,
        });
        Ok(handle)
    }

    /// Polls until some unseen PDF keeps the same non-zero size across two
    /// polls. Every candidate is tracked, so an empty placeholder cannot hold
    /// up a finished file.
    async fn wait_for_stable_file(&self) -> Result<(PathBuf, u64)> {
        let mut previous: HashMap<PathBuf, u64> = HashMap::new();

        loop {
            let current = self.candidates().await?;

            if let Some((path, size)) = current
                .iter()
                .find(|(path, size)| *size > 0 && previous.get(path) == Some(size))
            {
                return Ok((path.clone(), *size));
            }
            if !current.is_empty() {
                debug!("Waiting on {} unsettled download(s)", current.len());
            }

            previous = current.into_iter().collect();
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Unseen PDFs in the folder with their sizes, by name.
    async fn candidates(&self) -> Result<Vec<(PathBuf, u64)>> {
        let mut entries = tokio::fs::read_dir(&self.download_dir).await?;
        let mut candidates = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_candidate(&path) || self.seen.contains(&path) {
                continue;
            }
            let size = entry.metadata().await?.len();
            candidates.push((path, size));
        }

        candidates.sort();
        Ok(candidates)
    }

    /// Combines every captured document in capture order. `None` when
    /// nothing was captured.
    pub fn merge(
        &self,
        sink: &mut dyn DocumentSink,
        run_id: RunId,
    ) -> Result<Option<DocumentHandle>> {
        if self.captured.is_empty() {
            info!("No documents captured, skipping merge");
            return Ok(None);
        }

        let chunks: Vec<Vec<u8>> = self.captured.iter().map(|c| c.bytes.clone()).collect();
        sink.combine(run_id, &chunks).map(Some)
    }
}

fn is_candidate(path: &Path) -> bool {
    let is_pdf = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));
    let is_combined = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n == COMBINED_DOCUMENT_NAME);
    is_pdf && !is_combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::tests::blank_pdf;
    use crate::sink::RunStore;

    fn fast_timeouts() -> Timeouts {
        Timeouts {
            artifact_ms: 300,
            poll_interval_ms: 10,
            ..Timeouts::default()
        }
    }

    fn period(month: u32) -> Period {
        Period::new(2024, month).unwrap()
    }

    #[tokio::test]
    async fn test_captures_new_pdf_and_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut collector = ArtifactCollector::new(dir.path(), &fast_timeouts()).unwrap();

        let file = dir.path().join("recibo_01.pdf");
        std::fs::write(&file, blank_pdf(1)).unwrap();

        let handle = collector.capture(period(1)).await.unwrap();
        assert_eq!(handle.path, file);
        assert_eq!(handle.index, 0);
        assert!(handle.size > 0);
        assert!(!file.exists());
        assert_eq!(collector.len(), 1);
    }

    #[tokio::test]
    async fn test_ignores_preexisting_and_combined_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("old.pdf"), blank_pdf(1)).unwrap();
        let mut collector = ArtifactCollector::new(dir.path(), &fast_timeouts()).unwrap();

        std::fs::write(dir.path().join(COMBINED_DOCUMENT_NAME), blank_pdf(1)).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

        let err = collector.capture(period(2)).await.unwrap_err();
        assert!(matches!(err, HarvestError::ArtifactTimeout { .. }));
        assert!(collector.is_empty());
    }

    #[tokio::test]
    async fn test_empty_file_never_stabilizes() {
        let dir = tempfile::tempdir().unwrap();
        let mut collector = ArtifactCollector::new(dir.path(), &fast_timeouts()).unwrap();
        std::fs::write(dir.path().join("partial.pdf"), b"").unwrap();

        assert!(collector.capture(period(3)).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_placeholder_does_not_block_finished_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut collector = ArtifactCollector::new(dir.path(), &fast_timeouts()).unwrap();

        let placeholder = dir.path().join("a_partial.pdf");
        std::fs::write(&placeholder, b"").unwrap();
        let finished = dir.path().join("b_recibo.pdf");
        std::fs::write(&finished, blank_pdf(1)).unwrap();

        let handle = collector.capture(period(4)).await.unwrap();
        assert_eq!(handle.path, finished);
        assert!(placeholder.exists());
    }

    #[tokio::test]
    async fn test_leftover_from_earlier_period_is_not_captured() {
        let dir = tempfile::tempdir().unwrap();
        let mut collector = ArtifactCollector::new(dir.path(), &fast_timeouts()).unwrap();

        let leftover = dir.path().join("a_leftover.pdf");
        std::fs::write(&leftover, b"").unwrap();
        assert!(collector.capture(period(5)).await.is_err());

        collector.mark_existing().unwrap();
        std::fs::write(&leftover, blank_pdf(1)).unwrap();
        let fresh = dir.path().join("recibo.pdf");
        std::fs::write(&fresh, blank_pdf(1)).unwrap();

        let handle = collector.capture(period(6)).await.unwrap();
        assert_eq!(handle.path, fresh);
    }

    #[tokio::test]
    async fn test_merge_keeps_capture_order() {
        let downloads = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let mut collector = ArtifactCollector::new(downloads.path(), &fast_timeouts()).unwrap();

        std::fs::write(downloads.path().join("b.pdf"), blank_pdf(2)).unwrap();
        collector.capture(period(1)).await.unwrap();
        std::fs::write(downloads.path().join("a.pdf"), blank_pdf(1)).unwrap();
        collector.capture(period(2)).await.unwrap();

        let periods: Vec<Period> = collector.captured().iter().map(|c| c.handle.period).collect();
        assert_eq!(periods, vec![period(1), period(2)]);

        let mut store = RunStore::new(output.path());
        let handle = collector.merge(&mut store, RunId::new()).unwrap().unwrap();
        assert_eq!(handle.parts, 2);
        assert_eq!(handle.pages, 3);
    }

    #[tokio::test]
    async fn test_merge_without_captures_is_none() {
        let downloads = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let collector = ArtifactCollector::new(downloads.path(), &fast_timeouts()).unwrap();
        let mut store = RunStore::new(output.path());
        assert!(collector.merge(&mut store, RunId::new()).unwrap().is_none());
    }
}
