// src/tracker.rs

//! Which bytes of the destination file are already on disk.
//!
//! Progress is a sorted list of disjoint, non-adjacent intervals rather than
//! a bitmap, so a download that went through in one pass is described by a
//! single interval no matter how large the file is.

use crate::models::{Range, Span};
use crate::state_manager::{remove_sidecar, SidecarRecord, StateError, StateManager};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const SIDECAR_SUFFIX: &str = ".metadata";
const FALLBACK_FILENAME: &str = "download";

/// A merged set of covered byte ranges.
///
/// Invariant: entries are sorted, non-empty, and no two of them touch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoveredSet {
    ranges: Vec<Range>,
}

impl CoveredSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ranges<I: IntoIterator<Item = Range>>(ranges: I) -> Self {
        let mut set = Self::new();
        for range in ranges {
            set.insert(range);
        }
        set
    }

    /// Marks `range` covered, coalescing it with every range it touches.
    /// Returns `false` if the set did not change.
    pub fn insert(&mut self, range: Range) -> bool {
        if self.contains(&range) {
            return false;
        }

        // Ends are sorted as well as starts, so both searches are valid.
        let first = self.ranges.partition_point(|r| r.end < range.start);
        let last = first + self.ranges[first..].partition_point(|r| r.start <= range.end);

        let merged = if first == last {
            range
        } else {
            Range {
                start: self.ranges[first].start.min(range.start),
                end: self.ranges[last - 1].end.max(range.end),
            }
        };
        self.ranges.splice(first..last, [merged]);
        true
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    /// Number of stored intervals.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn covered_bytes(&self) -> u64 {
        self.ranges.iter().map(Range::len).sum()
    }

    /// One past the highest covered offset.
    pub fn max_end(&self) -> u64 {
        self.ranges.last().map_or(0, |r| r.end)
    }

    pub fn contains(&self, range: &Range) -> bool {
        if range.is_empty() {
            return true;
        }
        let idx = self.ranges.partition_point(|r| r.end < range.end);
        self.ranges
            .get(idx)
            .is_some_and(|r| r.start <= range.start && range.end <= r.end)
    }

    /// The uncovered parts of `[0, total)`, in order.
    pub fn gaps(&self, total: u64) -> Vec<Range> {
        let mut gaps = Vec::new();
        let mut cursor = 0;
        for r in &self.ranges {
            if cursor >= total {
                break;
            }
            if r.start > cursor {
                gaps.push(Range { start: cursor, end: r.start.min(total) });
            }
            cursor = cursor.max(r.end);
        }
        if cursor < total {
            gaps.push(Range { start: cursor, end: total });
        }
        gaps
    }

    /// True iff the set is exactly `[0, total)`.
    pub fn is_complete(&self, total: u64) -> bool {
        match self.ranges.as_slice() {
            [] => total == 0,
            [only] => only.start == 0 && only.end == total,
            _ => false,
        }
    }
}

/// Derives the local file name from the last path segment of `url`.
pub fn derive_filename(url: &str) -> String {
    let name = match reqwest::Url::parse(url) {
        Ok(parsed) => parsed
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(str::to_string))
            .unwrap_or_default(),
        Err(_) => {
            let trimmed = url.split(|c: char| c == '?' || c == '#').next().unwrap_or_default();
            trimmed.rsplit('/').find(|s| !s.is_empty()).unwrap_or_default().to_string()
        }
    };

    if name.is_empty() || name == "." || name == ".." {
        FALLBACK_FILENAME.to_string()
    } else {
        name
    }
}

pub fn sidecar_name(filename: &str) -> String {
    format!("{filename}{SIDECAR_SUFFIX}")
}

/// Durable record of which byte ranges of one download are on disk.
///
/// Every mutation is persisted before the call returns.
pub struct RangeTracker {
    url: String,
    filename: String,
    destination: PathBuf,
    total_size: Option<u64>,
    covered: CoveredSet,
    store: StateManager,
}

impl std::fmt::Debug for RangeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeTracker")
            .field("url", &self.url)
            .field("destination", &self.destination)
            .field("total_size", &self.total_size)
            .field("covered", &self.covered)
            .finish()
    }
}

impl RangeTracker {
    /// Opens the tracker for `url`, placing the file and its sidecar in `dir`.
    ///
    /// A readable sidecar is resumed from. An unreadable one, or one whose
    /// bytes are no longer backed by the destination file, is discarded and
    /// the download starts over.
    pub async fn open(url: &str, dir: &Path) -> Result<Self, StateError> {
        let filename = derive_filename(url);
        let destination = dir.join(&filename);
        let sidecar = dir.join(sidecar_name(&filename));

        let (store, record) = match Self::load_existing(&sidecar, url).await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("Tracker: discarding unreadable sidecar {}: {}", sidecar.display(), e);
                remove_sidecar(&sidecar).await?;
                (StateManager::open(&sidecar).await?, None)
            }
        };

        let mut tracker = Self {
            url: url.to_string(),
            filename,
            destination,
            total_size: None,
            covered: CoveredSet::new(),
            store,
        };

        if let Some(record) = record {
            tracker.total_size = record.total_size;
            tracker.covered = CoveredSet::from_ranges(record.ranges);

            let on_disk = match tokio::fs::metadata(&tracker.destination).await {
                Ok(meta) => meta.len(),
                Err(_) => 0,
            };
            if on_disk < tracker.covered.max_end() {
                warn!(
                    "Tracker: {} holds {} bytes but progress claims {}; starting over.",
                    tracker.destination.display(),
                    on_disk,
                    tracker.covered.max_end()
                );
                tracker.covered = CoveredSet::new();
            } else {
                info!(
                    "Tracker: resuming {} with {} bytes in {} range(s).",
                    tracker.filename,
                    tracker.covered.covered_bytes(),
                    tracker.covered.len()
                );
            }
        }

        tracker.persist().await?;
        Ok(tracker)
    }

    async fn load_existing(
        sidecar: &Path,
        url: &str,
    ) -> Result<(StateManager, Option<SidecarRecord>), StateError> {
        let store = StateManager::open(sidecar).await?;
        let record = store.load().await?;
        if let Some(record) = &record {
            record.validate(url)?;
        }
        Ok((store, record))
    }

    fn record(&self) -> SidecarRecord {
        SidecarRecord {
            url: self.url.clone(),
            filename: self.filename.clone(),
            total_size: self.total_size,
            ranges: self.covered.ranges().to_vec(),
        }
    }

    async fn persist(&self) -> Result<(), StateError> {
        self.store.save(&self.record()).await
    }

    /// The first uncovered stretch, or `None` when nothing is missing.
    pub fn missing_range(&self) -> Option<Span> {
        match self.total_size {
            Some(total) => self.covered.gaps(total).first().copied().map(Span::bounded),
            None => Some(match self.covered.ranges().first() {
                Some(first) if first.start > 0 => Span::bounded(Range { start: 0, end: first.start }),
                Some(first) => Span::open(first.end),
                None => Span::open(0),
            }),
        }
    }

    /// Every uncovered stretch, in file order. With an unknown size the last
    /// entry is open-ended.
    pub fn missing_ranges(&self) -> Vec<Span> {
        match self.total_size {
            Some(total) => self.covered.gaps(total).into_iter().map(Span::bounded).collect(),
            None => {
                let tail = self.covered.max_end();
                let mut spans: Vec<Span> =
                    self.covered.gaps(tail).into_iter().map(Span::bounded).collect();
                spans.push(Span::open(tail));
                spans
            }
        }
    }

    /// Marks `range` as written and persists the new state.
    pub async fn add_range(&mut self, range: Range) -> Result<(), StateError> {
        if self.covered.insert(range) {
            self.persist().await?;
        }
        Ok(())
    }

    /// Marks several ranges as written with a single persist.
    pub async fn add_ranges<I>(&mut self, ranges: I) -> Result<(), StateError>
    where
        I: IntoIterator<Item = Range>,
    {
        let mut changed = false;
        for range in ranges {
            changed |= self.covered.insert(range);
        }
        if changed {
            self.persist().await?;
        }
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        self.total_size.is_some_and(|total| self.covered.is_complete(total))
    }

    /// Records the size reported by the server.
    ///
    /// Stored progress is dropped if it cannot belong to a file of that size.
    /// An unknown size keeps whatever was stored before.
    pub async fn set_total_size(&mut self, size: Option<u64>) -> Result<(), StateError> {
        let Some(size) = size else {
            return Ok(());
        };
        if self.total_size == Some(size) {
            return Ok(());
        }

        let conflicting = self.total_size.is_some() || self.covered.max_end() > size;
        if conflicting && !self.covered.is_empty() {
            warn!(
                "Tracker: {} changed size ({:?} -> {}); discarding progress.",
                self.filename, self.total_size, size
            );
            self.covered = CoveredSet::new();
        }
        self.total_size = Some(size);
        self.persist().await
    }

    /// Fixes the total size of an unknown-size download once the stream
    /// ended at `end`.
    pub async fn resolve_total_size(&mut self, end: u64) -> Result<(), StateError> {
        if self.total_size.is_none() {
            debug!("Tracker: {} resolved to {} bytes.", self.filename, end);
            self.total_size = Some(end);
            self.persist().await?;
        }
        Ok(())
    }

    /// Removes the sidecar. Only call once the download is complete or
    /// deliberately abandoned.
    pub async fn delete(self) -> Result<(), StateError> {
        self.store.delete().await
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn sidecar_path(&self) -> &Path {
        self.store.path()
    }

    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    pub fn covered(&self) -> &CoveredSet {
        &self.covered
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.covered.covered_bytes()
    }
}
