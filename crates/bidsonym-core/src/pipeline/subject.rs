//! The per-subject de-identification sequence.
//!
//! For one subject the pipeline first checks that every quarantine slot it
//! will need is free, inspects and redacts metadata, then walks the subject's
//! T1w images in index order. Each image goes through
//!
//! 1. brain extraction on the in-place original (mask written to quarantine),
//! 2. relocation of the original into the quarantine,
//! 3. defacing of the quarantined original into the canonical path,
//! 4. QC report rendering.
//!
//! When T2w defacing is enabled and the matching T2w image exists, the same
//! sequence runs for it with step 3 replaced by mask propagation from the
//! freshly defaced T1w image.

use super::state::{FileOutcome, FileStage, SubjectOutcome};
use crate::cancel::CancellationToken;
use crate::dataset::{BidsFile, DatasetIndex, Modality};
use crate::quarantine::{inspect_metadata, redact_metadata, Quarantine, RiskKeywords};
use crate::reports::QcReporter;
use crate::tools::{BrainExtractionMethod, DeidMethod, ToolAdapter};
use crate::{BidsonymError, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};

/// What to do to every subject.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    pub deid: DeidMethod,
    pub brain_extraction: BrainExtractionMethod,
    /// BET fractional intensity threshold, present iff `brain_extraction` is BET.
    pub bet_frac: Option<f64>,
    pub deface_t2w: bool,
    /// Sidecar fields to redact. Empty disables redaction.
    pub del_meta: Vec<String>,
    /// Keyword list for metadata inspection, `None` disables it.
    pub inspect: Option<RiskKeywords>,
}

/// Runs the de-identification sequence for one subject at a time.
pub struct SubjectPipeline {
    index: Arc<dyn DatasetIndex>,
    quarantine: Quarantine,
    tools: ToolAdapter,
    reporter: Arc<dyn QcReporter>,
    settings: PipelineSettings,
}

impl SubjectPipeline {
    pub fn new(
        index: Arc<dyn DatasetIndex>,
        tools: ToolAdapter,
        reporter: Arc<dyn QcReporter>,
        settings: PipelineSettings,
    ) -> Self {
        let quarantine = Quarantine::for_dataset(index.root());
        Self {
            index,
            quarantine,
            tools,
            reporter,
            settings,
        }
    }

    pub fn quarantine(&self) -> &Quarantine {
        &self.quarantine
    }

    /// Process `subject`.
    ///
    /// The outcome is returned even on failure and records how far each file
    /// got. The first error aborts the subject's remaining work.
    pub async fn run(&self, subject: &str, cancel: &CancellationToken) -> (SubjectOutcome, Result<()>) {
        let mut outcome = SubjectOutcome::new(subject);
        let span = info_span!("subject", subject = %subject);
        let result = self
            .process(subject, &mut outcome, cancel)
            .instrument(span)
            .await;
        if let Err(e) = &result {
            outcome.error = Some(e.to_string());
        }
        (outcome, result)
    }

    async fn process(
        &self,
        subject: &str,
        outcome: &mut SubjectOutcome,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!("Processing sub-{}", subject);
        cancel.check()?;

        let primaries = self.index.list_files(subject, Modality::T1w, None);
        if primaries.is_empty() {
            warn!("No T1w images found for sub-{}", subject);
        }
        // Every slot must be free before any sidecar is edited.
        for primary in &primaries {
            self.quarantine.ensure_vacant(&primary.entities)?;
            if self.settings.deface_t2w {
                if let Some(secondary) = self.index.find_counterpart(primary, Modality::T2w) {
                    self.quarantine.ensure_vacant(&secondary.entities)?;
                }
            }
        }

        if let Some(keywords) = &self.settings.inspect {
            let (index, quarantine) = (self.index.clone(), self.quarantine.clone());
            let (label, keywords) = (subject.to_string(), keywords.clone());
            let report = blocking("Metadata inspection", move || {
                inspect_metadata(index.as_ref(), &quarantine, &label, &keywords)
            })
            .await?;
            outcome.metadata_report = Some(report.path);
        }

        if !self.settings.del_meta.is_empty() {
            let (index, quarantine) = (self.index.clone(), self.quarantine.clone());
            let (label, fields) = (subject.to_string(), self.settings.del_meta.clone());
            outcome.edited_sidecars = blocking("Metadata redaction", move || {
                redact_metadata(index.as_ref(), &quarantine, &label, &fields)
            })
            .await?;
        }

        for primary in primaries {
            cancel.check()?;
            self.process_tracked(&primary, Modality::T1w, None, outcome, cancel)
                .await?;

            if !self.settings.deface_t2w {
                continue;
            }
            match self.index.find_counterpart(&primary, Modality::T2w) {
                Some(secondary) => {
                    self.process_tracked(
                        &secondary,
                        Modality::T2w,
                        Some(&primary.path),
                        outcome,
                        cancel,
                    )
                    .await?;
                }
                None => {
                    let expected = self
                        .index
                        .canonical_path(&primary.entities.with_suffix(Modality::T2w.suffix()));
                    warn!(
                        "No T2w image found for {}, skipping T2w defacing",
                        primary.relpath().display()
                    );
                    outcome.files.push(FileOutcome::skipped_no_secondary(expected));
                }
            }
        }

        info!(
            "Finished sub-{}: {} image(s) defaced",
            subject,
            outcome.defaced_count()
        );
        Ok(())
    }

    /// Process one image and append its outcome, error included.
    async fn process_tracked(
        &self,
        file: &BidsFile,
        modality: Modality,
        reference: Option<&Path>,
        outcome: &mut SubjectOutcome,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut file_outcome = FileOutcome::discovered(file.path.clone(), modality);
        let span = info_span!("file", path = %file.relpath().display());
        let result = self
            .process_file(file, reference, &mut file_outcome, cancel)
            .instrument(span)
            .await;
        if let Err(e) = &result {
            file_outcome.error = Some(e.to_string());
        }
        outcome.files.push(file_outcome);
        result
    }

    /// Take one image from `Discovered` to `Reported`.
    ///
    /// `reference` is the defaced primary image when `file` is a secondary.
    async fn process_file(
        &self,
        file: &BidsFile,
        reference: Option<&Path>,
        outcome: &mut FileOutcome,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let entities = &file.entities;

        // Refuse before running any tool if the original cannot be kept.
        self.quarantine.ensure_vacant(entities)?;

        let mask = self.quarantine.brainmask_path(entities);
        if let Some(parent) = mask.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BidsonymError::io("creating quarantine directory", parent, e))?;
        }
        self.tools
            .extract_brain(
                &file.path,
                self.settings.brain_extraction,
                self.settings.bet_frac,
                &mask,
                cancel,
            )
            .await?;
        outcome.mask = Some(mask.clone());
        outcome.advance(FileStage::ExtractedMask);
        cancel.check()?;

        let quarantine = self.quarantine.clone();
        let original = file.clone();
        let record = blocking("Relocation", move || quarantine.relocate(&original)).await?;
        outcome.quarantined = Some(record.clone());

        let defaced = match reference {
            None => {
                self.tools
                    .deface(&record.quarantined, self.settings.deid, &file.path, cancel)
                    .await
            }
            Some(reference) => {
                self.tools
                    .propagate_mask(reference, &record.quarantined, &file.path, cancel)
                    .await
            }
        };
        let defaced = match defaced {
            Ok(path) => path,
            Err(e) => {
                match self.quarantine.restore(&record) {
                    Ok(()) => outcome.quarantined = None,
                    Err(restore_err) => error!(
                        "Could not restore {} after failed defacing: {}",
                        file.path.display(),
                        restore_err
                    ),
                }
                return Err(e);
            }
        };
        outcome.defaced = Some(defaced.clone());
        outcome.advance(FileStage::Defaced);
        cancel.check()?;

        let images = self
            .reporter
            .report(
                &defaced,
                &mask,
                &self.quarantine.images_dir(entities),
                &entities.stem(),
            )
            .await?;
        outcome.overlay = Some(images.overlay);
        outcome.preview = Some(images.preview);
        outcome.advance(FileStage::Reported);
        Ok(())
    }
}

/// Run synchronous quarantine work (hashing, copying, TSV writing) on the
/// blocking pool so concurrent subjects keep progressing.
async fn blocking<T, F>(what: &str, work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| BidsonymError::Other(format!("{what} task failed: {e}")))?
}
