//! Orchestration of one full processing run.
//!
//! A run takes the current set of documents from rasterization through
//! aggregation. State lives in an explicit [`RunState`] owned by the caller;
//! re-invoking the coordinator with an unchanged input set is a no-op.

use std::{collections::BTreeSet, sync::Arc, time::Instant};

use futures::FutureExt as _;

use crate::{
    aggregate::{DocumentInfo, DocumentSummary, RunSummary, group_results},
    capacity::CapacityEstimator,
    client::InferenceClient,
    pool::{PagePool, WorkFn, WorkItem, process_batch},
    prelude::*,
    rasterize::{Document, RasterizeOptions, rasterize_document},
    ui::{ProgressConfig, Ui},
};

/// A per-document failure notice: the document could not be decomposed into
/// pages, so it never reached the pool. Other documents are unaffected.
#[derive(Clone, Debug)]
pub struct RasterizationFailure {
    /// The document's identity.
    pub name: String,
    /// Human-readable failure text.
    pub message: String,
}

/// Everything a completed run produced.
#[derive(Debug)]
pub struct RunOutcome {
    /// Per-document ordered results, in input order.
    pub documents: Vec<DocumentSummary>,
    /// Documents that failed rasterization.
    pub failures: Vec<RasterizationFailure>,
    /// Run-level statistics.
    pub summary: RunSummary,
}

/// All state for one processing run.
///
/// The document set and the concurrency bound are fixed before dispatch and
/// never change mid-run; the outcome is written once, at the end.
#[derive(Default)]
pub struct RunState {
    /// The documents captured for the current run.
    documents: Vec<Document>,
    /// Identity set captured from the previous input, for change detection.
    previous_names: BTreeSet<String>,
    /// Set once the current input has been fully processed.
    processed: bool,
    /// The completed run's results.
    outcome: Option<RunOutcome>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a new input set.
    ///
    /// If the previous run completed and the incoming identity set matches
    /// it, the offer is rejected (returns `false`) and existing results are
    /// kept. Otherwise all per-run state is reset and the new documents are
    /// captured.
    pub fn set_input(&mut self, documents: Vec<Document>) -> bool {
        let names = documents
            .iter()
            .map(|doc| doc.name.clone())
            .collect::<BTreeSet<_>>();
        if self.processed && names == self.previous_names {
            debug!("input set unchanged; keeping existing results");
            return false;
        }
        self.documents = documents;
        self.previous_names = names;
        self.processed = false;
        self.outcome = None;
        true
    }

    /// The completed run's results, if any.
    pub fn outcome(&self) -> Option<&RunOutcome> {
        self.outcome.as_ref()
    }

    /// Has the current input set been fully processed?
    pub fn is_processed(&self) -> bool {
        self.processed
    }
}

/// Process the current input set end to end.
///
/// Each document is rasterized independently; a document that cannot be
/// rasterized becomes a [`RasterizationFailure`] notice while the others
/// proceed. All pages are then flattened into one batch and dispatched
/// through a pool bounded by the estimator's output. Idempotent: if the
/// current input set was already processed, this returns immediately.
#[instrument(level = "debug", skip_all)]
pub async fn process_run(
    state: &mut RunState,
    ui: &Ui,
    raster_opts: &RasterizeOptions,
    client: Arc<InferenceClient>,
    estimator: &dyn CapacityEstimator,
) -> Result<()> {
    if state.processed {
        debug!("run already processed; nothing to do");
        return Ok(());
    }

    // Rasterize every document, isolating per-document failures.
    let raster_pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "Rasterizing documents",
            done_msg: "Rasterized documents",
        },
        state.documents.len() as u64,
    );
    let mut infos = Vec::new();
    let mut failures = Vec::new();
    let mut batch = Vec::new();
    for doc in &state.documents {
        let started = Instant::now();
        match rasterize_document(doc, raster_opts).await {
            Ok(pages) => {
                infos.push(DocumentInfo {
                    name: doc.name.clone(),
                    byte_size: doc.data.len(),
                    page_count: pages.len(),
                    started,
                });
                for (idx, image) in pages.into_iter().enumerate() {
                    batch.push(WorkItem {
                        doc_name: doc.name.clone(),
                        page_number: idx as u32 + 1,
                        image,
                    });
                }
            }
            Err(err) => {
                warn!(name = %doc.name, "Failed to rasterize document: {:?}", err);
                failures.push(RasterizationFailure {
                    name: doc.name.clone(),
                    message: format!("{err:#}"),
                });
            }
        }
        raster_pb.inc(1);
    }
    raster_pb.finish_using_style();

    // The concurrency bound is computed once, before dispatch, and holds
    // for the whole run.
    let concurrency = estimator.concurrency_bound().await;
    info!(
        concurrency,
        total_pages = batch.len(),
        "Dispatching page batch"
    );

    let work_fn: WorkFn = {
        let client = client.clone();
        Arc::new(move |item| {
            let client = client.clone();
            async move { client.recognize_page(item).await }.boxed()
        })
    };
    let (pool, worker) = PagePool::new(concurrency, work_fn);

    let pages_pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "🔍",
            msg: "Recognizing pages",
            done_msg: "Recognized pages",
        },
        batch.len() as u64,
    );
    let results = process_batch(&pool, batch, |done, _total| {
        pages_pb.set_position(done as u64);
    })
    .await;
    drop(pool);
    worker.join().await?;
    pages_pb.finish_using_style();

    let (documents, summary) = group_results(infos, results);
    state.outcome = Some(RunOutcome {
        documents,
        failures,
        summary,
    });
    state.processed = true;
    Ok(())
}
