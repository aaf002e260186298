//! Concurrency-bounded dispatch of page work items.
//!
//! The key concepts here are borrowed from ["Queues Don't Fix
//! Overload"](https://ferd.ca/queues-don-t-fix-overload.html): we limit the
//! number of work items that may be in flight at any one time, and once that
//! limit is reached, submitting more items blocks until one of the in-flight
//! items completes. A whole run's pages are submitted as one flat batch;
//! results come back in completion order and one result is produced for
//! every item, whatever happens to it.

use std::{sync::Arc, time::Duration};

use futures::{
    FutureExt as _, SinkExt as _, StreamExt as _,
    channel::{mpsc, oneshot},
    stream,
};
use serde::Serialize;

use crate::{
    async_utils::{BoxedFuture, JoinWorker},
    prelude::*,
    rasterize::PageImage,
};

/// One page awaiting inference: the unit of concurrent dispatch.
///
/// Consumed exactly once by the pool.
#[derive(Debug)]
pub struct WorkItem {
    /// Identity of the owning document.
    pub doc_name: String,
    /// 1-based page number within the document, dense in rasterization
    /// order.
    pub page_number: u32,
    /// The rendered page.
    pub image: PageImage,
}

/// The outcome of one work item. Failures are results too; they are never
/// dropped and never abort sibling pages.
#[derive(Debug)]
pub struct PageResult {
    /// Identity of the owning document.
    pub doc_name: String,
    /// 1-based page number within the document.
    pub page_number: u32,
    /// Extracted text, or the failure recorded as displayable text.
    pub text: PageText,
    /// Wall-clock time actually spent processing this page.
    pub elapsed: Duration,
    /// The Base64 payload that was sent to the backend.
    pub image_base64: String,
    /// The source page image.
    pub image: PageImage,
}

impl PageResult {
    /// Build the result for a work item the pool lost track of, e.g. because
    /// its reply channel was dropped. The source image was consumed by the
    /// pool, so the payload fields are empty.
    pub fn dispatch_failure(doc_name: String, page_number: u32, message: String) -> Self {
        Self {
            doc_name,
            page_number,
            text: PageText::Failed(PageFailure {
                kind: PageErrorKind::Dispatch,
                message: format!("Error: {message}"),
            }),
            elapsed: Duration::ZERO,
            image_base64: String::new(),
            image: PageImage::empty(),
        }
    }
}

/// Recognized text, or a failure recorded as text.
///
/// Downstream consumers always get something displayable, in page position;
/// the tag lets them distinguish the cases without parsing strings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PageText {
    /// Text extracted by the backend.
    Recognized(String),
    /// The page could not be recognized.
    Failed(PageFailure),
}

/// Details of a failed page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageFailure {
    /// Which stage of processing failed.
    pub kind: PageErrorKind,
    /// Human-readable error text, shown in the page's position.
    pub message: String,
}

/// What kind of failure a page suffered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageErrorKind {
    /// The backend answered with a non-success HTTP status.
    Backend,
    /// The request never completed: timeout, connection failure, or a
    /// malformed response body.
    Transport,
    /// The pool itself lost the work item.
    Dispatch,
}

impl PageText {
    /// The text to display for this page, whether or not recognition
    /// succeeded.
    pub fn display_text(&self) -> &str {
        match self {
            PageText::Recognized(text) => text,
            PageText::Failed(failure) => &failure.message,
        }
    }

    /// Did recognition succeed?
    pub fn is_recognized(&self) -> bool {
        matches!(self, PageText::Recognized(_))
    }
}

/// The async function a pool runs for each work item.
///
/// Note the return type: a failure is a [`PageResult`] too, so the function
/// itself is infallible.
pub type WorkFn = Arc<dyn Fn(WorkItem) -> BoxedFuture<PageResult> + Send + Sync + 'static>;

/// A work item travelling through the pool, paired with the one-shot
/// channel on which its result is returned.
struct PoolJob {
    item: WorkItem,
    tx: oneshot::Sender<PageResult>,
}

/// A bounded pool executing at most N work functions concurrently.
///
/// Up to `concurrency_limit` items may be queued and another
/// `concurrency_limit` may be in progress, so up to `2 * concurrency_limit`
/// items can be in the system at once; further submissions block.
pub struct PagePool {
    tx: mpsc::Sender<PoolJob>,
}

impl PagePool {
    /// Create a new pool with the given concurrency bound.
    ///
    /// The returned [`JoinWorker`] resolves once the pool has been dropped
    /// and all accepted items have completed.
    pub fn new(concurrency_limit: usize, work_fn: WorkFn) -> (Self, JoinWorker) {
        let (tx, rx) = mpsc::channel(concurrency_limit);
        let worker = tokio::spawn(async move {
            rx.for_each_concurrent(concurrency_limit, |job: PoolJob| async {
                let result = work_fn(job.item).await;
                if job.tx.send(result).is_err() {
                    debug!("work item result dropped because receiver went away");
                }
            })
            .await;
            Ok(())
        });
        (Self { tx }, JoinWorker::from_handle(worker))
    }

    /// Get a handle for submitting items to the pool.
    pub fn handle(&self) -> PagePoolHandle {
        PagePoolHandle {
            tx: self.tx.clone(),
        }
    }
}

/// A cheaply clonable handle for submitting work to a [`PagePool`].
#[derive(Clone)]
pub struct PagePoolHandle {
    tx: mpsc::Sender<PoolJob>,
}

impl PagePoolHandle {
    /// Submit one work item and wait for its result.
    ///
    /// This blocks while the pool is at capacity. An error here means the
    /// pool lost the item entirely, not that the page failed: page failures
    /// come back as ordinary results.
    pub async fn process(&self, item: WorkItem) -> Result<PageResult> {
        let mut tx = self.tx.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(PoolJob {
            item,
            tx: reply_tx,
        })
        .await
        .context("failed to submit work item to page pool")?;
        reply_rx
            .await
            .context("page pool dropped a work item result")
    }
}

/// Drive a whole flattened batch through the pool.
///
/// Produces exactly one [`PageResult`] per submitted item, in completion
/// order. After each completion, `on_progress` is called with the running
/// count and the batch total. An item the pool loses track of is converted
/// to a dispatch-failure result rather than aborting its siblings.
#[instrument(level = "debug", skip_all, fields(total = batch.len()))]
pub async fn process_batch(
    pool: &PagePool,
    batch: Vec<WorkItem>,
    mut on_progress: impl FnMut(usize, usize),
) -> Vec<PageResult> {
    let total = batch.len();
    let handle = pool.handle();
    let mut completions = stream::iter(batch)
        .map(move |item| {
            let handle = handle.clone();
            async move {
                let doc_name = item.doc_name.clone();
                let page_number = item.page_number;
                match handle.process(item).await {
                    Ok(result) => result,
                    Err(err) => {
                        warn!(
                            doc_name = %doc_name,
                            page_number,
                            "Page was lost by the pool: {:?}",
                            err
                        );
                        PageResult::dispatch_failure(
                            doc_name,
                            page_number,
                            format!("{err:#}"),
                        )
                    }
                }
            }
            .boxed()
        })
        .buffer_unordered(total.max(1));

    let mut results = Vec::with_capacity(total);
    while let Some(result) = completions.next().await {
        results.push(result);
        on_progress(results.len(), total);
    }
    results
}
