//! Grouping and ordering of completed page results.
//!
//! The pool hands back results in completion order, which under concurrent
//! dispatch bears no relation to page order. Ordering is restored here by an
//! explicit sort on page number, never assumed from arrival order.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::pool::{PageErrorKind, PageResult, PageText};

/// Facts about a document captured when its rasterization began.
#[derive(Debug)]
pub struct DocumentInfo {
    /// The document's identity.
    pub name: String,
    /// Size of the document's raw bytes.
    pub byte_size: usize,
    /// Number of pages submitted for this document.
    pub page_count: usize,
    /// When rasterization of this document started. Per-document elapsed
    /// time is measured from here.
    pub started: Instant,
}

/// One document's completed, ordered results.
#[derive(Debug)]
pub struct DocumentSummary {
    /// The document's identity.
    pub name: String,
    /// Size of the document's raw bytes.
    pub byte_size: usize,
    /// Number of pages submitted for this document.
    pub page_count: usize,
    /// Wall-clock time from rasterization start to aggregation.
    pub elapsed: Duration,
    /// Results in ascending page order, one per submitted page.
    pub pages: Vec<PageResult>,
}

/// Run-level statistics, folded from collected results only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Documents that produced results.
    pub document_count: usize,
    /// Pages across all documents that produced results.
    pub page_count: usize,
    /// Pages whose result records a failure rather than recognized text.
    pub failed_page_count: usize,
}

/// Group the unordered result stream by document and restore page order.
///
/// Documents appear in the order their infos were captured. A document that
/// failed rasterization has no info and therefore no summary; it is simply
/// absent, not a placeholder.
pub fn group_results(
    infos: Vec<DocumentInfo>,
    results: Vec<PageResult>,
) -> (Vec<DocumentSummary>, RunSummary) {
    let mut buckets: HashMap<String, Vec<PageResult>> = HashMap::new();
    for result in results {
        buckets.entry(result.doc_name.clone()).or_default().push(result);
    }

    let mut summary = RunSummary::default();
    let documents = infos
        .into_iter()
        .map(|info| {
            let mut pages = buckets.remove(&info.name).unwrap_or_default();
            pages.sort_unstable_by_key(|page| page.page_number);
            summary.document_count += 1;
            summary.page_count += pages.len();
            summary.failed_page_count +=
                pages.iter().filter(|p| !p.text.is_recognized()).count();
            DocumentSummary {
                name: info.name,
                byte_size: info.byte_size,
                page_count: info.page_count,
                elapsed: info.started.elapsed(),
                pages,
            }
        })
        .collect();
    (documents, summary)
}

/// Overall outcome of one document, in the export record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Every page was recognized.
    Ok,
    /// Some pages were recognized, some failed.
    Incomplete,
    /// The document never reached the pool.
    Failed,
}

/// One document's export record, written as a JSON line.
#[derive(Debug, Serialize)]
pub struct DocumentRecord {
    /// The document's identity.
    pub name: String,
    /// Overall outcome for this document.
    pub status: DocumentStatus,
    /// Rasterization failure text, for documents that never reached the
    /// pool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Size of the document's raw bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub byte_size: Option<usize>,
    /// Number of pages submitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<usize>,
    /// Seconds from rasterization start to aggregation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<f64>,
    /// Per-page results, ascending by page number.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pages: Vec<PageRecord>,
}

/// One page's export record.
#[derive(Debug, Serialize)]
pub struct PageRecord {
    /// 1-based page number.
    pub page: u32,
    /// Recognized text, or the failure rendered as text.
    pub text: String,
    /// Present when `text` is an error rather than recognized content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PageErrorKind>,
    /// Seconds spent processing this page.
    pub elapsed_seconds: f64,
    /// Length of the Base64 payload sent to the backend.
    pub image_base64_length: usize,
}

impl DocumentRecord {
    /// Build the record for a document that completed dispatch.
    pub fn from_summary(summary: &DocumentSummary) -> Self {
        let failed = summary
            .pages
            .iter()
            .filter(|p| !p.text.is_recognized())
            .count();
        let status = if failed == 0 {
            DocumentStatus::Ok
        } else {
            DocumentStatus::Incomplete
        };
        Self {
            name: summary.name.clone(),
            status,
            error: None,
            byte_size: Some(summary.byte_size),
            page_count: Some(summary.page_count),
            elapsed_seconds: Some(summary.elapsed.as_secs_f64()),
            pages: summary.pages.iter().map(PageRecord::from_result).collect(),
        }
    }

    /// Build the record for a document that failed rasterization.
    pub fn from_failure(name: &str, message: &str) -> Self {
        Self {
            name: name.to_owned(),
            status: DocumentStatus::Failed,
            error: Some(message.to_owned()),
            byte_size: None,
            page_count: None,
            elapsed_seconds: None,
            pages: vec![],
        }
    }
}

impl PageRecord {
    fn from_result(result: &PageResult) -> Self {
        let error = match &result.text {
            PageText::Recognized(_) => None,
            PageText::Failed(failure) => Some(failure.kind),
        };
        Self {
            page: result.page_number,
            text: result.text.display_text().to_owned(),
            error,
            elapsed_seconds: result.elapsed.as_secs_f64(),
            image_base64_length: result.image_base64.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        pool::{PageFailure, PageText},
        rasterize::PageImage,
    };

    fn result(doc_name: &str, page_number: u32, text: PageText) -> PageResult {
        PageResult {
            doc_name: doc_name.to_owned(),
            page_number,
            text,
            elapsed: Duration::from_millis(10),
            image_base64: "QUJD".to_owned(),
            image: PageImage::empty(),
        }
    }

    fn info(name: &str, page_count: usize) -> DocumentInfo {
        DocumentInfo {
            name: name.to_owned(),
            byte_size: 1234,
            page_count,
            started: Instant::now(),
        }
    }

    #[test]
    fn restores_page_order_within_each_document() {
        // Completion order scrambled across two documents.
        let results = vec![
            result("b.pdf", 2, PageText::Recognized("b2".to_owned())),
            result("a.pdf", 3, PageText::Recognized("a3".to_owned())),
            result("a.pdf", 1, PageText::Recognized("a1".to_owned())),
            result("b.pdf", 1, PageText::Recognized("b1".to_owned())),
            result("a.pdf", 2, PageText::Recognized("a2".to_owned())),
        ];
        let (documents, summary) =
            group_results(vec![info("a.pdf", 3), info("b.pdf", 2)], results);

        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0].name, "a.pdf");
        let a_pages = documents[0]
            .pages
            .iter()
            .map(|p| p.page_number)
            .collect::<Vec<_>>();
        assert_eq!(a_pages, vec![1, 2, 3]);
        let b_pages = documents[1]
            .pages
            .iter()
            .map(|p| p.page_number)
            .collect::<Vec<_>>();
        assert_eq!(b_pages, vec![1, 2]);
        assert_eq!(
            summary,
            RunSummary {
                document_count: 2,
                page_count: 5,
                failed_page_count: 0,
            }
        );
    }

    #[test]
    fn failed_pages_are_kept_in_position_and_counted() {
        let failure = PageText::Failed(PageFailure {
            kind: PageErrorKind::Backend,
            message: "Error: 500 - boom".to_owned(),
        });
        let results = vec![
            result("a.pdf", 3, PageText::Recognized("a3".to_owned())),
            result("a.pdf", 2, failure),
            result("a.pdf", 1, PageText::Recognized("a1".to_owned())),
        ];
        let (documents, summary) = group_results(vec![info("a.pdf", 3)], results);

        let pages = &documents[0].pages;
        assert_eq!(pages[1].page_number, 2);
        assert!(!pages[1].text.is_recognized());
        assert_eq!(summary.failed_page_count, 1);

        let record = DocumentRecord::from_summary(&documents[0]);
        assert_eq!(record.status, DocumentStatus::Incomplete);
        assert_eq!(record.pages[1].error, Some(PageErrorKind::Backend));
        assert!(record.pages[1].text.contains("Error: 500"));
    }

    #[test]
    fn absent_documents_have_no_summary() {
        let results = vec![result("a.pdf", 1, PageText::Recognized("a1".to_owned()))];
        let (documents, summary) = group_results(vec![info("a.pdf", 1)], results);
        assert_eq!(documents.len(), 1);
        assert_eq!(summary.document_count, 1);
    }

    #[test]
    fn all_ok_document_exports_as_ok() {
        let results = vec![result("a.pdf", 1, PageText::Recognized("a1".to_owned()))];
        let (documents, _) = group_results(vec![info("a.pdf", 1)], results);
        let record = DocumentRecord::from_summary(&documents[0]);
        assert_eq!(record.status, DocumentStatus::Ok);
        assert_eq!(record.pages[0].image_base64_length, 4);
        assert!(record.error.is_none());
    }

    #[test]
    fn rasterization_failure_exports_as_failed() {
        let record = DocumentRecord::from_failure("bad.pdf", "could not parse");
        assert_eq!(record.status, DocumentStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("could not parse"));
        assert!(record.pages.is_empty());
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(r#""status":"failed""#));
        assert!(!json.contains("pages"));
    }
}
