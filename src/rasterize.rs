//! Turning a document's raw bytes into an ordered sequence of page images.

use std::sync::LazyLock;

use anyhow::{anyhow, bail, ensure};
use clap::Args;
use regex::Regex;
use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure, cpu_limit::with_cpu_semaphore, prelude::*,
};

/// One uploaded document, captured at run start and immutable afterwards.
///
/// The name is the document's identity for the duration of a run, so names
/// must be unique within a run.
#[derive(Clone, Debug)]
pub struct Document {
    /// The document's name, typically its file name.
    pub name: String,
    /// The raw byte content of the document.
    pub data: Vec<u8>,
}

/// One rendered page of a document.
#[derive(Debug)]
pub struct PageImage {
    /// The MIME type of the rendered data. Always `image/png` for pages
    /// produced by [`rasterize_document`].
    pub mime_type: String,
    /// The rendered image data.
    pub data: Vec<u8>,
}

impl PageImage {
    /// An empty placeholder image, for results whose source image was
    /// consumed before a failure could be reported.
    pub fn empty() -> Self {
        Self {
            mime_type: "image/png".to_owned(),
            data: vec![],
        }
    }
}

/// Options controlling rasterization.
#[derive(Args, Clone, Debug)]
pub struct RasterizeOptions {
    /// The rendering resolution, in DPI.
    #[clap(long = "dpi", default_value = "150")]
    pub dpi: u32,
}

/// Matches error lines in `pdftocairo` output.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Poppler reconstructs documents with damaged xref tables and still renders
/// them correctly, so this particular "error" is only a warning.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line contain an error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// Rasterize a document into an ordered sequence of page images.
///
/// The position of each image in the returned sequence matches the
/// document's own page order. Failures carry the document name; they are
/// reported against the whole document and the caller is expected to keep
/// processing its other documents.
#[instrument(level = "debug", skip_all, fields(name = %doc.name, dpi = options.dpi))]
pub async fn rasterize_document(
    doc: &Document,
    options: &RasterizeOptions,
) -> Result<Vec<PageImage>> {
    // Make sure we actually have a PDF before shelling out.
    let kind = infer::get(&doc.data)
        .ok_or_else(|| anyhow!("{}: could not determine file type", doc.name))?;
    if kind.mime_type() != "application/pdf" {
        bail!(
            "{}: unsupported input type {} (expected application/pdf)",
            doc.name,
            kind.mime_type()
        );
    }

    // Write the document into a temporary directory, which will also receive
    // the rendered pages.
    let tmpdir = tempfile::TempDir::with_prefix("pages")
        .context("failed to create temporary directory")?;
    let pdf_path = tmpdir.path().join("input.pdf");
    tokio::fs::write(&pdf_path, &doc.data)
        .await
        .with_context(|| format!("{}: failed to write temporary PDF", doc.name))?;

    // Run pdftocairo to render each page as a PNG file. We hold a CPU permit
    // because pdftocairo will use at least 100% of a core.
    let out_prefix = tmpdir.path().join("page");
    let output = with_cpu_semaphore(|| async {
        let mut cmd = Command::new("pdftocairo");
        cmd.arg("-png")
            .arg("-r")
            .arg(options.dpi.to_string())
            .arg(&pdf_path)
            .arg(&out_prefix);
        cmd.output()
            .await
            .with_context(|| format!("{}: failed to run pdftocairo", doc.name))
    })
    .await?;
    check_for_command_failure("pdftocairo", &output, Some(&is_error_line))?;

    // Collect the rendered pages. pdftocairo zero-pads page numbers to a
    // fixed width, so lexical order is page order.
    let mut page_paths = std::fs::read_dir(tmpdir.path())
        .with_context(|| format!("{}: failed to read page directory", doc.name))?
        .map(|entry| Ok(entry.context("failed to read directory entry")?.path()))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .filter(|path| path.extension().is_some_and(|ext| ext == "png"))
        .collect::<Vec<_>>();
    page_paths.sort();
    ensure!(
        !page_paths.is_empty(),
        "{}: pdftocairo produced no pages",
        doc.name
    );

    let mut pages = Vec::with_capacity(page_paths.len());
    for path in &page_paths {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read rendered page {:?}", path.display()))?;
        pages.push(PageImage {
            mime_type: "image/png".to_owned(),
            data,
        });
    }
    debug!(name = %doc.name, page_count = pages.len(), "Rasterized document");
    Ok(pages)
}
