use std::{collections::BTreeSet, str::FromStr, sync::Arc};

use clap::Parser;
use tokio::io::AsyncWriteExt as _;
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{
    aggregate::DocumentRecord,
    capacity::{CapacityEstimator, FixedCapacity, GpuMemoryCapacity},
    client::{ClientOpts, InferenceClient},
    prelude::*,
    rasterize::{Document, RasterizeOptions},
    run::{RunOutcome, RunState, process_run},
    ui::Ui,
};

mod aggregate;
mod async_utils;
mod capacity;
mod client;
mod cpu_limit;
mod data_url;
mod pool;
mod prelude;
mod rasterize;
mod run;
#[cfg(test)]
mod testing;
mod ui;

/// OCR scanned PDFs using a vision-language model server.
///
/// Each page of each input file is rendered to an image and sent to the
/// inference server; results are written as one JSON record per document,
/// with pages in order.
#[derive(Debug, Parser)]
#[clap(
    version,
    after_help = r#"
Environment Variables:
  - OPENAI_API_BASE (optional): Override the inference server URL.
  - OPENAI_API_KEY (optional): Bearer token for the inference server.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    /// PDF files to process. File names are the documents' identities and
    /// must be unique.
    #[clap(required = true)]
    files: Vec<PathBuf>,

    #[clap(flatten)]
    raster: RasterizeOptions,

    #[clap(flatten)]
    client: ClientOpts,

    /// Fixed number of concurrent inference requests, skipping the
    /// accelerator-memory probe. Clamped to 1-4.
    #[clap(short = 'j', long = "jobs")]
    jobs: Option<usize>,

    /// Write JSON Lines output here instead of standard output.
    #[clap(short = 'o', long = "output")]
    output_path: Option<PathBuf>,
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the progress bars if we're using stdout for output.
    if opts.output_path.is_none() {
        ui.hide_progress_bars();
    }

    // Ingest the input files. Names are the identity keys for this run, so
    // duplicates are a hard error.
    let documents = read_documents(&opts.files).await?;

    let client = Arc::new(InferenceClient::new(&opts.client)?);
    let estimator: Box<dyn CapacityEstimator> = match opts.jobs {
        Some(jobs) => Box::new(FixedCapacity(jobs)),
        None => Box::new(GpuMemoryCapacity::default()),
    };

    let mut state = RunState::new();
    state.set_input(documents);
    process_run(
        &mut state,
        &ui,
        &opts.raster,
        client,
        estimator.as_ref(),
    )
    .await?;

    let outcome = state
        .outcome()
        .context("run completed without an outcome")?;
    write_records(opts.output_path.as_deref(), outcome).await?;
    display_summary(&ui, outcome);
    Ok(())
}

/// Read the input files into documents, enforcing name uniqueness.
async fn read_documents(files: &[PathBuf]) -> Result<Vec<Document>> {
    let mut seen = BTreeSet::new();
    let mut documents = Vec::with_capacity(files.len());
    for path in files {
        let name = path
            .file_name()
            .with_context(|| format!("no file name in {:?}", path.display()))?
            .to_string_lossy()
            .into_owned();
        if !seen.insert(name.clone()) {
            anyhow::bail!("duplicate document name {:?} in input", name);
        }
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {:?}", path.display()))?;
        documents.push(Document { name, data });
    }
    Ok(documents)
}

/// Write one JSON line per document, successes and failures alike.
async fn write_records(path: Option<&Path>, outcome: &RunOutcome) -> Result<()> {
    let mut lines = String::new();
    for summary in &outcome.documents {
        let record = DocumentRecord::from_summary(summary);
        lines.push_str(&serde_json::to_string(&record)?);
        lines.push('\n');
    }
    for failure in &outcome.failures {
        let record = DocumentRecord::from_failure(&failure.name, &failure.message);
        lines.push_str(&serde_json::to_string(&record)?);
        lines.push('\n');
    }

    match path {
        Some(path) => tokio::fs::write(path, lines)
            .await
            .with_context(|| format!("failed to write {:?}", path.display()))?,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout
                .write_all(lines.as_bytes())
                .await
                .context("failed to write to stdout")?;
            stdout.flush().await.context("failed to flush stdout")?;
        }
    }
    Ok(())
}

/// Display closing counters to the user.
fn display_summary(ui: &Ui, outcome: &RunOutcome) {
    ui.display_message(
        "📄",
        &format!(
            "{} documents, {} pages processed",
            outcome.summary.document_count, outcome.summary.page_count
        ),
    );
    if outcome.summary.failed_page_count > 0 {
        ui.display_message(
            "⚠️",
            &format!(
                "{} pages could not be recognized",
                outcome.summary.failed_page_count
            ),
        );
    }
    if !outcome.failures.is_empty() {
        ui.display_message(
            "❌",
            &format!("{} documents could not be rasterized", outcome.failures.len()),
        );
    }
}
