//! Client for the vision-language inference backend.
//!
//! The backend is any OpenAI-compatible `/chat/completions` server hosting a
//! vision model (typically vLLM). Each page is one synchronous request: a
//! fixed instruction plus the page image inlined as a `data:` URL, with
//! deterministic decoding. Failures are never raised to the caller; they are
//! recorded as the page's text so that the pipeline always produces a
//! displayable result for every page.

use std::time::{Duration, Instant};

use clap::Args;
use serde::{Deserialize, Serialize};

use crate::{
    data_url::{base64_payload, data_url},
    pool::{PageErrorKind, PageFailure, PageResult, PageText, WorkItem},
    prelude::*,
};

/// The instruction sent with every page.
const OCR_INSTRUCTION: &str = "Please extract all text from this image.";

/// Upper bound on completion tokens for one page.
const MAX_TOKENS: u32 = 4096;

/// Sampling temperature. Zero, so runs are reproducible.
const TEMPERATURE: f32 = 0.0;

/// Where to find the backend if neither the flag nor the environment says
/// otherwise.
const DEFAULT_API_BASE: &str = "http://qwen-vlm:8000/v1";

/// Backend-related options.
#[derive(Args, Clone, Debug)]
pub struct ClientOpts {
    /// Base URL of the OpenAI-compatible inference server. Defaults to
    /// `OPENAI_API_BASE`, or a local vLLM address.
    #[clap(long)]
    pub api_base: Option<String>,

    /// The model to request.
    #[clap(long, default_value = "Qwen/Qwen2.5-VL-3B-Instruct-AWQ")]
    pub model: String,

    /// Per-request timeout, in seconds.
    #[clap(long, default_value = "60")]
    pub timeout: u64,
}

/// A chat completion request. This is the fixed envelope the backend
/// expects; there is no templating layer.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: Vec<ContentPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

/// The part of a chat completion response we actually read.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: String,
}

/// A client for one inference backend.
///
/// Cheap to share behind an [`std::sync::Arc`]; the underlying HTTP client
/// pools connections.
pub struct InferenceClient {
    http: reqwest::Client,
    url: String,
    model: String,
    timeout: Duration,
    api_key: Option<String>,
}

impl InferenceClient {
    /// Create a new client from command-line options and the environment.
    pub fn new(opts: &ClientOpts) -> Result<Self> {
        let api_base = opts
            .api_base
            .clone()
            .or_else(|| std::env::var("OPENAI_API_BASE").ok())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_owned());
        let mut url = api_base;
        if !url.ends_with('/') {
            url.push('/');
        }
        url.push_str("chat/completions");

        let http = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            url,
            model: opts.model.clone(),
            timeout: Duration::from_secs(opts.timeout),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
        })
    }

    /// Recognize the text on one page.
    ///
    /// This consumes the work item and always produces a result: a non-2xx
    /// status, a timeout, a connection failure or a malformed response body
    /// all come back as the page's text, with the elapsed time actually
    /// spent. The caller never sees an error.
    #[instrument(level = "debug", skip_all, fields(doc = %item.doc_name, page = item.page_number))]
    pub async fn recognize_page(&self, item: WorkItem) -> PageResult {
        let started = Instant::now();
        let image_base64 = base64_payload(&item.image.data);
        let request = ChatRequest {
            model: &self.model,
            messages: vec![Message {
                role: "user",
                content: vec![
                    ContentPart::Text {
                        text: OCR_INSTRUCTION,
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: data_url(&item.image.mime_type, &image_base64),
                        },
                    },
                ],
            }],
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
        };

        let text = self.perform_request(&request).await;
        let elapsed = started.elapsed();
        if let PageText::Failed(failure) = &text {
            debug!(
                doc = %item.doc_name,
                page = item.page_number,
                kind = ?failure.kind,
                "Page failed: {}",
                failure.message
            );
        }
        PageResult {
            doc_name: item.doc_name,
            page_number: item.page_number,
            text,
            elapsed,
            image_base64,
            image: item.image,
        }
    }

    /// Perform one HTTP round trip, mapping every failure mode to text.
    async fn perform_request(&self, request: &ChatRequest<'_>) -> PageText {
        let mut builder = self
            .http
            .post(&self.url)
            .timeout(self.timeout)
            .json(request);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(err) => return transport_failure(format!("Exception: {err}")),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return PageText::Failed(PageFailure {
                kind: PageErrorKind::Backend,
                message: format!("Error: {} - {}", status.as_u16(), body),
            });
        }

        match response.json::<ChatResponse>().await {
            Ok(body) => match body.choices.into_iter().next() {
                Some(choice) => PageText::Recognized(choice.message.content),
                None => transport_failure(
                    "Exception: response contained no choices".to_owned(),
                ),
            },
            Err(err) => transport_failure(format!("Exception: {err}")),
        }
    }
}

fn transport_failure(message: String) -> PageText {
    PageText::Failed(PageFailure {
        kind: PageErrorKind::Transport,
        message,
    })
}

#[cfg(test)]
impl InferenceClient {
    /// Build a client pointed at a local mock backend.
    pub fn for_tests(api_base: &str, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: format!("{api_base}/chat/completions"),
            model: "test-model".to_owned(),
            timeout,
            api_key: None,
        }
    }
}
