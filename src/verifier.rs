//! Content verification for the trust filter.
//!
//! A verification fetches the page directly (never through a configured
//! proxy, which could be this process), reduces the HTML to its text, and
//! scans it for banned phrases.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::phrases::BannedPhrases;

/// Marks verification traffic so it can be told apart from client traffic.
pub const INTERNAL_REQUEST_HEADER: &str = "internal-proxy-request";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// Page fetched and no banned phrase found.
    Clean,
    /// Page fetched and contains the given phrase.
    Banned(String),
    /// Fetch failed or the server did not answer `200`.
    Unverifiable,
}

#[async_trait::async_trait]
pub trait ContentVerifier: Send + Sync {
    async fn verify(&self, url: &str) -> Verification;
}

pub struct HttpVerifier {
    client: reqwest::Client,
    phrases: Arc<BannedPhrases>,
}

impl HttpVerifier {
    pub fn new(phrases: Arc<BannedPhrases>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()?;

        Ok(Self { client, phrases })
    }
}

#[async_trait::async_trait]
impl ContentVerifier for HttpVerifier {
    async fn verify(&self, url: &str) -> Verification {
        let response = match self
            .client
            .get(url)
            .header(INTERNAL_REQUEST_HEADER, "true")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Verification request for {} failed: {}", url, e);
                return Verification::Unverifiable;
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            debug!("Verification of {} returned {}", url, response.status());
            return Verification::Unverifiable;
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                warn!("Verification body for {} unreadable: {}", url, e);
                return Verification::Unverifiable;
            }
        };

        let text = page_text(&body);
        match self.phrases.find_match(&text) {
            Some(phrase) => {
                debug!("Phrase {:?} found in content of {}", phrase, url);
                Verification::Banned(phrase.to_string())
            }
            None => Verification::Clean,
        }
    }
}

/// Visible text of an HTML document: tags dropped, common entities decoded.
///
/// A `<` not followed by a letter, `/`, `!` or `?` is plain text.
///
/// Markup inside `<script>` and `<style>` is kept as text, which matches how
/// a lenient parser's text extraction treats those elements.
pub fn page_text(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(open) = rest.find('<') {
        text.push_str(&rest[..open]);
        let after = &rest[open..];

        if let Some(comment) = after.strip_prefix("<!--") {
            rest = match comment.find("-->") {
                Some(end) => &comment[end + 3..],
                None => "",
            };
            continue;
        }

        let opens_tag = after[1..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || matches!(c, '/' | '!' | '?'));
        if !opens_tag {
            text.push('<');
            rest = &after[1..];
            continue;
        }

        match after.find('>') {
            Some(close) => {
                // Tags separate words the same way whitespace would.
                if !text.ends_with(char::is_whitespace) && !text.is_empty() {
                    text.push(' ');
                }
                rest = &after[close + 1..];
            }
            None => {
                text.push_str(after);
                rest = "";
            }
        }
    }
    text.push_str(rest);

    decode_entities(&text)
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
