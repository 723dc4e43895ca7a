//! Conversation with the Nevada SilverFlume entity search portal.
//!
//! The portal answers every request with HTTP 200, whether it served an
//! entity detail page, a CAPTCHA interstitial or an empty search. Callers
//! therefore never branch on status codes: [`classify_page`] is the single
//! place that turns page markup into a [`PageKind`].

mod http;
mod parser;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nvsos_core::{CaptchaChallenge, CaptchaSolution, TokenWidget};
use nvsos_storage::{FetchError, RetryDisposition};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::{HttpPortalConnector, HttpPortalSession, PortalConfig};
pub use parser::{parse_entity_page, ParseError};

pub const CRATE_NAME: &str = "nvsos-portal";

pub const DEFAULT_ENTRY_URL: &str = "https://esos.nv.gov/EntitySearch/OnlineEntitySearch";
pub const DEFAULT_DETAIL_URL: &str = "https://esos.nv.gov/EntitySearch/BusinessInformation";

/// Id of the file-number text box on the search form.
pub const ENTITY_NUMBER_INPUT_ID: &str = "BusinessSearch_Index_txtEntityNumber";

const SEARCH_FORM_MARKER: &str = "input#BusinessSearch_Index_txtEntityNumber";
const DETAIL_MARKERS: &str = "table#grid_principalList";
const WIDGET_MARKERS: &str = "[data-sitekey], div.h-captcha, div.g-recaptcha";
const FRAME_MARKER: &str = "iframe#main-iframe";
const IMAGE_MARKERS: &str = "img[id*=\"captcha\" i], img[src*=\"captcha\" i]";
const NO_MATCH_PHRASES: &[&str] = &[
    "no records found",
    "no record found",
    "no matching records",
    "no results found",
    "0 records found",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageKind {
    ResultPage,
    ChallengePage,
    NoMatchFound,
    Unrecognized,
}

/// Classify a portal page by its markup.
pub fn classify_page(html: &str) -> PageKind {
    let document = Html::parse_document(html);
    if is_detail_page(&document) {
        PageKind::ResultPage
    } else if has_match(&document, WIDGET_MARKERS)
        || has_match(&document, FRAME_MARKER)
        || has_match(&document, IMAGE_MARKERS)
    {
        PageKind::ChallengePage
    } else if is_no_match_page(&document) {
        PageKind::NoMatchFound
    } else {
        PageKind::Unrecognized
    }
}

fn is_detail_page(document: &Html) -> bool {
    if has_match(document, SEARCH_FORM_MARKER) {
        return false;
    }
    if has_match(document, DETAIL_MARKERS) {
        return true;
    }
    let Ok(labels) = Selector::parse("div.panel-body label.control-label") else {
        return false;
    };
    document
        .select(&labels)
        .any(|label| normalize_label(&element_text(label)) == "entity name")
}

fn is_no_match_page(document: &Html) -> bool {
    if has_match(document, "td.dataTables_empty") {
        return true;
    }
    let text = element_text(document.root_element()).to_ascii_lowercase();
    NO_MATCH_PHRASES
        .iter()
        .any(|phrase| contains_phrase(&text, phrase))
}

/// Substring match that refuses to start mid-word, so "0 records" never matches "10 records".
fn contains_phrase(text: &str, phrase: &str) -> bool {
    text.match_indices(phrase).any(|(start, _)| {
        !text[..start]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_alphanumeric())
    })
}

/// True when the page carries the file-number search form.
pub fn has_search_form(html: &str) -> bool {
    has_match(&Html::parse_document(html), SEARCH_FORM_MARKER)
}

fn has_match(document: &Html, css: &str) -> bool {
    Selector::parse(css)
        .map(|sel| document.select(&sel).next().is_some())
        .unwrap_or(false)
}

fn first_match<'a>(document: &'a Html, css: &str) -> Option<ElementRef<'a>> {
    let sel = Selector::parse(css).ok()?;
    document.select(&sel).next()
}

/// Whitespace-collapsed text content of an element.
pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

pub(crate) fn normalize_label(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(|c: char| c == ':' || c == '*' || c.is_whitespace())
        .to_ascii_lowercase()
}

/// A fetched portal page together with its classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalPage {
    pub url: String,
    pub html: String,
    pub kind: PageKind,
    /// Set on challenge pages whose widget could be read.
    pub challenge: Option<CaptchaChallenge>,
    pub fetched_at: DateTime<Utc>,
}

impl PortalPage {
    pub fn new(url: impl Into<String>, html: impl Into<String>) -> Self {
        let html = html.into();
        Self {
            url: url.into(),
            kind: classify_page(&html),
            html,
            challenge: None,
            fetched_at: Utc::now(),
        }
    }

    pub fn with_challenge(mut self, challenge: CaptchaChallenge) -> Self {
        self.challenge = Some(challenge);
        self
    }
}

#[derive(Debug, Error)]
pub enum PortalError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("portal session setup failed: {0}")]
    Setup(String),
    #[error("unexpected portal state: {0}")]
    Protocol(String),
}

impl PortalError {
    /// Network-level failures (DNS, TLS, timeouts, 5xx) may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PortalError::Fetch(err) if err.disposition() == RetryDisposition::Retryable)
    }
}

/// One conversation with the portal. Cookies persist for the lifetime of the session.
#[async_trait]
pub trait PortalSession: Send {
    /// Load the search entry page.
    async fn open(&mut self) -> Result<PortalPage, PortalError>;

    /// Post the search form. The returned page is a result, a challenge or a no-match page.
    async fn submit_file_number(&mut self, file_number: &str) -> Result<PortalPage, PortalError>;

    /// Answer the pending challenge. A returned `ChallengePage` means the token was
    /// rejected and carries a fresh challenge.
    async fn submit_challenge_response(
        &mut self,
        solution: &CaptchaSolution,
    ) -> Result<PortalPage, PortalError>;

    fn last_page(&self) -> Option<&PortalPage>;
}

/// Hands out a fresh, cookie-isolated session per scrape request.
pub trait SessionFactory: Send + Sync {
    fn new_session(&self) -> Result<Box<dyn PortalSession>, PortalError>;
}

/// Link from a search listing row to the entity detail page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetailLink {
    Href(String),
    BusinessId(String),
}

pub fn find_detail_link(html: &str) -> Option<DetailLink> {
    let document = Html::parse_document(html);
    if let Some(anchor) = first_match(&document, "a[onclick*=\"GetBusinessSearchResultById\"]") {
        if let Some(id) = anchor.value().attr("onclick").and_then(call_argument) {
            return Some(DetailLink::BusinessId(id));
        }
    }
    let sel = Selector::parse("a[href*=\"BusinessInformation\"], a[href*=\"BusinessSearchResult\"]").ok()?;
    document
        .select(&sel)
        .filter_map(|a| a.value().attr("href"))
        .find(|href| !href.starts_with('#') && !href.starts_with("javascript:"))
        .map(|href| DetailLink::Href(href.to_string()))
}

fn call_argument(onclick: &str) -> Option<String> {
    let start = onclick.find('(')? + 1;
    let end = start + onclick[start..].find(')')?;
    let arg = onclick[start..end]
        .split(',')
        .next()?
        .trim()
        .trim_matches(|c| c == '\'' || c == '"')
        .trim();
    text_or_none(arg.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChallengeMarkup {
    Widget { widget: TokenWidget, site_key: String },
    Frame { src: String },
    Image { src: String },
}

pub(crate) fn find_challenge_markup(html: &str) -> Option<ChallengeMarkup> {
    let document = Html::parse_document(html);

    let sitekey_sel = Selector::parse("[data-sitekey]").ok()?;
    for widget in document.select(&sitekey_sel) {
        let Some(site_key) = widget
            .value()
            .attr("data-sitekey")
            .and_then(|k| text_or_none(k.to_string()))
        else {
            continue;
        };
        let widget_kind = if widget.value().classes().any(|c| c == "g-recaptcha") {
            TokenWidget::ReCaptcha
        } else {
            TokenWidget::HCaptcha
        };
        return Some(ChallengeMarkup::Widget {
            widget: widget_kind,
            site_key,
        });
    }

    if let Some(src) = first_match(&document, FRAME_MARKER).and_then(|f| f.value().attr("src")) {
        return Some(ChallengeMarkup::Frame {
            src: src.to_string(),
        });
    }

    first_match(&document, IMAGE_MARKERS)
        .and_then(|img| img.value().attr("src"))
        .map(|src| ChallengeMarkup::Image {
            src: src.to_string(),
        })
}

/// The submittable fields of an HTML form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FormSpec {
    pub action: Option<String>,
    pub fields: Vec<(String, String)>,
    /// Visible text input meant to receive an image CAPTCHA answer.
    pub answer_field: Option<String>,
}

/// First form containing an element matching `marker_css`.
pub(crate) fn find_form(html: &str, marker_css: &str) -> Option<FormSpec> {
    let document = Html::parse_document(html);
    let form_sel = Selector::parse("form").ok()?;
    let marker_sel = Selector::parse(marker_css).ok()?;
    let form = document
        .select(&form_sel)
        .find(|form| form.select(&marker_sel).next().is_some())?;
    Some(form_spec(form))
}

fn form_spec(form: ElementRef<'_>) -> FormSpec {
    let mut fields = Vec::new();
    let mut answer_field = None;

    if let Ok(input_sel) = Selector::parse("input[name], textarea[name]") {
        for input in form.select(&input_sel) {
            let el = input.value();
            let Some(name) = el.attr("name") else {
                continue;
            };
            let input_type = el.attr("type").unwrap_or("text").to_ascii_lowercase();
            match input_type.as_str() {
                "submit" | "button" | "image" | "reset" | "file" => continue,
                "checkbox" | "radio" if el.attr("checked").is_none() => continue,
                _ => {}
            }
            let value = if el.name() == "textarea" {
                input.text().collect::<String>()
            } else {
                el.attr("value").unwrap_or_default().to_string()
            };
            let lower = name.to_ascii_lowercase();
            if answer_field.is_none()
                && input_type != "hidden"
                && el.name() == "input"
                && lower.contains("captcha")
            {
                answer_field = Some(name.to_string());
            }
            fields.push((name.to_string(), value));
        }
    }

    FormSpec {
        action: form
            .value()
            .attr("action")
            .and_then(|a| text_or_none(a.to_string())),
        fields,
        answer_field,
    }
}

/// `name` attribute of the file-number input, when the page carries the search form.
pub(crate) fn search_field_name(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    first_match(&document, SEARCH_FORM_MARKER)
        .and_then(|input| input.value().attr("name"))
        .map(str::to_string)
}

pub(crate) fn set_field(fields: &mut Vec<(String, String)>, name: &str, value: &str) {
    match fields.iter_mut().find(|(n, _)| n == name) {
        Some(slot) => slot.1 = value.to_string(),
        None => fields.push((name.to_string(), value.to_string())),
    }
}
