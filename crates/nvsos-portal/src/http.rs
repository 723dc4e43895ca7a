//! reqwest-backed portal session.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use nvsos_core::{CaptchaChallenge, CaptchaSolution};
use nvsos_storage::{FetchedResponse, HttpClientConfig, HttpFetcher};
use reqwest::Url;
use tracing::{debug, info, warn};

use crate::{
    find_challenge_markup, find_detail_link, find_form, has_search_form, search_field_name,
    set_field, ChallengeMarkup, DetailLink, PageKind, PortalError, PortalPage, PortalSession,
    SessionFactory, DEFAULT_DETAIL_URL, DEFAULT_ENTRY_URL, IMAGE_MARKERS, SEARCH_FORM_MARKER,
    WIDGET_MARKERS,
};

const FALLBACK_SEARCH_FIELD: &str = "EntityNumber";
const DETAIL_ID_FIELD: &str = "businessId";

#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub entry_url: String,
    /// Posted `businessId=<id>` when a listing row links by script call instead of href.
    pub detail_url: String,
    pub http: HttpClientConfig,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            entry_url: DEFAULT_ENTRY_URL.to_string(),
            detail_url: DEFAULT_DETAIL_URL.to_string(),
            http: HttpClientConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpPortalConnector {
    config: PortalConfig,
}

impl HttpPortalConnector {
    pub fn new(config: PortalConfig) -> Self {
        Self { config }
    }
}

impl SessionFactory for HttpPortalConnector {
    fn new_session(&self) -> Result<Box<dyn PortalSession>, PortalError> {
        Ok(Box::new(HttpPortalSession::new(self.config.clone())?))
    }
}

#[derive(Debug, Clone)]
struct FormTarget {
    action: String,
    fields: Vec<(String, String)>,
    answer_field: Option<String>,
}

#[derive(Debug, Clone)]
struct PendingChallenge {
    page: PortalPage,
    form: FormTarget,
}

#[derive(Debug)]
pub struct HttpPortalSession {
    config: PortalConfig,
    http: HttpFetcher,
    search_page: Option<PortalPage>,
    pending_challenge: Option<PendingChallenge>,
    file_number: Option<String>,
    /// Set once a challenge answer was accepted and the search still has to be replayed.
    replay_search: bool,
    last_page: Option<PortalPage>,
}

impl HttpPortalSession {
    pub fn new(config: PortalConfig) -> Result<Self, PortalError> {
        let http = HttpFetcher::new(config.http.clone())
            .map_err(|err| PortalError::Setup(format!("{err:#}")))?;
        Ok(Self {
            config,
            http,
            search_page: None,
            pending_challenge: None,
            file_number: None,
            replay_search: false,
            last_page: None,
        })
    }

    async fn search(&mut self, file_number: &str) -> Result<PortalPage, PortalError> {
        let target = self
            .search_page
            .as_ref()
            .and_then(|page| search_form_target(page, file_number))
            .unwrap_or_else(|| FormTarget {
                action: self.config.entry_url.clone(),
                fields: vec![(FALLBACK_SEARCH_FIELD.to_string(), file_number.to_string())],
                answer_field: None,
            });
        info!(action = %target.action, "submitting file number search");
        let fetched = self.http.post_form(&target.action, &target.fields).await?;
        self.absorb(fetched).await
    }

    async fn resume_search(&mut self, file_number: &str) -> Result<PortalPage, PortalError> {
        self.replay_search = true;
        let page = self.search(file_number).await?;
        self.replay_search = false;
        Ok(page)
    }

    /// Classify a response, follow a listing hop, and track challenge/search state.
    async fn absorb(&mut self, fetched: FetchedResponse) -> Result<PortalPage, PortalError> {
        let mut page = PortalPage::new(fetched.final_url.clone(), fetched.text());
        self.last_page = Some(page.clone());

        if page.kind == PageKind::Unrecognized {
            if let Some(link) = find_detail_link(&page.html) {
                debug!(?link, "following search listing to detail page");
                page = self.follow_detail_link(&page.url, link).await?;
                self.last_page = Some(page.clone());
            }
        }

        if has_search_form(&page.html) {
            self.search_page = Some(page.clone());
        }

        if page.kind == PageKind::ChallengePage {
            page = self.inspect_challenge(page).await?;
        } else {
            self.pending_challenge = None;
        }
        self.last_page = Some(page.clone());
        Ok(page)
    }

    async fn follow_detail_link(
        &self,
        base_url: &str,
        link: DetailLink,
    ) -> Result<PortalPage, PortalError> {
        let fetched = match link {
            DetailLink::Href(href) => self.http.get(&resolve_url(base_url, &href)?).await?,
            DetailLink::BusinessId(id) => {
                self.http
                    .post_form(&self.config.detail_url, &[(DETAIL_ID_FIELD.to_string(), id)])
                    .await?
            }
        };
        Ok(PortalPage::new(fetched.final_url.clone(), fetched.text()))
    }

    /// Read the challenge widget (fetching the frame or image it points at) and
    /// remember where its answer must be posted.
    async fn inspect_challenge(&mut self, page: PortalPage) -> Result<PortalPage, PortalError> {
        let Some(markup) = find_challenge_markup(&page.html) else {
            warn!(url = %page.url, "challenge page without a readable widget");
            self.pending_challenge = None;
            return Ok(page);
        };

        let (challenge, form) = match markup {
            ChallengeMarkup::Widget { widget, site_key } => (
                CaptchaChallenge::token(widget, site_key, page.url.clone()),
                form_target(&page.html, &page.url, WIDGET_MARKERS),
            ),
            ChallengeMarkup::Frame { src } => {
                let frame_url = resolve_url(&page.url, &src)?;
                let frame = self.http.get(&frame_url).await?;
                let frame_html = frame.text();
                let Some(ChallengeMarkup::Widget { widget, site_key }) =
                    find_challenge_markup(&frame_html)
                else {
                    warn!(%frame_url, "challenge frame without a site key");
                    self.pending_challenge = None;
                    return Ok(page);
                };
                (
                    CaptchaChallenge::token(widget, site_key, page.url.clone()),
                    form_target(&frame_html, &frame.final_url, WIDGET_MARKERS),
                )
            }
            ChallengeMarkup::Image { src } => {
                let image = self.http.get(&resolve_url(&page.url, &src)?).await?;
                (
                    CaptchaChallenge::image(STANDARD.encode(&image.body), page.url.clone()),
                    form_target(&page.html, &page.url, IMAGE_MARKERS),
                )
            }
        };

        let form = form.unwrap_or_else(|| FormTarget {
            action: page.url.clone(),
            fields: Vec::new(),
            answer_field: None,
        });
        info!(kind = ?challenge.kind, action = %form.action, "challenge detected");
        let page = page.with_challenge(challenge);
        self.pending_challenge = Some(PendingChallenge {
            page: page.clone(),
            form,
        });
        Ok(page)
    }
}

#[async_trait]
impl PortalSession for HttpPortalSession {
    async fn open(&mut self) -> Result<PortalPage, PortalError> {
        let url = self.config.entry_url.clone();
        info!(%url, "loading search entry page");
        let fetched = self.http.get(&url).await?;
        self.absorb(fetched).await
    }

    async fn submit_file_number(&mut self, file_number: &str) -> Result<PortalPage, PortalError> {
        self.file_number = Some(file_number.to_string());
        // The entry page itself was gated; the search waits for the challenge.
        if let Some(pending) = &self.pending_challenge {
            return Ok(pending.page.clone());
        }
        self.search(file_number).await
    }

    async fn submit_challenge_response(
        &mut self,
        solution: &CaptchaSolution,
    ) -> Result<PortalPage, PortalError> {
        // A retry after the answer went through only repeats the search.
        if self.replay_search && self.pending_challenge.is_none() {
            if let Some(file_number) = self.file_number.clone() {
                info!("resuming search after accepted challenge response");
                return self.resume_search(&file_number).await;
            }
        }
        self.replay_search = false;

        let pending = self
            .pending_challenge
            .clone()
            .ok_or_else(|| PortalError::Protocol("no challenge is pending".to_string()))?;

        if let Some(user_agent) = &solution.user_agent {
            self.http.set_user_agent(user_agent.clone());
        }

        let mut fields = pending.form.fields.clone();
        set_field(&mut fields, "h-captcha-response", &solution.token);
        set_field(&mut fields, "g-recaptcha-response", &solution.token);
        if let Some(answer_field) = &pending.form.answer_field {
            set_field(&mut fields, answer_field, &solution.token);
        }

        info!(action = %pending.form.action, "submitting challenge response");
        let fetched = self.http.post_form(&pending.form.action, &fields).await?;
        let page = self.absorb(fetched).await?;

        if page.kind == PageKind::Unrecognized && has_search_form(&page.html) {
            if let Some(file_number) = self.file_number.clone() {
                return self.resume_search(&file_number).await;
            }
        }
        Ok(page)
    }

    fn last_page(&self) -> Option<&PortalPage> {
        self.last_page.as_ref()
    }
}

fn resolve_url(base: &str, href: &str) -> Result<String, PortalError> {
    Url::parse(base)
        .and_then(|base| base.join(href))
        .map(String::from)
        .map_err(|err| PortalError::Protocol(format!("cannot resolve {href} against {base}: {err}")))
}

fn form_target(html: &str, base_url: &str, marker_css: &str) -> Option<FormTarget> {
    let form = find_form(html, marker_css)?;
    let action = match form.action.as_deref() {
        Some(action) => resolve_url(base_url, action).ok()?,
        None => base_url.to_string(),
    };
    Some(FormTarget {
        action,
        fields: form.fields,
        answer_field: form.answer_field,
    })
}

fn search_form_target(page: &PortalPage, file_number: &str) -> Option<FormTarget> {
    let mut target = form_target(&page.html, &page.url, SEARCH_FORM_MARKER)?;
    let field = search_field_name(&page.html).unwrap_or_else(|| FALLBACK_SEARCH_FIELD.to_string());
    set_field(&mut target.fields, &field, file_number);
    Some(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_actions_resolve_against_page_url() {
        assert_eq!(
            resolve_url("https://esos.nv.gov/EntitySearch/OnlineEntitySearch", "/Captcha/Verify").unwrap(),
            "https://esos.nv.gov/Captcha/Verify"
        );
        assert_eq!(
            resolve_url("https://esos.nv.gov/EntitySearch/OnlineEntitySearch", "https://other.example/x").unwrap(),
            "https://other.example/x"
        );
        assert!(resolve_url("not a url", "/x").is_err());
    }

    #[test]
    fn search_target_fills_the_file_number_field() {
        let page = PortalPage::new(
            "https://esos.nv.gov/EntitySearch/OnlineEntitySearch",
            crate::tests::fixture("search_form.html"),
        );
        let target = search_form_target(&page, "E10281132020-8").expect("target");
        assert_eq!(target.action, "https://esos.nv.gov/EntitySearch/OnlineEntitySearch");
        assert!(target.fields.contains(&(
            "BusinessSearch_Index.txtEntityNumber".to_string(),
            "E10281132020-8".to_string()
        )));
    }
}
