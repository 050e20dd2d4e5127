//! reqwest adapter for the payment portal's PHP pages.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, COOKIE, SET_COOKIE};
use reqwest::{redirect, Client, StatusCode};
use tracing::{debug, instrument};

use super::session::Cookie;
use super::{Authenticator, Credentials, DateRange, PageSource, RawRecord, SessionHandle, SessionState};
use crate::error::{AuthError, FetchError};

const LOGIN_PATH: &str = "/login/index.php";
const USER_AGENT: &str = concat!("carwash-etl/", env!("CARGO_PKG_VERSION"));

static LOGIN_FORM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)<form[^>]*>.*?<input[^>]*type="password""#).unwrap());
static TRANSACTION_CELL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<td[^>]*class="[^"]*purchase-transaction[^"]*"[^>]*>"#).unwrap());
static DETAILS_DIV: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<div[^>]*id="transaction_pos_[^"]*"[^>]*>"#).unwrap());
static ROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<tr[^>]*>(.*?)</tr>").unwrap());
static CELL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<td[^>]*>(.*?)</td>").unwrap());
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]+>").unwrap());
static SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\r\n]+").unwrap());

pub struct HttpPortal {
    client: Client,
    base_url: String,
}

impl HttpPortal {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        // redirects are inspected: a bounce to the login page means the session is gone
        let client = Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::none())
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn login_url(&self) -> String {
        format!("{}{}", self.base_url, LOGIN_PATH)
    }
}

#[async_trait]
impl Authenticator for HttpPortal {
    #[instrument(skip(self, credentials), fields(username = %credentials.username))]
    async fn authenticate(&self, credentials: &Credentials) -> Result<SessionHandle, AuthError> {
        let url = self.login_url();
        let unreachable = |e: reqwest::Error| AuthError::Unreachable(e.to_string());

        let page = self.client.get(&url).send().await.map_err(unreachable)?;
        let mut cookies = collect_cookies(page.headers());
        let body = page.text().await.map_err(unreachable)?;
        if !LOGIN_FORM.is_match(&body) {
            return Err(AuthError::FlowChanged("login form not found".into()));
        }

        let mut request = self
            .client
            .post(&url)
            .form(&[("username", credentials.username.as_str()), ("password", credentials.password.as_str())]);
        if !cookies.is_empty() {
            request = request.header(COOKIE, SessionState::new(cookies.clone()).cookie_header());
        }
        let response = request.send().await.map_err(unreachable)?;
        let status = response.status();
        merge_cookies(&mut cookies, collect_cookies(response.headers()));
        debug!(%status, cookies = cookies.len(), "login form submitted");
        let body = response.text().await.map_err(unreachable)?;
        login_outcome(status, &body, cookies)
    }
}

#[async_trait]
impl PageSource for HttpPortal {
    #[instrument(skip(self, session))]
    async fn fetch_page(
        &self,
        session: &SessionHandle,
        range: &DateRange,
        page: u32,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let mut query = vec![
            ("page", "purchases_inner".to_string()),
            ("pagenum", page.to_string()),
        ];
        if let Some(from) = range.from {
            query.push(("from", from.format("%m/%d/%Y").to_string()));
        }
        if let Some(to) = range.to {
            query.push(("to", to.format("%m/%d/%Y").to_string()));
        }

        let response = self
            .client
            .get(self.login_url())
            .query(&query)
            .header(COOKIE, session.state().cookie_header())
            .send()
            .await
            .map_err(|e| FetchError::PortalUnavailable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::PortalUnavailable(e.to_string()))?;
        listing_outcome(status, &body)
    }
}

/// Classify the response to the login form POST.
fn login_outcome(status: StatusCode, body: &str, cookies: Vec<Cookie>) -> Result<SessionHandle, AuthError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(AuthError::Rejected);
    }
    if status.is_server_error() {
        return Err(AuthError::Unreachable(format!("login returned {status}")));
    }
    if status.is_client_error() {
        return Err(AuthError::FlowChanged(format!("login returned {status}")));
    }
    // the portal answers a bad password by rendering the form again
    if status.is_success() && LOGIN_FORM.is_match(body) {
        return Err(AuthError::Rejected);
    }
    if cookies.is_empty() {
        return Err(AuthError::Rejected);
    }
    Ok(SessionHandle::logged_in(SessionState::new(cookies)))
}

/// Classify a listing page response. Redirects go to the login page.
fn listing_outcome(status: StatusCode, body: &str) -> Result<Vec<RawRecord>, FetchError> {
    if status.is_redirection() || status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(FetchError::SessionExpired);
    }
    if !status.is_success() {
        return Err(FetchError::PortalUnavailable(format!("listing returned {status}")));
    }
    if LOGIN_FORM.is_match(body) {
        return Err(FetchError::SessionExpired);
    }
    Ok(extract_rows(body))
}

fn collect_cookies(headers: &HeaderMap) -> Vec<Cookie> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .map(|(name, value)| Cookie {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
        })
        .filter(|c| !c.name.is_empty() && !c.value.is_empty() && c.value != "deleted")
        .collect()
}

fn merge_cookies(into: &mut Vec<Cookie>, newer: Vec<Cookie>) {
    for cookie in newer {
        match into.iter_mut().find(|c| c.name == cookie.name) {
            Some(existing) => existing.value = cookie.value,
            None => into.push(cookie),
        }
    }
}

/// Pull transaction rows out of a purchases listing page.
///
/// Each `td.purchase-transaction` holds a one-row summary table (date-time,
/// cardholder, type, total) followed by a `transaction_pos_*` div with the
/// detail table. Summary cells become the fragment, detail rows become
/// tab-separated detail lines.
pub fn extract_rows(html: &str) -> Vec<RawRecord> {
    TRANSACTION_CELL
        .split(html)
        .skip(1)
        .filter_map(|chunk| {
            let (summary, details) = match DETAILS_DIV.find(chunk) {
                Some(m) => (&chunk[..m.start()], &chunk[m.end()..]),
                None => (chunk, ""),
            };
            let cells: Vec<String> = CELL
                .captures_iter(summary)
                .map(|caps| text_of(&caps[1]))
                .take(4)
                .collect();
            if cells.len() < 4 {
                return None;
            }
            let detail_lines: Vec<String> = ROW
                .captures_iter(details)
                .map(|row| {
                    CELL.captures_iter(&row[1])
                        .map(|caps| text_of(&caps[1]))
                        .filter(|cell| !cell.is_empty())
                        .collect::<Vec<_>>()
                        .join("\t")
                })
                .filter(|line| !line.is_empty())
                .collect();
            Some(RawRecord::new(cells.join(" | ")).with_details(detail_lines))
        })
        .collect()
}

fn text_of(html: &str) -> String {
    let text = TAG.replace_all(html, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&#36;", "$")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    SPACE.replace_all(&text, " ").trim().to_string()
}
