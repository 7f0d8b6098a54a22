//! `web.archive.org`: time-travel browsing.
//!
//! The control page picks a target date and toggles the override session.
//! While active, every request is answered with the archived snapshot
//! closest to that date. Links inside the snapshot are pointed back at the
//! original URLs so the next click is captured again.

use async_trait::async_trait;
use chrono::{Datelike, Local, NaiveDate};
use http::Method;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::pages::{action_button, control_page, select};
use super::{Extension, ExtensionServices, RewriteContext};
use crate::content::GatewayResponse;
use crate::error::{GatewayError, Result};
use crate::http_client::{host_of, UpstreamRequest};
use crate::transcode::dom::{elements, get_attr, set_attr, tag_name};
use crate::transcode::serialize::serialize;
use crate::transcode::{Document, OutputFormat};

pub const DOMAIN: &str = "web.archive.org";
const NAME: &str = "waybackmachine";
const AVAILABILITY_API: &str = "https://archive.org/wayback/available";
const FIRST_YEAR: i32 = 1996;
const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

/// Header carrying the snapshot's real capture time.
pub const TIMESTAMP_HEADER: &str = "X-Archive-Timestamp";

/// Selected date, kept in the form's own terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetDate {
    pub year: i32,
    /// 1-based.
    pub month: u32,
    pub day: u32,
}

impl TargetDate {
    fn initial(today: NaiveDate) -> Self {
        Self {
            year: FIRST_YEAR,
            month: today.month(),
            day: today.day(),
        }
    }

    /// Clamp to the month length, and to today within the current year.
    fn clamped(year: i32, month: u32, day: u32, today: NaiveDate) -> Self {
        let year = year.clamp(FIRST_YEAR, today.year());
        let month = month.clamp(1, 12);
        let mut last_day = days_in_month(year, month);
        if year == today.year() {
            last_day = last_day.min(today.day());
        }
        let clamped = day.clamp(1, last_day);
        if clamped != day {
            debug!(day, clamped, "Day clamped");
        }
        Self {
            year,
            month,
            day: clamped,
        }
    }

    /// `YYYYMMDD`
    pub fn timestamp(self) -> String {
        format!("{:04}{:02}{:02}", self.year, self.month, self.day)
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map_or(28, |d| d.day())
}

#[derive(Debug, Deserialize)]
struct Availability {
    #[serde(default)]
    archived_snapshots: Snapshots,
}

#[derive(Debug, Default, Deserialize)]
struct Snapshots {
    closest: Option<Snapshot>,
}

#[derive(Debug, Deserialize)]
struct Snapshot {
    #[serde(default)]
    available: bool,
    url: String,
    timestamp: String,
}

pub struct WaybackMachine {
    domains: Vec<String>,
    date: Mutex<TargetDate>,
}

impl WaybackMachine {
    pub fn new() -> Self {
        Self {
            domains: vec![DOMAIN.to_string()],
            date: Mutex::new(TargetDate::initial(Local::now().date_naive())),
        }
    }

    pub async fn target_date(&self) -> TargetDate {
        *self.date.lock().await
    }

    async fn control(&self, ctx: &RewriteContext, services: &ExtensionServices) -> GatewayResponse {
        if ctx.method == Method::POST {
            match ctx.form_value("action").as_deref() {
                Some("enable") => {
                    services.session.enable(NAME).await;
                }
                Some("disable") => {
                    services.session.disable(NAME).await;
                }
                Some("set date") => self.set_date(ctx).await,
                _ => {}
            }
        }

        let active = services.session.is_held_by(NAME).await;
        let date = self.target_date().await;
        let controls = if active {
            let current_year = Local::now().year();
            let months: Vec<(String, String)> = MONTHS.iter().map(|m| ((*m).to_string(), (*m).to_string())).collect();
            let days: Vec<(String, String)> = (1..=31).map(|d| (d.to_string(), d.to_string())).collect();
            let years: Vec<(String, String)> = (FIRST_YEAR..=current_year)
                .map(|y| (y.to_string(), y.to_string()))
                .collect();
            format!(
                "<table><tr><td>{}</td><td>{}</td><td>{}</td></tr></table>\n{}\n{}",
                select("month", &months, MONTHS[(date.month - 1) as usize]),
                select("day", &days, &date.day.to_string()),
                select("year", &years, &date.year.to_string()),
                action_button("set date"),
                action_button("disable"),
            )
        } else {
            action_button("enable")
        };
        let status = if active {
            "<b>wayback machine enabled!</b><br>\nenter a URL in the address bar, or click <b>disable</b> to quit."
        } else {
            "wayback machine disabled.<br>\nclick <b>enable</b> to begin."
        };
        control_page("WayBack Machine", "WayBack<br>Machine", active, &controls, status)
    }

    async fn set_date(&self, ctx: &RewriteContext) {
        let mut date = self.date.lock().await;
        let month = ctx
            .form_value("month")
            .and_then(|m| MONTHS.iter().position(|name| name.eq_ignore_ascii_case(&m)))
            .map_or(date.month, |i| i as u32 + 1);
        let day = ctx.form_value("day").and_then(|d| d.parse().ok()).unwrap_or(date.day);
        let year = ctx.form_value("year").and_then(|y| y.parse().ok()).unwrap_or(date.year);
        *date = TargetDate::clamped(year, month, day, Local::now().date_naive());
        info!(target_date = %date.timestamp(), "Wayback target date updated");
    }

    async fn snapshot(&self, ctx: &RewriteContext, services: &ExtensionServices) -> Result<GatewayResponse> {
        let date = self.target_date().await;
        let lookup = format!(
            "{AVAILABILITY_API}?url={}&timestamp={}",
            urlencoding::encode(&ctx.url),
            date.timestamp()
        );
        let availability: Availability = {
            let response = services.fetcher.fetch(UpstreamRequest::get(&lookup)).await?.error_for_status()?;
            serde_json::from_slice(&response.body).map_err(|e| GatewayError::upstream(&lookup, e))?
        };
        let snapshot = availability
            .archived_snapshots
            .closest
            .filter(|s| s.available)
            .ok_or_else(|| GatewayError::upstream(&ctx.url, format!("no archived snapshot near {}", date.timestamp())))?;

        debug!(snapshot = %snapshot.url, "Snapshot found");
        let raw_url = raw_snapshot_url(&snapshot.url, &snapshot.timestamp);
        let response = services.fetcher.fetch(UpstreamRequest::get(&raw_url)).await?;

        let mut out = GatewayResponse::from_upstream(response.status, &response.headers, response.body.clone())
            .with_header(TIMESTAMP_HEADER, &snapshot.timestamp);
        if response.content_type().as_deref().map_or(true, |t| t == "text/html") {
            let html = unwrap_archive_links(&response.text(), &ctx.url);
            out = out.with_body("text/html", html);
        }
        Ok(out)
    }
}

impl Default for WaybackMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extension for WaybackMachine {
    fn name(&self) -> &str {
        NAME
    }

    fn domains(&self) -> &[String] {
        &self.domains
    }

    async fn handle(&self, ctx: &RewriteContext, services: &ExtensionServices) -> Result<GatewayResponse> {
        if ctx.host == DOMAIN {
            return Ok(self.control(ctx, services).await);
        }
        if !services.session.is_held_by(NAME).await {
            return Err(GatewayError::NotFound(ctx.url.clone()));
        }
        self.snapshot(ctx, services).await
    }
}

/// The archive's unmodified capture: `id_` after the timestamp turns off
/// its toolbar and link rewriting.
fn raw_snapshot_url(snapshot_url: &str, timestamp: &str) -> String {
    let marker = format!("/web/{timestamp}/");
    snapshot_url.replacen(&marker, &format!("/web/{timestamp}id_/"), 1)
}

/// Original URL behind an archive URL, or `url` unchanged.
pub fn original_url(url: &str) -> String {
    let Ok(parsed) = url::Url::parse(url) else {
        return url.to_string();
    };
    if host_of(url).as_deref() != Some(DOMAIN) {
        return url.to_string();
    }
    let Some(rest) = parsed.path().strip_prefix("/web/") else {
        return url.to_string();
    };
    let Some((_, original)) = rest.split_once('/') else {
        return url.to_string();
    };
    let mut original = if original.starts_with("http://") || original.starts_with("https://") {
        original.to_string()
    } else if let Some(stripped) = original.strip_prefix("http:/").or_else(|| original.strip_prefix("https:/")) {
        format!("http://{stripped}")
    } else {
        format!("http://{original}")
    };
    if let Some(query) = parsed.query() {
        original.push('?');
        original.push_str(query);
    }
    original
}

/// Resolve links against `base` and unwrap archive-prefixed ones.
///
/// Root-relative `/web/...` references are archive links and resolve
/// against the archive host; everything else resolves against the page's
/// original URL.
pub fn unwrap_archive_links(html: &str, base: &str) -> String {
    let doc = Document::parse(html);
    let base = url::Url::parse(base).ok();
    let archive = url::Url::parse(&format!("http://{DOMAIN}/")).ok();
    for node in elements(&doc.root()) {
        let attr = match tag_name(&node) {
            Some("a" | "link" | "area") => "href",
            Some("img" | "script" | "frame" | "iframe" | "embed") => "src",
            Some("form") => "action",
            _ => continue,
        };
        let Some(value) = get_attr(&node, attr) else {
            continue;
        };
        let value_trimmed = value.trim();
        let against = if value_trimmed.starts_with("/web/") { &archive } else { &base };
        let resolved = against
            .as_ref()
            .and_then(|b| b.join(value_trimmed).ok())
            .map_or(value.clone(), |u| u.to_string());
        let rewritten = original_url(&resolved);
        if rewritten != value {
            set_attr(&node, attr, &rewritten);
        }
    }
    serialize(&doc, OutputFormat::Minimal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::{Fetcher, UpstreamResponse};
    use crate::session::OverrideSession;
    use bytes::Bytes;
    use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
    use std::sync::{Arc, Mutex as StdMutex};

    struct Archive {
        requests: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl Fetcher for Archive {
        async fn fetch(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
            self.requests.lock().unwrap().push(request.url.clone());
            let (content_type, body) = if request.url.starts_with(AVAILABILITY_API) {
                (
                    "application/json",
                    r#"{"archived_snapshots":{"closest":{"available":true,"status":"200",
                        "url":"http://web.archive.org/web/19990125092817/http://example.com/",
                        "timestamp":"19990125092817"}}}"#
                        .to_string(),
                )
            } else {
                (
                    "text/html",
                    r#"<a href="/web/19990125092817/http://example.com/news.html">News</a><img src="logo.gif">"#
                        .to_string(),
                )
            };
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
            Ok(UpstreamResponse {
                status: StatusCode::OK,
                headers,
                body: Bytes::from(body),
                final_url: request.url,
            })
        }
    }

    fn services(fetcher: Arc<Archive>) -> ExtensionServices {
        ExtensionServices {
            fetcher,
            session: OverrideSession::new(),
        }
    }

    fn post(body: &str) -> RewriteContext {
        RewriteContext::new(Method::POST, "http://web.archive.org/", HeaderMap::new(), Bytes::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn clamps_days() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        assert_eq!(TargetDate::clamped(2023, 2, 31, today).day, 28);
        assert_eq!(TargetDate::clamped(2000, 2, 31, today).day, 29);
        assert_eq!(TargetDate::clamped(2024, 1, 31, today).day, 10);
        assert_eq!(TargetDate::clamped(1980, 4, 31, today), TargetDate { year: 1996, month: 4, day: 30 });
        assert_eq!(TargetDate::clamped(1999, 1, 25, today).timestamp(), "19990125");
    }

    #[test]
    fn archive_urls_map_back() {
        assert_eq!(
            original_url("http://web.archive.org/web/19990125092817/http://example.com/a?b=1"),
            "http://example.com/a?b=1"
        );
        assert_eq!(
            original_url("http://web.archive.org/web/19990125092817im_/example.com/logo.gif"),
            "http://example.com/logo.gif"
        );
        assert_eq!(original_url("http://example.com/x"), "http://example.com/x");
    }

    #[test]
    fn raw_capture_url() {
        assert_eq!(
            raw_snapshot_url("http://web.archive.org/web/1999/http://example.com/", "1999"),
            "http://web.archive.org/web/1999id_/http://example.com/"
        );
    }

    #[tokio::test]
    async fn set_date_requires_nothing_but_the_form() {
        let fetcher = Arc::new(Archive {
            requests: StdMutex::new(Vec::new()),
        });
        let services = services(fetcher);
        let wayback = WaybackMachine::new();
        wayback.handle(&post("action=enable"), &services).await.unwrap();
        wayback
            .handle(&post("action=set+date&month=JAN&day=25&year=1999"), &services)
            .await
            .unwrap();
        assert_eq!(wayback.target_date().await.timestamp(), "19990125");
        let page = wayback.handle(&post("action=disable"), &services).await.unwrap();
        assert!(page.text_body().contains("wayback machine disabled"));
    }

    #[tokio::test]
    async fn captured_requests_get_snapshots() {
        let fetcher = Arc::new(Archive {
            requests: StdMutex::new(Vec::new()),
        });
        let services = services(fetcher.clone());
        let wayback = WaybackMachine::new();
        wayback.handle(&post("action=enable"), &services).await.unwrap();

        let ctx = RewriteContext::get("http://example.com/").unwrap();
        let response = wayback.handle(&ctx, &services).await.unwrap();
        assert_eq!(response.headers[TIMESTAMP_HEADER], "19990125092817");
        let body = response.text_body();
        assert!(body.contains(r#"href="http://example.com/news.html""#), "{body}");
        assert!(body.contains(r#"src="http://example.com/logo.gif""#), "{body}");

        let requests = fetcher.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].contains("/web/19990125092817id_/"));
    }

    #[tokio::test]
    async fn inactive_capture_is_not_found() {
        let fetcher = Arc::new(Archive {
            requests: StdMutex::new(Vec::new()),
        });
        let ctx = RewriteContext::get("http://example.com/").unwrap();
        let err = WaybackMachine::new().handle(&ctx, &services(fetcher)).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }
}
