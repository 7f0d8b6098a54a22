//! `reddit.com` via `old.reddit.com`.
//!
//! Rebuilds pages from scratch instead of pruning them: listings become a
//! numbered list of title, author, age and comment count; post pages show
//! the title, submitter, preview and self text followed by the comment tree
//! as nested `<blockquote>`s.

use async_trait::async_trait;
use html_escape::{encode_double_quoted_attribute, encode_text};
use http::{Method, StatusCode};
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use super::pages::page;
use super::{Extension, ExtensionServices, RewriteContext};
use crate::content::GatewayResponse;
use crate::error::{GatewayError, Result};
use crate::http_client::UpstreamRequest;

const UPSTREAM: &str = "https://old.reddit.com";
const BROWSER_UA: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";

/// Replies nested deeper than this are summarized.
pub const MAX_COMMENT_DEPTH: usize = 6;

pub struct Reddit {
    domains: Vec<String>,
}

impl Reddit {
    pub fn new() -> Self {
        Self {
            domains: vec!["reddit.com".to_string()],
        }
    }
}

impl Default for Reddit {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extension for Reddit {
    fn name(&self) -> &str {
        "reddit"
    }

    fn domains(&self) -> &[String] {
        &self.domains
    }

    async fn handle(&self, ctx: &RewriteContext, services: &ExtensionServices) -> Result<GatewayResponse> {
        if ctx.method != Method::GET {
            return Err(GatewayError::MethodNotAllowed(ctx.method.clone()));
        }
        let url = format!("{UPSTREAM}{}", ctx.path_and_query());
        let request = UpstreamRequest::get(&url)
            .header("user-agent", BROWSER_UA)
            .header("accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header("accept-language", "en-US,en;q=0.5");
        let response = services.fetcher.fetch(request).await?.error_for_status()?;

        let html = render(&response.text(), &ctx.path);
        Ok(GatewayResponse::html(StatusCode::OK, html))
    }
}

fn first<'a>(el: ElementRef<'a>, selector: &str) -> Option<ElementRef<'a>> {
    let selector = Selector::parse(selector).ok()?;
    el.select(&selector).next()
}

fn has_class(el: &ElementRef<'_>, class: &str) -> bool {
    el.value().classes().any(|c| c == class)
}

fn child_elements<'a>(el: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    el.children().filter_map(ElementRef::wrap)
}

fn first_text(el: ElementRef<'_>, selector: &str) -> Option<String> {
    first(el, selector)
        .map(|e| e.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Build the page for `path` from an old.reddit.com document.
pub fn render(upstream_html: &str, path: &str) -> String {
    let doc = Html::parse_document(upstream_html);
    let root = doc.root_element();
    let title = first_text(root, "title").unwrap_or_else(|| "Reddit".to_string());

    let mut body = String::from("<font size=\"4\"><b>reddit</b>");
    if let Some(subreddit) = subreddit_of(path) {
        body.push_str(&format!(" | <span>r/{}</span>", encode_text(&subreddit.to_lowercase())));
    }
    body.push_str("</font>\n<hr>\n");

    if path.contains("/comments/") {
        render_post(root, &mut body);
    } else {
        render_listing(root, &mut body);
    }
    page(&title, &body)
}

fn subreddit_of(path: &str) -> Option<String> {
    let mut parts = path.trim_start_matches('/').split('/');
    match (parts.next(), parts.next()) {
        (Some("r"), Some(name)) if !name.is_empty() => Some(name.to_string()),
        _ => None,
    }
}

fn render_listing(root: ElementRef<'_>, out: &mut String) {
    out.push_str("<ol>\n");
    let Some(table) = first(root, "div#siteTable") else {
        out.push_str("</ol>\n");
        return;
    };
    for thing in child_elements(table).filter(|e| has_class(e, "thing")) {
        if has_class(&thing, "promoted") {
            continue;
        }
        let Some(title) = first(thing, "a.title") else {
            continue;
        };
        let permalink = thing.value().attr("data-permalink").unwrap_or_default();
        let target = title.value().attr("href").unwrap_or_default();
        if target.contains("alb.reddit.com") || permalink.starts_with("/user/") {
            continue;
        }
        let href = if permalink.is_empty() {
            target.to_string()
        } else {
            format!("http://reddit.com{permalink}")
        };
        let author = thing.value().attr("data-author").unwrap_or("Unknown");
        let time = first_text(thing, "time.live-timestamp").unwrap_or_else(|| "Unknown time".to_string());
        let comments = first_text(thing, "ul.buttons li.first a.comments");

        out.push_str(&format!(
            "<li><a href=\"{}\">{}</a><br>\n<font size=\"2\">{} | {}",
            encode_double_quoted_attribute(&href),
            encode_text(&title.text().collect::<String>()),
            encode_text(author),
            encode_text(&time),
        ));
        if let Some(comments) = comments {
            out.push_str(&format!(" | {}", encode_text(&comments)));
        }
        out.push_str("<br><br></font></li>\n");
    }
    out.push_str("</ol>\n");
}

fn render_post(root: ElementRef<'_>, out: &mut String) {
    out.push_str("<br>\n");
    let Some(thing) = first(root, "div#siteTable div.thing") else {
        return;
    };
    if let Some(title) = first_text(thing, "a.title") {
        out.push_str(&format!("<div><b>{}</b><br>\n", encode_text(&title)));
        if let Some(tagline) = first(thing, "p.tagline") {
            let time = first_text(tagline, "time.live-timestamp").unwrap_or_default();
            let author = first_text(tagline, "a.author").unwrap_or_else(|| "[deleted]".to_string());
            out.push_str(&format!(
                "submitted {} by <b>{}</b>\n",
                encode_text(&time),
                encode_text(&author)
            ));
        }
        if let Some(src) = first(root, "img.preview").and_then(|i| i.value().attr("src")) {
            out.push_str(&format!(
                "<br><br><img src=\"{}\" width=\"50\" height=\"40\">\n",
                encode_double_quoted_attribute(src)
            ));
        }
        if let Some(md) = first(thing, "div.usertext-body div.md") {
            out.push_str(&format!("<br>{}\n", md.inner_html()));
        }
        out.push_str("</div>\n");
    }

    let Some(area) = first(root, "div.commentarea") else {
        return;
    };
    let Some(table) = child_elements(area).find(|e| has_class(e, "sitetable")) else {
        return;
    };
    let comments = comment_things(table);
    debug!(top_level = comments.len(), "Rendering comment tree");
    if !comments.is_empty() {
        out.push_str("<hr>\n");
    }
    for comment in comments {
        render_comment(comment, 1, out);
    }
}

fn comment_things(table: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    child_elements(table)
        .filter(|e| has_class(e, "thing") && has_class(e, "comment"))
        .collect()
}

fn render_comment(thing: ElementRef<'_>, depth: usize, out: &mut String) {
    let Some(entry) = child_elements(thing).find(|e| has_class(e, "entry")) else {
        return;
    };
    let author = first_text(entry, "p.tagline a.author")
        .or_else(|| thing.value().attr("data-author").map(str::to_string))
        .unwrap_or_else(|| "[deleted]".to_string());
    let time = first_text(entry, "p.tagline time").unwrap_or_default();
    let text = first(entry, "div.usertext-body div.md")
        .map(|md| md.inner_html())
        .unwrap_or_default();

    out.push_str(&format!(
        "<blockquote><b>{}</b> <font size=\"2\">{}</font><br>\n{}\n",
        encode_text(&author),
        encode_text(&time),
        text.trim()
    ));

    let replies: Vec<ElementRef<'_>> = child_elements(thing)
        .find(|e| has_class(e, "child"))
        .and_then(|child| child_elements(child).find(|e| has_class(e, "sitetable")))
        .map(comment_things)
        .unwrap_or_default();
    if depth >= MAX_COMMENT_DEPTH {
        if !replies.is_empty() {
            out.push_str(&format!("<font size=\"2\">({} more replies)</font>\n", replies.len()));
        }
    } else {
        for reply in replies {
            render_comment(reply, depth + 1, out);
        }
    }
    out.push_str("</blockquote>\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<html><head><title>retrocomputing</title></head><body>
<div id="siteTable" class="sitetable linklisting">
  <div class="thing link" id="thing_t3_a" data-author="woz" data-permalink="/r/retrocomputing/comments/a/apple_i/">
    <a class="title" href="https://www.reddit.com/r/retrocomputing/comments/a/apple_i/">Apple I found</a>
    <time class="live-timestamp">3 hours ago</time>
    <ul class="buttons"><li class="first"><a class="comments">42 comments</a></li></ul>
  </div>
  <div class="thing link promoted" id="thing_t3_b" data-author="ads" data-permalink="/r/x/comments/b/">
    <a class="title" href="https://alb.reddit.com/c">Buy now</a>
  </div>
  <div class="thing link" id="thing_t3_c" data-author="someone" data-permalink="/user/someone/comments/c/">
    <a class="title" href="/user/someone/">Profile post</a>
  </div>
</div></body></html>"#;

    const POST: &str = r#"<html><head><title>Apple I found : retrocomputing</title></head><body>
<div id="siteTable"><div class="thing link" id="thing_t3_a">
  <div class="top-matter"><a class="title" href="/x">Apple I found</a>
    <p class="tagline">submitted <time class="live-timestamp">3 hours ago</time> by <a class="author">woz</a></p></div>
  <div class="usertext-body"><div class="md"><p>In a garage.</p></div></div>
</div></div>
<div class="commentarea"><div class="sitetable nestedlisting">
  <div class="thing comment" data-author="jobs">
    <div class="entry"><p class="tagline"><a class="author">jobs</a> <time>2 hours ago</time></p>
      <div class="usertext-body"><div class="md"><p>Nice &amp; rare</p></div></div></div>
    <div class="child"><div class="sitetable listing">
      <div class="thing comment" data-author="woz">
        <div class="entry"><p class="tagline"><a class="author">woz</a></p>
          <div class="usertext-body"><div class="md"><p>Thanks</p></div></div></div>
      </div>
    </div></div>
  </div>
  <div class="thing comment" data-author="hertzfeld">
    <div class="entry"><p class="tagline"><a class="author">hertzfeld</a></p>
      <div class="usertext-body"><div class="md"><p>Second</p></div></div></div>
  </div>
</div></div></body></html>"#;

    #[test]
    fn listing_is_numbered_and_filtered() {
        let html = render(LISTING, "/r/RetroComputing/");
        assert!(html.contains("<span>r/retrocomputing</span>"));
        assert!(html.contains(r#"<a href="http://reddit.com/r/retrocomputing/comments/a/apple_i/">Apple I found</a>"#));
        assert!(html.contains("woz | 3 hours ago | 42 comments"));
        assert!(!html.contains("Buy now"));
        assert!(!html.contains("Profile post"));
        assert_eq!(html.matches("<li>").count(), 1);
    }

    #[test]
    fn comments_nest_as_blockquotes() {
        let html = render(POST, "/r/retrocomputing/comments/a/apple_i/");
        assert!(html.contains("<b>Apple I found</b>"));
        assert!(html.contains("submitted 3 hours ago by <b>woz</b>"));
        assert!(html.contains("<p>In a garage.</p>"));

        let jobs = html.find("<b>jobs</b>").unwrap();
        let reply = html.find("<p>Thanks</p>").unwrap();
        let second = html.find("<b>hertzfeld</b>").unwrap();
        assert!(jobs < reply && reply < second);
        // The reply's quote closes before its parent's, then the sibling opens.
        let between = &html[reply..second];
        assert_eq!(between.matches("</blockquote>").count(), 2);
        assert_eq!(html.matches("<blockquote>").count(), 3);
    }

    #[test]
    fn front_page_has_no_subreddit() {
        assert_eq!(subreddit_of("/"), None);
        assert_eq!(subreddit_of("/r/rust/top/"), Some("rust".to_string()));
    }
}
