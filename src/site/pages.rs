//! Small HTML pages the gateway renders itself: control pages and errors.
//!
//! Kept to HTML 3.2 so every client the gateway targets can show them.

use html_escape::{encode_double_quoted_attribute, encode_text};
use http::StatusCode;

use crate::content::GatewayResponse;
use crate::error::GatewayError;

/// A complete page around `body`, which must already be markup.
pub fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE HTML PUBLIC \"-//W3C//DTD HTML 3.2 Final//EN\">\n<html>\n<head>\n<title>{}</title>\n</head>\n<body>\n{body}\n</body>\n</html>\n",
        encode_text(title)
    )
}

/// Error page for a failed request. Routing errors are answered in plain text.
pub fn error_response(err: &GatewayError) -> GatewayResponse {
    let status = err.status();
    if err.is_plain_text() {
        return GatewayResponse::text(status, err.to_string());
    }
    let body = format!(
        "<h1>{}</h1>\n<p>{}</p>",
        status.canonical_reason().unwrap_or("Error"),
        encode_text(&err.to_string())
    );
    GatewayResponse::html(status, page("Error", &body))
}

/// `<select>` with one option per `(value, label)` pair.
pub fn select(name: &str, options: &[(String, String)], selected: &str) -> String {
    let mut out = format!("<select name=\"{}\">", encode_double_quoted_attribute(name));
    for (value, label) in options {
        let mark = if value == selected { " selected" } else { "" };
        out.push_str(&format!(
            "<option value=\"{}\"{mark}>{}</option>",
            encode_double_quoted_attribute(value),
            encode_text(label)
        ));
    }
    out.push_str("</select>");
    out
}

/// Submit button posting `action=<value>`.
pub fn action_button(value: &str) -> String {
    format!(
        "<input type=\"submit\" name=\"action\" value=\"{}\">",
        encode_double_quoted_attribute(value)
    )
}

/// Centered control page in the style shared by the mode extensions: a
/// banner, a POST form with `controls`, and a status paragraph.
pub fn control_page(title: &str, banner: &str, active: bool, controls: &str, status: &str) -> GatewayResponse {
    let spacer = if active { "" } else { "<br>" };
    let body = format!(
        "<center>{spacer}\n<font size=\"7\"><h4>{banner}</h4></font>\n<form method=\"post\">\n{controls}\n</form>\n<p>{status}</p>\n</center>"
    );
    GatewayResponse::html(StatusCode::OK, page(title, &body))
}
