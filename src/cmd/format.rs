/*!
format.rs

Response formatting utilities for the `tsu` CLI (human output paths).

Goals:
  - Decide a rendering mode from the declared content type and produce the
    text to display; callers decide whether/when to print.
  - JSON bodies are re-indented via `serde_json`; HTML/XML bodies go through
    a small std-only markup indenter; everything else passes through raw.
  - Content-type matching is deliberate substring search, case-sensitive,
    never full MIME parsing. An absent or empty content type is raw text and
    must not crash the check.

Public API Summary:
  - format_body(body, content_type, force_json) -> Result<String>
  - pretty_markup(input) -> String
  - status_line(code, reason) -> String
  - pretty_headers(&[(name, value)]) -> String

NOTE:
  - `force_json` rendering of a body that is not valid JSON is an error and
    is surfaced; it never silently falls back to raw output. A body whose
    content type merely claims JSON but fails to parse is passed through
    unchanged instead.
*/

use anyhow::{Context, Result, anyhow};

/* -------------------------------------------------------------------------- */
/* Body Formatting                                                            */
/* -------------------------------------------------------------------------- */

/// Render a response body according to its declared content type.
///
/// Rendering modes, in priority order:
/// 1. `force_json` or content type containing `application/json`: indented JSON.
/// 2. Content type containing `text/html` or `xml`: indented markup.
/// 3. Anything else (including no content type at all): raw passthrough.
pub fn format_body(body: &[u8], content_type: Option<&str>, force_json: bool) -> Result<String> {
    let text = String::from_utf8_lossy(body);
    let ct = content_type.unwrap_or("");

    if force_json || is_json_content(ct) {
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(value) => {
                return serde_json::to_string_pretty(&value).context("Failed to render JSON body");
            }
            Err(e) if force_json => {
                return Err(anyhow!(e).context("Body is not valid JSON (JSON output was requested)"));
            }
            // Content type claims JSON but the body does not parse: show it as-is.
            Err(_) => return Ok(text.into_owned()),
        }
    }

    if is_markup_content(ct) {
        return Ok(pretty_markup(&text));
    }

    Ok(text.into_owned())
}

fn is_json_content(content_type: &str) -> bool {
    content_type.contains("application/json")
}

fn is_markup_content(content_type: &str) -> bool {
    content_type.contains("text/html") || content_type.contains("xml")
}

/* -------------------------------------------------------------------------- */
/* Markup Indenter                                                            */
/* -------------------------------------------------------------------------- */

/// Re-indent XML/HTML with one tag or text run per line, 2-space indent.
///
/// This is a token-level indenter, not a parser: it does not validate
/// nesting and treats declarations, comments and `.../>` tags as flat lines.
pub fn pretty_markup(input: &str) -> String {
    const INDENT: &str = "  ";

    let mut lines: Vec<String> = Vec::new();
    let mut depth: usize = 0;
    let mut rest = input;

    while let Some(lt) = rest.find('<') {
        let text = rest[..lt].trim();
        if !text.is_empty() {
            lines.push(format!("{}{}", INDENT.repeat(depth), text));
        }

        let Some(gt) = rest[lt..].find('>') else {
            // Unterminated tag: dump the remainder untouched.
            let tail = rest[lt..].trim();
            if !tail.is_empty() {
                lines.push(format!("{}{}", INDENT.repeat(depth), tail));
            }
            return lines.join("\n");
        };

        let tag = &rest[lt..lt + gt + 1];
        let inner = &tag[1..tag.len() - 1];
        if inner.starts_with('/') {
            depth = depth.saturating_sub(1);
            lines.push(format!("{}{}", INDENT.repeat(depth), tag));
        } else if inner.ends_with('/') || inner.starts_with('?') || inner.starts_with('!') {
            lines.push(format!("{}{}", INDENT.repeat(depth), tag));
        } else {
            lines.push(format!("{}{}", INDENT.repeat(depth), tag));
            depth += 1;
        }

        rest = &rest[lt + gt + 1..];
    }

    let tail = rest.trim();
    if !tail.is_empty() {
        lines.push(format!("{}{}", INDENT.repeat(depth), tail));
    }

    lines.join("\n")
}

/* -------------------------------------------------------------------------- */
/* Status / Header Summaries                                                  */
/* -------------------------------------------------------------------------- */

/// `Status: <code> <reason phrase>` line for verbose / HEAD output.
pub fn status_line(code: u16, reason: &str) -> String {
    if reason.is_empty() {
        format!("Status: {code}")
    } else {
        format!("Status: {code} {reason}")
    }
}

/// Render response headers as an indented JSON object (sorted by name).
pub fn pretty_headers(headers: &[(String, String)]) -> String {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        map.insert(name.clone(), serde_json::Value::String(value.clone()));
    }
    let obj = serde_json::Value::Object(map);
    serde_json::to_string_pretty(&obj).unwrap_or_else(|_| obj.to_string())
}

/* -------------------------------------------------------------------------- */
/* Tests                                                                      */
/* -------------------------------------------------------------------------- */
