use std::{borrow::Cow, sync::Arc};

use log::{debug, trace};

pub mod css;
pub mod error;
pub mod host;
pub mod rules;
pub mod tokenizer;

use error::Result;
use host::{Domain, HostMatcher};
use rules::{EditorRegion, RewriteDecision, RuleTable};
use tokenizer::{AttrValue, Token, Tokenizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    Css,
    Other,
}

impl ContentKind {
    /// Classifies a `Content-Type` header value; parameters and case are ignored.
    pub fn from_content_type(content_type: &str) -> Self {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            "text/html" | "application/xhtml+xml" => ContentKind::Html,
            "text/css" => ContentKind::Css,
            _ => ContentKind::Other,
        }
    }

    pub fn is_rewritable(self) -> bool {
        self != ContentKind::Other
    }
}

/// Copies `input` into a fresh buffer only once the first replacement happens.
/// Replacements must be made in increasing, non-overlapping order.
pub(crate) struct Splicer<'a> {
    input: &'a [u8],
    out: Option<Vec<u8>>,
    written: usize,
    replacements: usize,
}

impl<'a> Splicer<'a> {
    pub(crate) fn new(input: &'a [u8]) -> Self {
        Splicer {
            input,
            out: None,
            written: 0,
            replacements: 0,
        }
    }

    pub(crate) fn replace(&mut self, offset: usize, len: usize, with: &[u8]) {
        let input = self.input;
        let out = self
            .out
            .get_or_insert_with(|| Vec::with_capacity(input.len() + 64));

        out.extend_from_slice(&input[self.written..offset]);
        out.extend_from_slice(with);
        self.written = offset + len;
        self.replacements += 1;
    }

    pub(crate) fn replacements(&self) -> usize {
        self.replacements
    }

    pub(crate) fn finish(self) -> Cow<'a, [u8]> {
        match self.out {
            Some(mut out) => {
                out.extend_from_slice(&self.input[self.written..]);
                Cow::Owned(out)
            }
            None => Cow::Borrowed(self.input),
        }
    }
}

/// Rewrites asset URLs in HTML and CSS bodies from the source to the target
/// domain. Each call is an independent, single pass over the body; the engine
/// itself holds no per-request state and can be shared between threads.
#[derive(Debug, Clone)]
pub struct RewriteEngine {
    matcher: HostMatcher,
    rules: Arc<RuleTable>,
}

impl RewriteEngine {
    pub fn new(source: Domain, target: Domain, rules: Arc<RuleTable>) -> Result<Self> {
        Ok(RewriteEngine {
            matcher: HostMatcher::new(source, target)?,
            rules,
        })
    }

    pub fn matcher(&self) -> &HostMatcher {
        &self.matcher
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Returns `body` borrowed whenever nothing needs to change, in particular
    /// for every content type other than HTML and CSS.
    pub fn rewrite<'a>(&self, body: &'a [u8], content_type: &str) -> Cow<'a, [u8]> {
        let kind = ContentKind::from_content_type(content_type);

        if !kind.is_rewritable() || !self.matcher.mentions_source(body) {
            return Cow::Borrowed(body);
        }

        match kind {
            ContentKind::Html => self.rewrite_html(body),
            ContentKind::Css => css::rewrite_css(body, &self.matcher),
            ContentKind::Other => Cow::Borrowed(body),
        }
    }

    fn rewrite_value(&self, out: &mut Splicer<'_>, value: &AttrValue<'_>, decision: RewriteDecision<'_>) {
        let rewritten = match decision {
            RewriteDecision::Rewrite(gate) => self.matcher.rewrite_if_matches(value.raw, gate),
            RewriteDecision::CssScan => match css::rewrite_css(value.raw, &self.matcher) {
                Cow::Owned(css) => Some(css),
                Cow::Borrowed(_) => None,
            },
            RewriteDecision::Passthrough => None,
        };

        if let Some(rewritten) = rewritten {
            out.replace(value.offset, value.raw.len(), &rewritten);
        }
    }

    fn rewrite_html<'a>(&self, html: &'a [u8]) -> Cow<'a, [u8]> {
        let mut out = Splicer::new(html);
        let mut editor = EditorRegion::default();

        for token in Tokenizer::new(html, self.rules.style_elements()) {
            match token {
                Token::StartTag(tag) => {
                    let name = tag.lowercase_name();
                    if editor.on_start_tag(&name, &tag) {
                        continue;
                    }

                    for attr in &tag.attributes {
                        if let Some(value) = &attr.value {
                            let decision = self.rules.decide(&tag, &name, attr);
                            self.rewrite_value(&mut out, value, decision);
                        }
                    }
                }
                Token::EndTag { name } => {
                    editor.on_end_tag(&String::from_utf8_lossy(name).to_ascii_lowercase());
                }
                Token::RawCssBlock { css, offset } if !editor.is_active() => {
                    if let Cow::Owned(rewritten) = css::rewrite_css(css, &self.matcher) {
                        out.replace(offset, css.len(), &rewritten);
                    }
                }
                Token::Malformed { bytes, cause } => {
                    debug!(target: "assetproxy", "{}; passing {} trailing bytes through", cause, bytes.len());
                }
                _ => {}
            }
        }

        trace!(target: "assetproxy", "Rewrote {} value(s) in {} bytes of HTML", out.replacements(), html.len());

        out.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = "www.some-domain.com";
    const TGT: &str = "wp.some-domain.com";

    fn engine() -> RewriteEngine {
        RewriteEngine::new(
            Domain::parse(SRC).unwrap(),
            Domain::parse(TGT).unwrap(),
            Arc::new(RuleTable::default()),
        )
        .unwrap()
    }

    fn rewrite_html(html: &str) -> String {
        String::from_utf8(engine().rewrite(html.as_bytes(), "text/html").into_owned()).unwrap()
    }

    fn assert_untouched(html: &str) {
        assert_eq!(rewrite_html(html), html);
    }

    const FRONTEND: &str = r#"<html>
      <head>
        <title>wp-frontend</title>
        <link rel="stylesheet" href="https://www.some-domain.com/wp-content/themes/style.css">
        <link rel="canonical" href="https://www.some-domain.com/" />
      </head>
      <body>
        <script src="https://www.some-domain.com/wp-includes/js/script.js"></script>
        <img src="https://www.some-domain.com/wp-content/uploads/image.jpg" />
        <a href="https://www.some-domain.com/about">about us</a>
      </body>
    </html>"#;

    const ADMIN: &str = r#"<html>
        <head>
          <title>wp-admin</title>
          <link rel="stylesheet" href="https://www.some-domain.com/wp-includes/css/admin.css">
        </head>
        <body>
          <a href="https://www.some-domain.com/wp-admin/">admin dashboard</a>
          <img src="https://www.some-domain.com/wp-content/uploads/logo.png" />
          <form>
            <input type="text"
              placeholder="https://www.some-domain.com/example"
              value="https://www.some-domain.com/page"
              defaultValue="https://www.some-domain.com/default"
            />
          </form>
        </body>
      </html>"#;

    // ============================================
    // Content type tests
    // ============================================

    #[test]
    fn test_content_kind() {
        assert_eq!(ContentKind::from_content_type("text/html"), ContentKind::Html);
        assert_eq!(ContentKind::from_content_type("Text/HTML; charset=UTF-8"), ContentKind::Html);
        assert_eq!(ContentKind::from_content_type("application/xhtml+xml"), ContentKind::Html);
        assert_eq!(ContentKind::from_content_type("text/css;charset=utf-8"), ContentKind::Css);
        assert_eq!(ContentKind::from_content_type("application/json"), ContentKind::Other);
        assert_eq!(ContentKind::from_content_type(""), ContentKind::Other);
    }

    #[test]
    fn test_json_is_never_touched() {
        let json = br#"{"message":"response from /wp-json/custom/v1","data":{"attribute":"value","url":"https://www.some-domain.com/wp-json/custom/v1"}}"#;
        let out = engine().rewrite(json, "application/json");
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(&*out, &json[..]);
    }

    #[test]
    fn test_html_looking_json_is_never_touched() {
        let json = br#"{"html":"<script src=\"https://www.some-domain.com/wp-includes/a.js\"></script>"}"#;
        assert_eq!(&*engine().rewrite(json, "application/json"), &json[..]);
    }

    #[test]
    fn test_css_body() {
        let css = b"body{background:url('https://www.some-domain.com/wp-content/bg.png')}";
        assert_eq!(
            &*engine().rewrite(css, "text/css"),
            &b"body{background:url('https://wp.some-domain.com/wp-content/bg.png')}"[..]
        );
    }

    // ============================================
    // Selective rewrite tests
    // ============================================

    #[test]
    fn test_frontend_page() {
        let out = rewrite_html(FRONTEND);

        assert!(out.contains(r#"<link rel="stylesheet" href="https://wp.some-domain.com/wp-content/themes/style.css">"#));
        assert!(out.contains(r#"<link rel="canonical" href="https://www.some-domain.com/" />"#));
        assert!(out.contains(r#"<script src="https://wp.some-domain.com/wp-includes/js/script.js"></script>"#));
        assert!(out.contains(r#"<img src="https://wp.some-domain.com/wp-content/uploads/image.jpg" />"#));
        assert!(out.contains(r#"<a href="https://www.some-domain.com/about">about us</a>"#));
    }

    #[test]
    fn test_admin_page() {
        let out = rewrite_html(ADMIN);

        assert!(out.contains(r#"<link rel="stylesheet" href="https://wp.some-domain.com/wp-includes/css/admin.css">"#));
        assert!(out.contains(r#"<img src="https://wp.some-domain.com/wp-content/uploads/logo.png" />"#));
        assert!(out.contains(r#"<a href="https://www.some-domain.com/wp-admin/">admin dashboard</a>"#));
        assert!(out.contains(r#"placeholder="https://www.some-domain.com/example""#));
        assert!(out.contains(r#"value="https://www.some-domain.com/page""#));
        assert!(out.contains(r#"defaultValue="https://www.some-domain.com/default""#));
    }

    #[test]
    fn test_only_values_change() {
        let out = rewrite_html(FRONTEND);
        let delta = (SRC.len() - TGT.len()) * 3;
        assert_eq!(out.len(), FRONTEND.len() - delta);
    }

    #[test]
    fn test_quote_style_preserved() {
        assert_eq!(
            rewrite_html("<img src='https://www.some-domain.com/wp-content/a.png'>"),
            "<img src='https://wp.some-domain.com/wp-content/a.png'>"
        );
        assert_eq!(
            rewrite_html("<img  alt=x   src=https://www.some-domain.com/wp-content/a.png >"),
            "<img  alt=x   src=https://wp.some-domain.com/wp-content/a.png >"
        );
    }

    #[test]
    fn test_path_gate() {
        assert_eq!(
            rewrite_html(r#"<meta property="og:image" content="https://www.some-domain.com/wp-content/x.png">"#),
            r#"<meta property="og:image" content="https://wp.some-domain.com/wp-content/x.png">"#
        );
        assert_untouched(r#"<meta property="og:image" content="https://www.some-domain.com/wp-includes/x.png">"#);
        assert_untouched(r#"<meta property="og:url" content="https://www.some-domain.com/page">"#);
        assert_untouched(r#"<script src="https://www.some-domain.com/app.js"></script>"#);
    }

    #[test]
    fn test_style_element_and_attribute() {
        assert_eq!(
            rewrite_html(r#"<style>body { background: url("https://www.some-domain.com/wp-includes/css/bg.png") }</style>"#),
            r#"<style>body { background: url("https://wp.some-domain.com/wp-includes/css/bg.png") }</style>"#
        );
        assert_eq!(
            rewrite_html(r#"<div style="background:url('https://www.some-domain.com/about/hero.jpg')">"#),
            r#"<div style="background:url('https://wp.some-domain.com/about/hero.jpg')">"#
        );
    }

    // ============================================
    // Non-interference tests
    // ============================================

    #[test]
    fn test_navigation_and_forms_untouched() {
        assert_untouched(r#"<link rel="canonical" href="https://www.some-domain.com/page">"#);
        assert_untouched(r#"<a href="https://www.some-domain.com/about">about</a>"#);
        assert_untouched(r#"<input value="https://www.some-domain.com/page">"#);
        assert_untouched(r#"<form action="https://www.some-domain.com/submit"></form>"#);
        assert_untouched(r#"<meta name="twitter:domain" content="https://www.some-domain.com/wp-content/">"#);
        assert_untouched(r#"<button data-href="https://www.some-domain.com/wp-content/a.pdf">go</button>"#);
    }

    #[test]
    fn test_custom_element_untouched() {
        assert_untouched(r#"<ppn-cta call-href="https://www.some-domain.com/action"></ppn-cta>"#);
        assert_untouched(
            r#"<ppn-editor><img src="https://www.some-domain.com/wp-content/a.png"><ppn-cta style="background:url(https://www.some-domain.com/wp-content/b.png)"></ppn-cta></ppn-editor>"#,
        );
    }

    #[test]
    fn test_editor_region_ends_at_matching_tag() {
        let html = r#"<div contenteditable="true"><div><img src="https://www.some-domain.com/wp-content/a.png"></div></div><img src="https://www.some-domain.com/wp-content/b.png">"#;
        let expected = r#"<div contenteditable="true"><div><img src="https://www.some-domain.com/wp-content/a.png"></div></div><img src="https://wp.some-domain.com/wp-content/b.png">"#;
        assert_eq!(rewrite_html(html), expected);
    }

    #[test]
    fn test_lazy_loaded_image_keeps_data_attribute() {
        assert_eq!(
            rewrite_html(
                r#"<img data-src="https://www.some-domain.com/wp-content/a.jpg" src="https://www.some-domain.com/wp-content/a.jpg">"#
            ),
            r#"<img data-src="https://www.some-domain.com/wp-content/a.jpg" src="https://wp.some-domain.com/wp-content/a.jpg">"#
        );
        assert_eq!(
            rewrite_html(
                r#"<img data-lazy-src="https://www.some-domain.com/wp-content/b.png" src="https://www.some-domain.com/wp-content/b.png" />"#
            ),
            r#"<img data-lazy-src="https://www.some-domain.com/wp-content/b.png" src="https://wp.some-domain.com/wp-content/b.png" />"#
        );
    }

    #[test]
    fn test_commented_css_url_untouched() {
        assert_eq!(
            rewrite_html(
                r#"<div style="/* url(https://www.some-domain.com/wp-content/a.png) */ background:url(https://www.some-domain.com/wp-content/b.png)">"#
            ),
            r#"<div style="/* url(https://www.some-domain.com/wp-content/a.png) */ background:url(https://wp.some-domain.com/wp-content/b.png)">"#
        );
        assert_eq!(
            rewrite_html(
                "<style>/* a{background:url('https://www.some-domain.com/wp-content/a.png')} */\nb{background:url('https://www.some-domain.com/wp-content/b.png')}</style>"
            ),
            "<style>/* a{background:url('https://www.some-domain.com/wp-content/a.png')} */\nb{background:url('https://wp.some-domain.com/wp-content/b.png')}</style>"
        );
    }

    #[test]
    fn test_text_comments_and_scripts_untouched() {
        assert_untouched("<p>Visit https://www.some-domain.com/wp-content/a.png or www.some-domain.com</p>");
        assert_untouched(r#"<!-- <img src="https://www.some-domain.com/wp-content/a.png"> -->"#);
        assert_untouched(r#"<script>var u = "https://www.some-domain.com/wp-content/a.js";</script>"#);
        assert_untouched(r#"<textarea><img src="https://www.some-domain.com/wp-content/a.png"></textarea>"#);
    }

    #[test]
    fn test_lookalike_hosts_untouched() {
        assert_untouched(r#"<img src="https://not-www.some-domain.com/wp-content/a.png">"#);
        assert_untouched(r#"<img src="https://wp.some-domain.com/wp-content/a.png">"#);
        assert_untouched(r#"<img src="/wp-content/a.png" alt="www.some-domain.com">"#);
    }

    #[test]
    fn test_no_source_domain_round_trips() {
        let html = "<html><body><img src='https://cdn.example.com/wp-content/a.png'></body></html>";
        let out = engine().rewrite(html.as_bytes(), "text/html");
        assert!(matches!(out, Cow::Borrowed(_)));
    }

    // ============================================
    // Idempotence and failure policy tests
    // ============================================

    #[test]
    fn test_idempotent() {
        for page in [FRONTEND, ADMIN] {
            let once = rewrite_html(page);
            let twice = rewrite_html(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn test_malformed_tail_is_kept_verbatim() {
        let html = r#"<img src="https://www.some-domain.com/wp-content/a.png"><img src="https://www.some-domain.com/wp-content/b.png"#;
        let expected = r#"<img src="https://wp.some-domain.com/wp-content/a.png"><img src="https://www.some-domain.com/wp-content/b.png"#;
        assert_eq!(rewrite_html(html), expected);
    }

    #[test]
    fn test_unterminated_style_is_kept_verbatim() {
        assert_untouched(r#"<style>a{background:url(https://www.some-domain.com/wp-content/a.png)}"#);
    }

    #[test]
    fn test_non_utf8_body() {
        let mut html = b"<p>\xe9t\xe9</p><img src=\"https://www.some-domain.com/wp-content/a.png\">".to_vec();
        let out = engine().rewrite(&html, "text/html; charset=iso-8859-1").into_owned();
        let host = html.windows(SRC.len()).position(|w| w == SRC.as_bytes()).unwrap();
        html.splice(host..host + SRC.len(), TGT.bytes());
        assert_eq!(out, html);
    }

    #[test]
    fn test_independent_engines() {
        let other = RewriteEngine::new(
            Domain::parse("shop.example.com").unwrap(),
            Domain::parse("origin.example.com").unwrap(),
            Arc::new(RuleTable::default()),
        )
        .unwrap();

        let html = r#"<img src="https://www.some-domain.com/wp-content/a.png">"#;
        assert_eq!(&*other.rewrite(html.as_bytes(), "text/html"), html.as_bytes());
    }
}
