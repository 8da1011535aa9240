use std::borrow::Cow;

use super::{
    host::{HostMatcher, PathGate},
    Splicer,
};

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b >= 0x80
}

/// Index just past the string literal opened by the quote at `open`, or `None`
/// when the literal never closes.
fn skip_string(css: &[u8], open: usize) -> Option<usize> {
    let quote = css[open];
    let mut i = open + 1;

    while i < css.len() {
        match css[i] {
            b'\\' => i += 2,
            b if b == quote => return Some(i + 1),
            b'\n' => return Some(i),
            _ => i += 1,
        }
    }

    None
}

fn skip_whitespace(css: &[u8], mut i: usize) -> usize {
    while i < css.len() && css[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// The URL payload of a `url(` call whose arguments start at `args`: the value's
/// byte range and the index just past the closing `)`.
fn url_argument(css: &[u8], args: usize) -> Option<(usize, usize, usize)> {
    let start = skip_whitespace(css, args);

    match css.get(start)? {
        b'"' | b'\'' => {
            let end = skip_string(css, start)?;
            if css.get(end - 1) != css.get(start) || end - 1 == start {
                return None;
            }
            let close = skip_whitespace(css, end);
            (css.get(close) == Some(&b')')).then_some((start + 1, end - 1, close + 1))
        }
        _ => {
            let close = start + css[start..].iter().position(|&b| b == b')')?;
            let mut end = close;
            while end > start && css[end - 1].is_ascii_whitespace() {
                end -= 1;
            }
            let value = &css[start..end];
            if value
                .iter()
                .any(|&b| b.is_ascii_whitespace() || matches!(b, b'"' | b'\'' | b'('))
            {
                return None;
            }
            Some((start, end, close + 1))
        }
    }
}

/// Rewrites the host of every `url(...)` reference on the source domain.
/// Comments, string literals and everything else are copied unchanged; an
/// unterminated comment or string stops the scan and the rest is kept verbatim.
pub fn rewrite_css<'a>(css: &'a [u8], matcher: &HostMatcher) -> Cow<'a, [u8]> {
    let mut out = Splicer::new(css);
    let mut i = 0;

    while i < css.len() {
        match css[i] {
            b'/' if css.get(i + 1) == Some(&b'*') => {
                match css[i + 2..].windows(2).position(|w| w == b"*/") {
                    Some(end) => i += 2 + end + 2,
                    None => break,
                }
            }
            b'"' | b'\'' => match skip_string(css, i) {
                Some(end) => i = end,
                None => break,
            },
            b'\\' => i += 2,
            b'u' | b'U'
                if css.len() - i >= 4
                    && css[i..i + 4].eq_ignore_ascii_case(b"url(")
                    && (i == 0 || !is_ident_byte(css[i - 1])) =>
            {
                let args = i + 4;
                let Some((start, end, after)) = url_argument(css, args) else {
                    i = args;
                    continue;
                };

                if let Some(rewritten) = matcher.rewrite_if_matches(&css[start..end], PathGate::Any) {
                    out.replace(start, end - start, &rewritten);
                }

                i = after;
            }
            _ => i += 1,
        }
    }

    out.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewrite::host::Domain;

    fn matcher() -> HostMatcher {
        HostMatcher::new(
            Domain::parse("www.some-domain.com").unwrap(),
            Domain::parse("wp.some-domain.com").unwrap(),
        )
        .unwrap()
    }

    fn rewrite(css: &str) -> String {
        String::from_utf8(rewrite_css(css.as_bytes(), &matcher()).into_owned()).unwrap()
    }

    // ============================================
    // url() detection tests
    // ============================================

    #[test]
    fn test_double_quoted_url() {
        assert_eq!(
            rewrite(r#"body { background: url("https://www.some-domain.com/wp-includes/css/bg.png"); }"#),
            r#"body { background: url("https://wp.some-domain.com/wp-includes/css/bg.png"); }"#
        );
    }

    #[test]
    fn test_single_quoted_url() {
        assert_eq!(
            rewrite("a{background:url('https://www.some-domain.com/img/a.png')}"),
            "a{background:url('https://wp.some-domain.com/img/a.png')}"
        );
    }

    #[test]
    fn test_unquoted_url_with_padding() {
        assert_eq!(
            rewrite("a{background:url(  https://www.some-domain.com/a.png  )}"),
            "a{background:url(  https://wp.some-domain.com/a.png  )}"
        );
    }

    #[test]
    fn test_uppercase_function_name() {
        assert_eq!(
            rewrite("a{background:URL(https://www.some-domain.com/a.png)}"),
            "a{background:URL(https://wp.some-domain.com/a.png)}"
        );
    }

    #[test]
    fn test_multiple_urls_in_font_face() {
        let css = "@font-face{src:url(https://www.some-domain.com/f.woff2) format('woff2'),\
                   url('https://www.some-domain.com/f.woff') format('woff')}";
        let expected = "@font-face{src:url(https://wp.some-domain.com/f.woff2) format('woff2'),\
                        url('https://wp.some-domain.com/f.woff') format('woff')}";
        assert_eq!(rewrite(css), expected);
    }

    #[test]
    fn test_other_hosts_and_relative_urls_untouched() {
        let css = "a{background:url(/wp-content/a.png)} b{background:url(https://cdn.example.com/b.png)}";
        assert!(matches!(rewrite_css(css.as_bytes(), &matcher()), Cow::Borrowed(_)));
    }

    // ============================================
    // Non-url content tests
    // ============================================

    #[test]
    fn test_comment_is_skipped() {
        let css = "/* url(https://www.some-domain.com/a.png) */ a{}";
        assert_eq!(rewrite(css), css);
    }

    #[test]
    fn test_string_literal_is_skipped() {
        let css = r#"a::after{content:"url(https://www.some-domain.com/a.png)"}"#;
        assert_eq!(rewrite(css), css);
    }

    #[test]
    fn test_identifier_ending_in_url_is_not_a_function() {
        let css = "a{background:myurl(https://www.some-domain.com/a.png)}";
        assert_eq!(rewrite(css), css);
    }

    #[test]
    fn test_unterminated_comment_stops_scan() {
        let css = "a{background:url(https://www.some-domain.com/a.png)} /* open url(https://www.some-domain.com/b.png)";
        assert_eq!(
            rewrite(css),
            "a{background:url(https://wp.some-domain.com/a.png)} /* open url(https://www.some-domain.com/b.png)"
        );
    }

    #[test]
    fn test_unclosed_url_is_left_alone() {
        let css = "a{background:url(https://www.some-domain.com/a.png";
        assert_eq!(rewrite(css), css);
    }

    #[test]
    fn test_mismatched_quotes_are_left_alone() {
        let css = r#"a{background:url("https://www.some-domain.com/a.png')}"#;
        assert_eq!(rewrite(css), css);
    }
}
