//! Lexer-level HTML scanner.
//!
//! Walks a byte buffer once and yields structural tokens that borrow from the
//! input. No tree is built: the only state kept between tokens is whether the
//! previous start tag opened a raw-text element (`<style>`, `<script>`, ...).
//! Anything the scanner cannot delimit with confidence is yielded as a single
//! [`Token::Malformed`] covering the rest of the buffer, after which the
//! iterator ends.

use super::error::RewriteError;

/// Elements whose content is opaque text rather than markup.
const RAW_TEXT_ELEMENTS: &[&str] = &[
    "script", "textarea", "title", "xmp", "iframe", "noembed", "noframes",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quote {
    Double,
    Single,
    Unquoted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrValue<'a> {
    /// The value without its quotes, exactly as written.
    pub raw: &'a [u8],
    /// Offset of `raw` in the tokenized buffer.
    pub offset: usize,
    pub quote: Quote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute<'a> {
    pub name: &'a [u8],
    pub value: Option<AttrValue<'a>>,
}

impl Attribute<'_> {
    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name.as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartTag<'a> {
    pub name: &'a [u8],
    pub attributes: Vec<Attribute<'a>>,
    pub self_closing: bool,
}

impl<'a> StartTag<'a> {
    pub fn lowercase_name(&self) -> String {
        String::from_utf8_lossy(self.name).to_ascii_lowercase()
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute<'a>> {
        self.attributes.iter().find(|attr| attr.is_named(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token<'a> {
    StartTag(StartTag<'a>),
    EndTag { name: &'a [u8] },
    Text(&'a [u8]),
    Comment(&'a [u8]),
    /// `<!DOCTYPE ...>`, `<![CDATA[...]]>`, `<?...>` and other `<!` constructs.
    Declaration(&'a [u8]),
    /// Body of a CSS-bearing element such as `<style>`.
    RawCssBlock { css: &'a [u8], offset: usize },
    /// Body of any other raw-text element.
    RawText(&'a [u8]),
    /// Unparseable tail of the buffer.
    Malformed { bytes: &'a [u8], cause: RewriteError },
}

fn is_tag_name_byte(b: u8) -> bool {
    !b.is_ascii_whitespace() && b != b'/' && b != b'>'
}

fn is_attr_name_end(b: u8) -> bool {
    b.is_ascii_whitespace() || matches!(b, b'/' | b'>' | b'=')
}

fn find(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| from + i)
}

enum RawMode {
    Css,
    Text,
}

pub struct Tokenizer<'a, 'r> {
    input: &'a [u8],
    pos: usize,
    css_elements: &'r [String],
    raw: Option<(&'a [u8], RawMode)>,
    done: bool,
}

impl<'a, 'r> Tokenizer<'a, 'r> {
    /// `css_elements` are the (lowercase) element names whose body is CSS.
    pub fn new(input: &'a [u8], css_elements: &'r [String]) -> Self {
        Tokenizer {
            input,
            pos: 0,
            css_elements,
            raw: None,
            done: false,
        }
    }

    fn malformed(&mut self, reason: &'static str) -> Token<'a> {
        let offset = self.pos;
        self.pos = self.input.len();
        self.done = true;

        Token::Malformed {
            bytes: &self.input[offset..],
            cause: RewriteError::MalformedMarkup { offset, reason },
        }
    }

    fn skip_whitespace(&self, mut i: usize) -> usize {
        while i < self.input.len() && self.input[i].is_ascii_whitespace() {
            i += 1;
        }
        i
    }

    fn text(&mut self, from: usize) -> Token<'a> {
        let start = self.pos;
        let end = self.input[from..]
            .iter()
            .position(|&b| b == b'<')
            .map_or(self.input.len(), |i| from + i);
        self.pos = end;
        Token::Text(&self.input[start..end])
    }

    fn delimited(&mut self, from: usize, terminator: &[u8]) -> Option<&'a [u8]> {
        let end = find(self.input, from, terminator)? + terminator.len();
        let bytes = &self.input[self.pos..end];
        self.pos = end;
        Some(bytes)
    }

    fn comment(&mut self) -> Token<'a> {
        match self.delimited(self.pos + 2, b"-->") {
            Some(bytes) => Token::Comment(bytes),
            None => self.malformed("unterminated comment"),
        }
    }

    fn declaration(&mut self) -> Token<'a> {
        let terminator: &[u8] = if self.input[self.pos..].starts_with(b"<![CDATA[") {
            b"]]>"
        } else {
            b">"
        };

        match self.delimited(self.pos + 2, terminator) {
            Some(bytes) => Token::Declaration(bytes),
            None => self.malformed("unterminated declaration"),
        }
    }

    fn end_tag(&mut self) -> Token<'a> {
        let name_start = self.pos + 2;
        let mut i = name_start;
        while i < self.input.len() && is_tag_name_byte(self.input[i]) {
            i += 1;
        }
        let name = &self.input[name_start..i];

        match self.input[i..].iter().position(|&b| b == b'>') {
            Some(close) => {
                self.pos = i + close + 1;
                Token::EndTag { name }
            }
            None => self.malformed("unterminated end tag"),
        }
    }

    fn start_tag(&mut self) -> Token<'a> {
        let input = self.input;
        let name_start = self.pos + 1;
        let mut i = name_start;
        while i < input.len() && is_tag_name_byte(input[i]) {
            i += 1;
        }
        let name = &input[name_start..i];

        let mut attributes = Vec::new();
        let mut self_closing = false;

        loop {
            i = self.skip_whitespace(i);

            match input.get(i) {
                None => return self.malformed("unterminated start tag"),
                Some(b'>') => {
                    i += 1;
                    break;
                }
                Some(b'/') if input.get(i + 1) == Some(&b'>') => {
                    self_closing = true;
                    i += 2;
                    break;
                }
                Some(b'/') => i += 1,
                Some(_) => {
                    // A leading '=' belongs to the name.
                    let name_start = i;
                    i += 1;
                    while i < input.len() && !is_attr_name_end(input[i]) {
                        i += 1;
                    }
                    let attr_name = &input[name_start..i];

                    let after_name = self.skip_whitespace(i);
                    if input.get(after_name) != Some(&b'=') {
                        attributes.push(Attribute {
                            name: attr_name,
                            value: None,
                        });
                        continue;
                    }

                    let value_start = self.skip_whitespace(after_name + 1);
                    let value = match input.get(value_start) {
                        None => return self.malformed("unterminated attribute"),
                        Some(&quote @ (b'"' | b'\'')) => {
                            let Some(len) = input[value_start + 1..].iter().position(|&b| b == quote)
                            else {
                                return self.malformed("unterminated attribute value");
                            };
                            i = value_start + 1 + len + 1;
                            AttrValue {
                                raw: &input[value_start + 1..value_start + 1 + len],
                                offset: value_start + 1,
                                quote: if quote == b'"' { Quote::Double } else { Quote::Single },
                            }
                        }
                        Some(_) => {
                            i = value_start;
                            while i < input.len() && !input[i].is_ascii_whitespace() && input[i] != b'>' {
                                i += 1;
                            }
                            AttrValue {
                                raw: &input[value_start..i],
                                offset: value_start,
                                quote: Quote::Unquoted,
                            }
                        }
                    };

                    attributes.push(Attribute {
                        name: attr_name,
                        value: Some(value),
                    });
                }
            }
        }

        self.pos = i;

        if !self_closing {
            let lower = String::from_utf8_lossy(name).to_ascii_lowercase();
            if self.css_elements.iter().any(|e| *e == lower) {
                self.raw = Some((name, RawMode::Css));
            } else if RAW_TEXT_ELEMENTS.contains(&lower.as_str()) {
                self.raw = Some((name, RawMode::Text));
            }
        }

        Token::StartTag(StartTag {
            name,
            attributes,
            self_closing,
        })
    }

    /// Finds `</name` (any case) followed by a tag-name terminator.
    fn raw_text_end(&self, name: &[u8]) -> Option<usize> {
        let mut from = self.pos;
        loop {
            let close = find(self.input, from, b"</")?;
            let name_end = close + 2 + name.len();
            let matches_name = self
                .input
                .get(close + 2..name_end)
                .is_some_and(|n| n.eq_ignore_ascii_case(name));
            let terminated = matches!(self.input.get(name_end), Some(&b) if !is_tag_name_byte(b));

            if matches_name && terminated {
                return Some(close);
            }
            from = close + 2;
        }
    }

    fn raw_body(&mut self, name: &'a [u8], mode: RawMode) -> Option<Token<'a>> {
        let Some(end) = self.raw_text_end(name) else {
            return Some(self.malformed("unterminated raw-text element"));
        };

        let start = self.pos;
        if start == end {
            return None;
        }
        self.pos = end;

        let body = &self.input[start..end];
        Some(match mode {
            RawMode::Css => Token::RawCssBlock {
                css: body,
                offset: start,
            },
            RawMode::Text => Token::RawText(body),
        })
    }
}

impl<'a> Iterator for Tokenizer<'a, '_> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.input.len() {
            return None;
        }

        if let Some((name, mode)) = self.raw.take() {
            if let Some(token) = self.raw_body(name, mode) {
                return Some(token);
            }
        }

        let rest = &self.input[self.pos..];
        if rest[0] != b'<' {
            return Some(self.text(self.pos));
        }

        let token = match rest.get(1) {
            Some(b'!') if rest.starts_with(b"<!--") => self.comment(),
            Some(b'!' | b'?') => self.declaration(),
            Some(b'/') if rest.get(2).is_some_and(u8::is_ascii_alphabetic) => self.end_tag(),
            Some(b) if b.is_ascii_alphabetic() => self.start_tag(),
            _ => self.text(self.pos + 1),
        };

        Some(token)
    }
}
