use std::collections::HashMap;

use log::debug;
use serde::Deserialize;

use super::error::{Result, RewriteError};
use super::host::{is_absolute_url, PathGate};
use super::tokenizer::{Attribute, StartTag};

const WILDCARD: &str = "*";

/// WordPress serves theme, plugin and upload assets from these trees.
pub const WP_ASSET_PREFIXES: &[&str] = &["/wp-content", "/wp-includes"];

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewritePolicy {
    AlwaysRewrite,
    RewriteIfPrefix(Vec<String>),
    DelegateToCss,
    NeverRewrite,
}

/// Restricts a rule to elements where `attribute` holds `value` as one of its
/// whitespace-separated tokens, e.g. `rel="stylesheet"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct Qualifier {
    pub attribute: String,
    pub value: String,
}

impl Qualifier {
    fn holds_for(&self, tag: &StartTag<'_>) -> bool {
        tag.attribute(&self.attribute)
            .and_then(|attr| attr.value.as_ref())
            .is_some_and(|value| {
                value
                    .raw
                    .split(u8::is_ascii_whitespace)
                    .any(|token| token.eq_ignore_ascii_case(self.value.as_bytes()))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RewriteRule {
    /// Element name, or `*` for any element.
    pub tag: String,
    pub attribute: String,
    #[serde(default)]
    pub when: Option<Qualifier>,
    pub policy: RewritePolicy,
}

impl RewriteRule {
    pub fn new(tag: &str, attribute: &str, policy: RewritePolicy) -> Self {
        RewriteRule {
            tag: tag.to_string(),
            attribute: attribute.to_string(),
            when: None,
            policy,
        }
    }

    pub fn when(mut self, attribute: &str, value: &str) -> Self {
        self.when = Some(Qualifier {
            attribute: attribute.to_string(),
            value: value.to_string(),
        });
        self
    }

    fn normalized(mut self) -> Self {
        self.tag.make_ascii_lowercase();
        self.attribute.make_ascii_lowercase();
        if let Some(when) = &mut self.when {
            when.attribute.make_ascii_lowercase();
            when.value.make_ascii_lowercase();
        }
        self
    }
}

/// What to do with a single attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteDecision<'r> {
    Rewrite(PathGate<'r>),
    CssScan,
    Passthrough,
}

/// Custom elements (`<ppn-cta>`, `<wp-block>`, ...) are never touched.
pub fn is_custom_element(name: &str) -> bool {
    name.contains('-')
}

pub fn is_void_element(name: &str) -> bool {
    VOID_ELEMENTS.contains(&name)
}

/// Immutable after construction; share it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<RewriteRule>,
    style_attributes: Vec<String>,
    style_elements: Vec<String>,
}

impl RuleTable {
    /// Validates and normalizes `rules`. Rules sharing a tag, attribute and
    /// qualifier must agree on their policy.
    pub fn new(rules: Vec<RewriteRule>) -> Result<Self> {
        let mut seen: HashMap<(String, String, Option<Qualifier>), RewritePolicy> = HashMap::new();
        let mut accepted = Vec::with_capacity(rules.len());

        for rule in rules.into_iter().map(RewriteRule::normalized) {
            let key = (rule.tag.clone(), rule.attribute.clone(), rule.when.clone());

            match seen.get(&key) {
                Some(policy) if *policy == rule.policy => {
                    debug!(target: "assetproxy", "Ignoring duplicate rule for <{} {}>", rule.tag, rule.attribute);
                }
                Some(_) => {
                    return Err(RewriteError::AmbiguousRule {
                        tag: rule.tag,
                        attribute: rule.attribute,
                    });
                }
                None => {
                    seen.insert(key, rule.policy.clone());
                    accepted.push(rule);
                }
            }
        }

        Ok(RuleTable {
            rules: accepted,
            style_attributes: vec!["style".to_string()],
            style_elements: vec!["style".to_string()],
        })
    }

    pub fn rules(&self) -> &[RewriteRule] {
        &self.rules
    }

    /// Element names whose body is handed to the CSS scanner.
    pub fn style_elements(&self) -> &[String] {
        &self.style_elements
    }

    fn applicable(&self, rule_tag: &str, tag: &StartTag<'_>, attr: &Attribute<'_>) -> Vec<&RewriteRule> {
        self.rules
            .iter()
            .filter(|rule| rule.tag == rule_tag && attr.is_named(&rule.attribute))
            .filter(|rule| rule.when.as_ref().map_or(true, |q| q.holds_for(tag)))
            .collect()
    }

    /// `tag_name` must already be lowercase.
    pub fn decide(&self, tag: &StartTag<'_>, tag_name: &str, attr: &Attribute<'_>) -> RewriteDecision<'_> {
        if is_custom_element(tag_name) {
            return RewriteDecision::Passthrough;
        }

        if self.style_attributes.iter().any(|name| attr.is_named(name)) {
            return RewriteDecision::CssScan;
        }

        let mut candidates = self.applicable(tag_name, tag, attr);
        if candidates.is_empty() {
            candidates = self.applicable(WILDCARD, tag, attr);
        }

        if candidates.iter().any(|rule| rule.policy == RewritePolicy::NeverRewrite) {
            return RewriteDecision::Passthrough;
        }

        // Several qualified rules with different policies hold at once, e.g.
        // `rel="icon stylesheet"`: leave the value alone.
        if let Some((first, rest)) = candidates.split_first() {
            if rest.iter().any(|rule| rule.policy != first.policy) {
                debug!(target: "assetproxy", "Conflicting rules for <{} {}>, leaving value untouched",
                       tag_name, String::from_utf8_lossy(attr.name));
                return RewriteDecision::Passthrough;
            }
        }

        match candidates.first().map(|rule| &rule.policy) {
            Some(RewritePolicy::AlwaysRewrite) => RewriteDecision::Rewrite(PathGate::Any),
            Some(RewritePolicy::RewriteIfPrefix(prefixes)) => {
                RewriteDecision::Rewrite(PathGate::Prefixes(prefixes))
            }
            Some(RewritePolicy::DelegateToCss) => RewriteDecision::CssScan,
            Some(RewritePolicy::NeverRewrite) | None => RewriteDecision::Passthrough,
        }
    }
}

impl Default for RuleTable {
    /// Asset references of a WordPress site, plus explicit exclusions for the
    /// navigational and SEO attributes that must keep the public domain.
    fn default() -> Self {
        use RewritePolicy::*;

        let assets = || RewriteIfPrefix(WP_ASSET_PREFIXES.iter().map(|p| p.to_string()).collect());
        let uploads = || RewriteIfPrefix(vec!["/wp-content".to_string()]);

        let rules = vec![
            RewriteRule::new("script", "src", assets()),
            RewriteRule::new("link", "href", assets()).when("rel", "stylesheet"),
            RewriteRule::new("img", "src", assets()),
            RewriteRule::new("meta", "content", uploads()).when("property", "og:image"),
            RewriteRule::new("link", "href", NeverRewrite).when("rel", "canonical"),
            RewriteRule::new("link", "href", NeverRewrite).when("rel", "alternate"),
            RewriteRule::new("link", "href", NeverRewrite).when("rel", "home"),
            RewriteRule::new("meta", "content", NeverRewrite).when("property", "og:url"),
            RewriteRule::new("meta", "content", NeverRewrite).when("name", "twitter:domain"),
            RewriteRule::new("a", "href", NeverRewrite),
            RewriteRule::new("form", "action", NeverRewrite),
            RewriteRule::new("input", "value", NeverRewrite),
            RewriteRule::new("input", "placeholder", NeverRewrite),
            RewriteRule::new("input", "defaultvalue", NeverRewrite),
            RewriteRule::new("button", "href", NeverRewrite),
            RewriteRule::new("button", "data-href", NeverRewrite),
        ];

        RuleTable::new(rules).unwrap_or_else(|e| unreachable!("built-in rule table: {e}"))
    }
}

fn opens_editor_region(name: &str, tag: &StartTag<'_>) -> bool {
    if is_custom_element(name) {
        return true;
    }

    tag.attributes.iter().any(|attr| {
        let value = attr.value.as_ref().map(|v| v.raw);

        if attr.is_named("contenteditable") {
            return !value.is_some_and(|v| v.eq_ignore_ascii_case(b"false"));
        }

        attr.name.len() > 5
            && attr.name[..5].eq_ignore_ascii_case(b"data-")
            && value.is_some_and(is_absolute_url)
    })
}

/// Tracks whether the scanner is inside an editor region: a custom element,
/// a `contenteditable` container, or a container with a `data-*` attribute
/// holding a URL. Everything inside one is left alone.
#[derive(Debug, Default)]
pub struct EditorRegion {
    open: Option<(String, usize)>,
}

impl EditorRegion {
    pub fn is_active(&self) -> bool {
        self.open.is_some()
    }

    /// Returns `true` when the tag lies inside a region or is editor markup itself.
    pub fn on_start_tag(&mut self, name: &str, tag: &StartTag<'_>) -> bool {
        let opens_element = !tag.self_closing && !is_void_element(name);

        if let Some((open, depth)) = &mut self.open {
            if open == name && opens_element {
                *depth += 1;
            }
            return true;
        }

        // A void or self-closing element is not a container: unless it is a
        // custom element, its own attributes go through the rule table.
        if !opens_element {
            return is_custom_element(name);
        }

        if opens_editor_region(name, tag) {
            self.open = Some((name.to_string(), 1));
            return true;
        }

        false
    }

    pub fn on_end_tag(&mut self, name: &str) {
        if let Some((open, depth)) = &mut self.open {
            if open == name {
                *depth -= 1;
                if *depth == 0 {
                    self.open = None;
                }
            }
        }
    }
}
