//! Selective host rewriting for HTML and CSS bodies served through a reverse
//! proxy. Asset references (scripts, stylesheets, images, CSS `url()`s) are
//! moved from the public domain to an origin domain; navigation, SEO metadata,
//! form values and editor content keep the public domain.

pub mod rewrite;

pub use rewrite::{
    error::RewriteError,
    host::Domain,
    rules::{RewritePolicy, RewriteRule, RuleTable},
    ContentKind, RewriteEngine,
};
