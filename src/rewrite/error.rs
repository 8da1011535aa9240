use thiserror::Error;

pub type Result<T> = std::result::Result<T, RewriteError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RewriteError {
    /// The tokenizer could not find the end of a construct. Never fatal: the
    /// region starting at `offset` is emitted verbatim.
    #[error("Malformed markup at byte {offset}: {reason}")]
    MalformedMarkup { offset: usize, reason: &'static str },

    #[error("Ambiguous rewrite rules for <{tag} {attribute}>: conflicting policies")]
    AmbiguousRule { tag: String, attribute: String },

    #[error("Invalid domain: '{0}'")]
    InvalidDomain(String),

    #[error("Source and target domain are both '{0}'")]
    SameDomain(String),
}
