use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowmarkError {
    #[error("mark mask {0:#010x} must be a single contiguous run of set bits")]
    BadMarkMask(u32),

    #[error("rule file {path:?}: {source}")]
    RuleFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("rule file line {line}: {message}")]
    Rule { line: usize, message: String },

    #[error("invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("url_maxsize only accepts sizes of 1 and more, got {0}")]
    UrlMaxSize(usize),

    #[error("netfilter queue error: {0}")]
    Queue(std::io::Error),

    #[error("conntrack socket error: {0}")]
    Conntrack(std::io::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FlowmarkError>;
