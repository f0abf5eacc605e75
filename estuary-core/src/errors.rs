use thiserror::Error;

use crate::prefix::Ipv4Prefix;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid prefix: {0}")]
    InvalidPrefix(String),

    #[error("Prefix depth already passed: node covers {node}, requested {requested}")]
    InvalidPrefixDepth {
        node: Ipv4Prefix,
        requested: Ipv4Prefix,
    },

    #[error("Cannot expand a host route: {0}")]
    PrefixTooNarrow(Ipv4Prefix),

    #[error("Node covering {0} is not a leaf")]
    NotALeaf(Ipv4Prefix),

    #[error("Node covering {0} is not collapsible")]
    NotCollapsible(Ipv4Prefix),
}
