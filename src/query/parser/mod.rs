//! Textual query parsing
//!
//! The lookup surface accepts `metric{k1=v1,k2=v2}` strings; the expression
//! surface accepts a nested-function DSL (see [`expression`]). Both share
//! the tag-block parser here.

pub mod expression;
pub mod relative;

use crate::error::{Error, Result};
use crate::types::Tag;

/// Parse a textual lookup query into a metric name and its tag list.
///
/// The metric is everything up to the first `{`, trimmed; without a `{`
/// there are no tags. The tag block must be brace-delimited; pairs split on
/// `,`, a pair splits on its first `=`. Keys must be non-empty, values may
/// be empty.
pub fn parse_lookup_query(query: &str) -> Result<(String, Vec<Tag>)> {
    match query.find('{') {
        None => Ok((query.trim().to_string(), Vec::new())),
        Some(open) => {
            let metric = query[..open].trim().to_string();
            let tags = parse_tag_block(&query[open..])?;
            Ok((metric, tags))
        }
    }
}

/// Parse a `{k1=v1,k2=v2}` block. Used by both the lookup parser and the
/// expression parser's `query()` arguments.
pub(crate) fn parse_tag_block(block: &str) -> Result<Vec<Tag>> {
    let block = block.trim();
    if block.is_empty() {
        return Ok(Vec::new());
    }

    let inner = block
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .ok_or_else(|| Error::validation("missing '}' at the end of query"))?;

    let mut tags = Vec::new();
    for pair in inner.split(',') {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| Error::validation("invalid tag format"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::validation("invalid tag format"));
        }
        tags.push(Tag {
            key: key.to_string(),
            value: value.trim().to_string(),
        });
    }

    Ok(tags)
}
