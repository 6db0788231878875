//! Expression DSL
//!
//! The textual form of a structured query, a nest of functions with the
//! merge outermost and the series selection innermost:
//!
//! ```text
//! merge(sum, downsample(30m, avg, null, rate(true, null, 0,
//!     filter(>=5, query(os.cpu, {host=*}, 1h-ago)))))
//! ```
//!
//! `downsample`, `rate` and `filter` may each appear at most once, in any
//! nesting order; the nesting order becomes the sub-query's `order` list
//! (innermost first). The merge step is always outermost, so the canonical
//! `order` leaves its `aggregation` token implicit; payloads carrying an
//! explicit trailing `aggregation` compile all the same. `compile` is the
//! inverse of `parse` and produces the canonical rendering: no whitespace,
//! tag entries sorted, explicit fill.

use crate::error::{Error, Result};
use crate::types::{
    parse_filter_value, DownsampleSpec, QueryFilter, QueryPayload, RateOptions, SubQuery,
    VALID_AGGREGATORS,
};

use super::{parse_tag_block, relative};

/// Parse an expression into its relative window and sub-query
pub fn parse_expression(expression: &str) -> Result<(String, SubQuery)> {
    let (name, args) = parse_call(expression)?;
    if name != "merge" {
        return Err(Error::validation(format!(
            "merge must be the outermost function, got: {name}"
        )));
    }
    if args.len() != 2 {
        return Err(Error::validation("merge takes two arguments"));
    }

    let aggregator = args[0];
    if !VALID_AGGREGATORS.contains(&aggregator) {
        return Err(Error::validation(format!("invalid aggregator: {aggregator}")));
    }

    let mut sub = SubQuery {
        aggregator: aggregator.to_string(),
        ..Default::default()
    };
    let mut outside_in: Vec<&'static str> = Vec::new();
    let mut relative_str = String::new();
    let mut current = args[1];

    loop {
        let (name, args) = parse_call(current)?;
        match name {
            "downsample" => {
                if !sub.downsample.is_empty() {
                    return Err(Error::validation("downsample given twice"));
                }
                if args.len() != 4 {
                    return Err(Error::validation("downsample takes four arguments"));
                }
                sub.downsample = downsample_string(args[0], args[1], args[2])?;
                outside_in.push("downsample");
                current = args[3];
            }
            "rate" => {
                if sub.rate {
                    return Err(Error::validation("rate given twice"));
                }
                if args.len() != 4 {
                    return Err(Error::validation("rate takes four arguments"));
                }
                sub.rate = true;
                sub.rate_options = rate_options(args[0], args[1], args[2])?;
                outside_in.push("rate");
                current = args[3];
            }
            "filter" => {
                if !sub.filter_value.is_empty() {
                    return Err(Error::validation("filter given twice"));
                }
                if args.len() != 2 {
                    return Err(Error::validation("filter takes two arguments"));
                }
                parse_filter_value(args[0])?;
                sub.filter_value = args[0].to_string();
                outside_in.push("filter");
                current = args[1];
            }
            "query" => {
                if args.len() != 3 {
                    return Err(Error::validation("query takes three arguments"));
                }
                if args[0].is_empty() {
                    return Err(Error::validation("metric cannot be empty"));
                }
                sub.metric = args[0].to_string();
                sub.filters = query_filters(args[1])?;
                relative::relative_duration_ms(args[2])?;
                relative_str = args[2].to_string();
                break;
            }
            other => {
                return Err(Error::validation(format!("unknown function: {other}")));
            }
        }
    }

    // order lists operations innermost first
    outside_in.reverse();
    sub.order = outside_in.into_iter().map(str::to_string).collect();

    Ok((relative_str, sub))
}

/// Compile structural payloads back to canonical expression strings, one
/// per sub-query
pub fn compile_payloads(payloads: &[QueryPayload]) -> Result<Vec<String>> {
    let mut expressions = Vec::new();
    for payload in payloads {
        if payload.relative.is_empty() {
            return Err(Error::validation("only relative payloads can be compiled"));
        }
        for query in &payload.queries {
            expressions.push(compile_query(&payload.relative, query)?);
        }
    }
    Ok(expressions)
}

fn compile_query(relative: &str, query: &SubQuery) -> Result<String> {
    let mut tags: Vec<(&str, &str)> = Vec::with_capacity(query.filters.len());
    for filter in &query.filters {
        if filter.ftype != "wildcard" {
            return Err(Error::validation(format!(
                "filter type cannot be expressed: {}",
                filter.ftype
            )));
        }
        tags.push((&filter.tagk, &filter.filter));
    }
    tags.sort();

    let tag_block = if tags.is_empty() {
        "null".to_string()
    } else {
        let entries: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{{{}}}", entries.join(","))
    };

    let mut expr = format!("query({},{},{})", query.metric, tag_block, relative);

    for token in order_tokens(query)? {
        match token {
            "downsample" => {
                let spec = DownsampleSpec::parse(&query.downsample)?;
                // render the user-facing function name, not the merge alias
                let func = query
                    .downsample
                    .split('-')
                    .nth(1)
                    .unwrap_or(spec.func.as_str())
                    .to_string();
                expr = format!(
                    "downsample({}{},{},{},{})",
                    spec.value, spec.unit, func, spec.fill, expr
                );
            }
            "rate" => {
                let opts = &query.rate_options;
                let counter_max = match opts.counter_max {
                    Some(v) => v.to_string(),
                    None => "null".to_string(),
                };
                expr = format!(
                    "rate({},{},{},{})",
                    opts.counter, counter_max, opts.reset_value, expr
                );
            }
            "filter" => {
                parse_filter_value(&query.filter_value)?;
                expr = format!("filter({},{})", query.filter_value, expr);
            }
            // merge is rendered after the loop, always outermost
            "aggregation" => {}
            _ => unreachable!(),
        }
    }

    Ok(format!("merge({},{})", query.aggregator, expr))
}

/// The sub-query's operation order, synthesized in the canonical sequence
/// when the payload carries none. An explicit `aggregation` token names the
/// merge step and must come last, since the expression form keeps merge
/// outermost.
fn order_tokens(query: &SubQuery) -> Result<Vec<&str>> {
    if query.order.is_empty() {
        let mut order = Vec::new();
        if !query.downsample.is_empty() {
            order.push("downsample");
        }
        if query.rate {
            order.push("rate");
        }
        if !query.filter_value.is_empty() {
            order.push("filter");
        }
        return Ok(order);
    }

    for (i, token) in query.order.iter().enumerate() {
        let enabled = match token.as_str() {
            "downsample" => !query.downsample.is_empty(),
            "rate" => query.rate,
            "filter" => !query.filter_value.is_empty(),
            "aggregation" => {
                if i + 1 != query.order.len() {
                    return Err(Error::validation(
                        "aggregation must be the outermost operation in an expression",
                    ));
                }
                true
            }
            _ => false,
        };
        if !enabled {
            return Err(Error::validation(format!(
                "order lists a disabled operation: {token}"
            )));
        }
    }
    Ok(query.order.iter().map(String::as_str).collect())
}

fn downsample_string(period: &str, func: &str, fill: &str) -> Result<String> {
    let joined = format!("{period}-{func}-{fill}");
    DownsampleSpec::parse(&joined)?;
    if fill == "none" {
        Ok(format!("{period}-{func}"))
    } else {
        Ok(joined)
    }
}

fn rate_options(counter: &str, counter_max: &str, reset: &str) -> Result<RateOptions> {
    let counter: bool = counter
        .parse()
        .map_err(|_| Error::validation(format!("invalid rate counter flag: {counter}")))?;
    let counter_max = if counter_max == "null" {
        None
    } else {
        Some(counter_max.parse::<i64>().map_err(|_| {
            Error::validation(format!("rate counter max out of range: {counter_max}"))
        })?)
    };
    let reset_value: i64 = reset
        .parse()
        .map_err(|_| Error::validation(format!("rate reset value out of range: {reset}")))?;
    Ok(RateOptions {
        counter,
        counter_max,
        reset_value,
    })
}

/// Lower a legacy tag value to its wildcard filter, deriving `group_by`
/// from the `*`/pipe-list forms
pub(crate) fn tag_filter(key: &str, value: &str) -> QueryFilter {
    let members: Vec<&str> = value.split('|').collect();
    let group_by = members[0] == "*" || members.len() > 1;
    QueryFilter::wildcard(key, value, group_by)
}

fn query_filters(block: &str) -> Result<Vec<QueryFilter>> {
    if block == "null" {
        return Ok(Vec::new());
    }
    let tags = parse_tag_block(block)?;
    Ok(tags
        .iter()
        .map(|tag| tag_filter(&tag.key, &tag.value))
        .collect())
}

/// Split `name(arg1, arg2, …)` into the function name and its top-level
/// arguments, honoring nested parentheses and brace blocks
fn parse_call(input: &str) -> Result<(&str, Vec<&str>)> {
    let input = input.trim();
    let open = input
        .find('(')
        .ok_or_else(|| Error::validation(format!("malformed expression: {input}")))?;
    let name = input[..open].trim();
    if name.is_empty() || !input.ends_with(')') {
        return Err(Error::validation(format!("malformed expression: {input}")));
    }

    let body = &input[open + 1..input.len() - 1];
    let mut args = Vec::new();
    let mut parens = 0i32;
    let mut braces = 0i32;
    let mut start = 0;

    for (i, ch) in body.char_indices() {
        match ch {
            '(' => parens += 1,
            ')' => parens -= 1,
            '{' => braces += 1,
            '}' => braces -= 1,
            ',' if parens == 0 && braces == 0 => {
                args.push(body[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
        if parens < 0 || braces < 0 {
            return Err(Error::validation(format!("malformed expression: {input}")));
        }
    }
    if parens != 0 || braces != 0 {
        return Err(Error::validation(format!("malformed expression: {input}")));
    }
    if !body.trim().is_empty() || !args.is_empty() {
        args.push(body[start..].trim());
    }

    Ok((name, args))
}
