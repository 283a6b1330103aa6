// Query string utilities

use std::collections::HashMap;

/// Parses a query string into a map (percent-decoded, last value wins)
pub fn parse_query_string(query_string: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query_string.trim_start_matches('?').as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Splits "name?query" into the name and the raw query
pub fn split_query(path: &str) -> (&str, &str) {
    match path.split_once('?') {
        Some((name, query)) => (name, query),
        None => (path, ""),
    }
}

// Tests
