//! Header forwarding rules shared by the ingress and the client dispatcher.

use std::collections::{HashMap, HashSet};

/// Wire representation of an HTTP header multimap. Values for one name keep
/// their original order; ordering across names is not significant.
pub type Headers = HashMap<String, Vec<String>>;

/// Hop-by-hop headers per RFC 7230 §6.1. These describe a single connection
/// and must not survive forwarding.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Copy `headers` minus everything that must not cross a proxy hop:
/// hop-by-hop headers, any header nominated by `Connection`, and
/// `Content-Length` (each hop reframes the buffered body and recomputes it).
pub fn forwardable_headers(headers: &Headers) -> Headers {
    let mut dropped: HashSet<String> = HOP_BY_HOP.iter().map(|h| h.to_string()).collect();
    dropped.insert("content-length".into());

    for (name, values) in headers {
        if name.eq_ignore_ascii_case("connection") {
            for value in values {
                for token in value.split(',') {
                    let token = token.trim();
                    if !token.is_empty() {
                        dropped.insert(token.to_ascii_lowercase());
                    }
                }
            }
        }
    }

    headers
        .iter()
        .filter(|(name, _)| !dropped.contains(&name.to_ascii_lowercase()))
        .map(|(name, values)| (name.clone(), values.clone()))
        .collect()
}
