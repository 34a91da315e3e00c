//! MongoDB connection string handling for tunneled connections.
//!
//! These functions never fail: input that does not look like a connection
//! string is passed through as well as possible.

/// Port assumed when a connection string names none
pub const DEFAULT_MONGO_PORT: u16 = 27017;

const STANDARD_SCHEME: &str = "mongodb://";
const SRV_SCHEME: &str = "mongodb+srv://";

/// Option that stops the driver from discovering other replica set members
const DIRECT_CONNECTION_KEY: &str = "directConnection";

fn strip_scheme(uri: &str) -> (Option<&'static str>, &str) {
    if let Some(rest) = uri.strip_prefix(STANDARD_SCHEME) {
        (Some(STANDARD_SCHEME), rest)
    } else if let Some(rest) = uri.strip_prefix(SRV_SCHEME) {
        (Some(SRV_SCHEME), rest)
    } else {
        (None, uri)
    }
}

/// Split `user:pass@rest` at the first `@`, keeping the `@` with the credentials.
///
/// Only the authority (before the first `/` or `?`) is searched; an `@` in an
/// option value is not a credentials separator.
fn split_credentials(s: &str) -> (&str, &str) {
    let authority_end = s.find(&['/', '?'][..]).unwrap_or(s.len());
    match s[..authority_end].find('@') {
        Some(idx) => s.split_at(idx + 1),
        None => ("", s),
    }
}

/// Split the host list from the `/db?options` suffix
fn split_suffix(s: &str) -> (&str, &str) {
    match s.find(&['/', '?'][..]) {
        Some(idx) => s.split_at(idx),
        None => (s, ""),
    }
}

/// Whether `host` (possibly a bracketed IPv6 literal) carries a port
fn has_port(host: &str) -> bool {
    match host.strip_prefix('[') {
        Some(rest) => rest
            .split_once(']')
            .is_some_and(|(_, after)| after.starts_with(':')),
        None => host.contains(':'),
    }
}

/// Extract the `host:port` the connection string points at.
///
/// For a seed list (`a,b,c`) the first host is returned. A missing port
/// is filled in with 27017.
pub fn extract_host_port(uri: &str) -> String {
    let (_, rest) = strip_scheme(uri);
    let (_, rest) = split_credentials(rest);
    let (hosts, _) = split_suffix(rest);
    let host = hosts.split(',').next().unwrap_or(hosts);

    if has_port(host) {
        host.to_string()
    } else {
        format!("{}:{}", host, DEFAULT_MONGO_PORT)
    }
}

/// Point a connection string at a local tunnel endpoint.
///
/// Both schemes become `mongodb://` (SRV discovery is meaningless through a
/// single forwarded port). Credentials and the `/db?options` suffix are kept
/// verbatim, and `directConnection=true` is added unless the option is
/// already present, so the driver does not chase replica set members by
/// hostnames that only resolve on the remote side.
pub fn rewrite(original: &str, local_addr: &str) -> String {
    let (scheme, rest) = strip_scheme(original);
    let (credentials, rest) = split_credentials(rest);
    let (_, suffix) = split_suffix(rest);

    let mut result = String::with_capacity(original.len() + local_addr.len() + 24);
    if scheme.is_some() {
        result.push_str(STANDARD_SCHEME);
    }
    result.push_str(credentials);
    result.push_str(local_addr);
    result.push_str(suffix);

    if has_direct_connection(suffix) {
        return result;
    }

    let option = format!("{}=true", DIRECT_CONNECTION_KEY);
    if suffix.contains('?') {
        if !suffix.ends_with('?') && !suffix.ends_with('&') {
            result.push('&');
        }
    } else if suffix.is_empty() {
        result.push_str("/?");
    } else {
        result.push('?');
    }
    result.push_str(&option);
    result
}

/// Case-insensitive check for the option among the query keys
fn has_direct_connection(suffix: &str) -> bool {
    let Some((_, query)) = suffix.split_once('?') else {
        return false;
    };
    query.split('&').any(|pair| {
        let key = pair.split_once('=').map_or(pair, |(key, _)| key);
        key.eq_ignore_ascii_case(DIRECT_CONNECTION_KEY)
    })
}
