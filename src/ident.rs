use crate::error::MonitorError;

/// Longest identifier we emit — matches the Postgres NAMEDATALEN-1 limit so
/// table names survive the relational backend unmangled.
const MAX_IDENT_BYTES: usize = 63;

/// Prefixes reserved by the SQL backends.
const RESERVED_PREFIXES: &[&str] = &["pg_", "sql_"];

/// Map an arbitrary user string (server name, table name) to a safe
/// identifier: trim, lowercase, replace anything outside `[a-z0-9_]` with
/// `_`, collapse runs, strip edge underscores, truncate to 63 bytes.
///
/// Rejects inputs containing `..` segments (they could escape a directory
/// root when the identifier names a filesystem path), inputs that
/// canonicalize to nothing, and reserved prefixes. Idempotent:
/// `sanitize(sanitize(x)) == sanitize(x)`.
pub fn sanitize(input: &str) -> Result<String, MonitorError> {
    let trimmed = input.trim();
    if trimmed.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(MonitorError::validation(format!(
            "identifier {trimmed:?} contains a traversal segment"
        )));
    }

    let mut out = String::with_capacity(trimmed.len());
    let mut last_was_underscore = false;
    for c in trimmed.chars() {
        let mapped = match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9') => c,
            _ => '_',
        };
        if mapped == '_' {
            if last_was_underscore {
                continue;
            }
            last_was_underscore = true;
        } else {
            last_was_underscore = false;
        }
        out.push(mapped);
    }

    let mut out = out.trim_matches('_').to_string();
    if out.len() > MAX_IDENT_BYTES {
        out.truncate(MAX_IDENT_BYTES);
        // Truncation may leave a trailing underscore behind.
        out = out.trim_end_matches('_').to_string();
    }

    if out.is_empty() {
        return Err(MonitorError::validation(format!(
            "identifier {input:?} canonicalizes to nothing"
        )));
    }
    for prefix in RESERVED_PREFIXES {
        if out.starts_with(prefix) {
            return Err(MonitorError::validation(format!(
                "identifier {out:?} uses reserved prefix {prefix:?}"
            )));
        }
    }

    Ok(out)
}

/// Quote a sanitized identifier for interpolation into SQL. Embedded quotes
/// are doubled per the standard identifier-quoting rule. Values never go
/// through here — they are always bound parameters.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Derive the storage table for a remote peer address:
/// `server_<sanitized-host>_<port>`. The port falls back to the scheme
/// default when the address does not name one.
pub fn table_for_address(address: &str) -> Result<String, MonitorError> {
    let url = reqwest::Url::parse(address)
        .map_err(|e| MonitorError::validation(format!("invalid peer address {address:?}: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| MonitorError::validation(format!("peer address {address:?} has no host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| MonitorError::validation(format!("peer address {address:?} has no port")))?;
    sanitize(&format!("server_{host}_{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── canonicalization ──

    #[test]
    fn sanitize_basic() {
        assert_eq!(sanitize("My Server #1").unwrap(), "my_server_1");
    }

    #[test]
    fn sanitize_collapses_runs_and_strips_edges() {
        assert_eq!(sanitize("__a---b__").unwrap(), "a_b");
    }

    #[test]
    fn sanitize_messy_server_name() {
        // ".." glued to other text is not a traversal segment
        assert_eq!(sanitize("  My Server #1 ../x  ").unwrap(), "my_server_1_x");
    }

    #[test]
    fn sanitize_is_idempotent() {
        let once = sanitize("  Weird--Name 42! ").unwrap();
        assert_eq!(sanitize(&once).unwrap(), once);
    }

    #[test]
    fn sanitize_truncates_to_63_bytes() {
        let long = "x".repeat(200);
        let out = sanitize(&long).unwrap();
        assert_eq!(out.len(), 63);
        assert_eq!(sanitize(&out).unwrap(), out);
    }

    #[test]
    fn sanitize_truncation_never_ends_with_underscore() {
        let input = format!("{}_{}", "a".repeat(62), "b".repeat(10));
        let out = sanitize(&input).unwrap();
        assert!(!out.ends_with('_'));
        assert_eq!(sanitize(&out).unwrap(), out);
    }

    #[test]
    fn sanitize_output_matches_contract() {
        for input in ["Server A", "db.internal:5432", "ünïcödé", "9lives"] {
            let out = sanitize(input).unwrap();
            assert!(out.len() <= 63);
            assert!(out
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
            assert!(!out.contains(".."));
        }
    }

    // ── rejections ──

    #[test]
    fn sanitize_rejects_traversal() {
        assert!(sanitize("../etc/passwd").is_err());
        assert!(sanitize("a/../b").is_err());
    }

    #[test]
    fn sanitize_rejects_empty_result() {
        assert!(sanitize("").is_err());
        assert!(sanitize("---").is_err());
        assert!(sanitize("   ").is_err());
    }

    #[test]
    fn sanitize_rejects_reserved_prefixes() {
        assert!(sanitize("pg_catalog").is_err());
        assert!(sanitize("SQL_injection").is_err());
        assert!(sanitize("pgx_fine").is_ok());
    }

    // ── quoting ──

    #[test]
    fn quote_wraps_and_doubles() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    // ── table routing ──

    #[test]
    fn table_for_address_with_port() {
        assert_eq!(
            table_for_address("http://10.0.0.5:3500").unwrap(),
            "server_10_0_0_5_3500"
        );
    }

    #[test]
    fn table_for_address_default_ports() {
        assert_eq!(
            table_for_address("https://mon.example.com").unwrap(),
            "server_mon_example_com_443"
        );
        assert_eq!(
            table_for_address("http://mon.example.com/monitoring").unwrap(),
            "server_mon_example_com_80"
        );
    }

    #[test]
    fn table_for_address_rejects_garbage() {
        assert!(table_for_address("not a url").is_err());
    }
}
