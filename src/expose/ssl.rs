//! Short, user-facing reasons for certificate failures

const MAX_REASON_LEN: usize = 120;

/// Known ACME failure patterns, checked in order
const REASONS: &[(&[&str], &str)] = &[
    (
        &["too many certificates", "ratelimited", "rate limit"],
        "Let's Encrypt rate limit reached, try again later",
    ),
    (
        &["caa record", "caa_forbidden", "forbids issuance"],
        "A CAA record forbids issuing a certificate for this domain",
    ),
    (
        &["nxdomain", "no valid a records", "dns problem"],
        "The domain does not resolve yet, DNS may still be propagating",
    ),
    (
        &["timeout during connect", "connection refused", "timed out"],
        "The ACME challenge could not reach this server on port 80",
    ),
    (
        &["unauthorized", "invalid response from", "403"],
        "The ACME challenge was rejected, check port 80 forwarding to the proxy",
    ),
];

/// Reduce a raw provider error to one line an operator can act on
pub fn summarize_ssl_error(raw: &str) -> String {
    let lowered = raw.to_ascii_lowercase();

    for (needles, reason) in REASONS {
        if needles.iter().any(|needle| lowered.contains(needle)) {
            return reason.to_string();
        }
    }

    let first_line = raw.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    if first_line.is_empty() {
        return "Certificate request failed".to_string();
    }
    if first_line.chars().count() > MAX_REASON_LEN {
        let truncated: String = first_line.chars().take(MAX_REASON_LEN - 3).collect();
        format!("{}...", truncated)
    } else {
        first_line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_patterns() {
        assert_eq!(
            summarize_ssl_error("urn:ietf:params:acme:error:rateLimited: too many certificates already issued"),
            "Let's Encrypt rate limit reached, try again later"
        );
        assert_eq!(
            summarize_ssl_error("DNS problem: NXDOMAIN looking up A for grafana.example.com"),
            "The domain does not resolve yet, DNS may still be propagating"
        );
        assert_eq!(
            summarize_ssl_error("Fetching http://grafana.example.com/.well-known/acme-challenge/x: Timeout during connect"),
            "The ACME challenge could not reach this server on port 80"
        );
    }

    #[test]
    fn test_unknown_error_is_first_line_truncated() {
        let raw = format!("{}\nstack trace", "x".repeat(200));
        let summary = summarize_ssl_error(&raw);
        assert_eq!(summary.chars().count(), MAX_REASON_LEN);
        assert!(summary.ends_with("..."));

        assert_eq!(summarize_ssl_error("  \n"), "Certificate request failed");
    }
}
