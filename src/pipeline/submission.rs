//! Validation of run submissions.

use reqwest::Url;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmissionError {
    #[error("gameUrl is required")]
    MissingGameUrl,

    #[error("gameUrl is not a valid URL: {0}")]
    InvalidUrl(String),

    #[error("gameUrl must use http or https, got {0}")]
    UnsupportedScheme(String),

    #[error("gameUrl has no host")]
    MissingHost,

    #[error("host {0} is not allowed")]
    HostNotAllowed(String),
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Whether `host` equals an allowed domain or is a subdomain of one. An
/// empty allow-list accepts every host.
pub fn host_allowed(host: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let host = normalize_host(host);
    allowed.iter().any(|domain| {
        let domain = normalize_host(domain.trim_start_matches("*.").trim_start_matches('.'));
        !domain.is_empty()
            && (host == domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|rest| rest.ends_with('.')))
    })
}

/// Check a submitted `gameUrl` and return it parsed.
pub fn validate_game_url(raw: Option<&str>, allowed: &[String]) -> Result<Url, SubmissionError> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(SubmissionError::MissingGameUrl)?;

    let url = Url::parse(raw).map_err(|e| SubmissionError::InvalidUrl(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SubmissionError::UnsupportedScheme(url.scheme().to_string()));
    }
    let host = url.host_str().ok_or(SubmissionError::MissingHost)?;
    if !host_allowed(host, allowed) {
        return Err(SubmissionError::HostNotAllowed(host.to_string()));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow(domains: &[&str]) -> Vec<String> {
        domains.iter().map(|d| d.to_string()).collect()
    }

    #[test]
    fn test_subdomain_accepted_foreign_rejected() {
        let allowed = allow(&["example.com"]);
        assert!(validate_game_url(Some("https://cdn.example.com/build/index.html"), &allowed).is_ok());
        assert_eq!(
            validate_game_url(Some("https://evil.test/x"), &allowed),
            Err(SubmissionError::HostNotAllowed("evil.test".to_string()))
        );
    }

    #[test]
    fn test_suffix_without_dot_is_not_a_subdomain() {
        let allowed = allow(&["example.com"]);
        assert!(host_allowed("example.com", &allowed));
        assert!(host_allowed("A.B.Example.COM.", &allowed));
        assert!(!host_allowed("badexample.com", &allowed));
        assert!(!host_allowed("example.com.evil.test", &allowed));
    }

    #[test]
    fn test_wildcard_prefix_is_tolerated() {
        assert!(host_allowed("cdn.example.com", &allow(&["*.example.com"])));
        assert!(!host_allowed("anything", &allow(&[""])));
    }

    #[test]
    fn test_empty_allow_list_accepts_any_host() {
        assert!(validate_game_url(Some("http://localhost:3000/"), &[]).is_ok());
    }

    #[test]
    fn test_missing_and_malformed() {
        assert_eq!(validate_game_url(None, &[]), Err(SubmissionError::MissingGameUrl));
        assert_eq!(validate_game_url(Some("  "), &[]), Err(SubmissionError::MissingGameUrl));
        assert!(matches!(
            validate_game_url(Some("not a url"), &[]),
            Err(SubmissionError::InvalidUrl(_))
        ));
        assert_eq!(
            validate_game_url(Some("ftp://example.com/x"), &[]),
            Err(SubmissionError::UnsupportedScheme("ftp".to_string()))
        );
    }
}
