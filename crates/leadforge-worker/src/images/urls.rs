// Image URL hygiene

use url::Url;

/// Strip trailing punctuation that commonly adheres to URLs in prose.
/// Idempotent: cleaning a clean URL is a no-op.
pub fn clean_url(url: &str) -> &str {
    url.trim_end_matches([')', '.', ',', ';', '!', '?'])
}

/// Canonical identity for deduplication: scheme + host + path. The query
/// string is ignored only when the path already names an asset (has a file
/// extension), so signed variants of the same image collapse.
fn canonical(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => {
            let path = parsed.path();
            let has_extension = path
                .rsplit('/')
                .next()
                .map(|name| name.contains('.'))
                .unwrap_or(false);
            let base = format!(
                "{}://{}{}",
                parsed.scheme(),
                parsed.host_str().unwrap_or_default(),
                path
            );
            match parsed.query() {
                Some(query) if !has_extension => format!("{base}?{query}"),
                _ => base,
            }
        }
        Err(_) => url.to_string(),
    }
}

/// Keep the first occurrence of each canonicalized URL, preserving order.
/// Idempotent.
pub fn deduplicate(urls: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(urls.len());
    for url in urls {
        if url.is_empty() {
            continue;
        }
        let key = canonical(clean_url(url));
        if seen.insert(key) {
            out.push(url.clone());
        }
    }
    out
}

/// Hosts known to reject cross-origin fetches from the provider: its own
/// CDNs, short-lived signed URLs, and auth-token URLs. These are fetched by
/// us and re-offered as data: URLs.
pub fn is_problematic(url: &str) -> bool {
    let lower = url.to_lowercase();
    lower.contains("cdn.openai.com")
        || lower.contains("oaidalleapiprodscus")
        || lower.contains("gencdn.ai")
        || lower.contains("firebasestorage")
        || lower.contains("x-amz-signature")
        || lower.contains("token=")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_url_strips_trailing_punctuation() {
        assert_eq!(clean_url("https://a.com/x.png)."), "https://a.com/x.png");
        assert_eq!(clean_url("https://a.com/x.png"), "https://a.com/x.png");
    }

    #[test]
    fn clean_url_is_idempotent() {
        let cases = ["https://a.com/x.png),;!?", "no-url-at-all", ""];
        for case in cases {
            let once = clean_url(case);
            assert_eq!(clean_url(once), once);
        }
    }

    #[test]
    fn deduplicate_keeps_first_occurrence() {
        let urls = vec![
            "https://a.com/x.png".to_string(),
            "https://a.com/x.png?sig=1".to_string(),
            "https://a.com/y.png".to_string(),
        ];
        let deduped = deduplicate(&urls);
        assert_eq!(deduped, vec!["https://a.com/x.png", "https://a.com/y.png"]);
    }

    #[test]
    fn deduplicate_is_idempotent_and_order_preserving() {
        let urls = vec![
            "https://b.com/2.png".to_string(),
            "https://a.com/1.png".to_string(),
            "https://b.com/2.png".to_string(),
        ];
        let once = deduplicate(&urls);
        assert_eq!(deduplicate(&once), once);
        assert_eq!(once[0], "https://b.com/2.png");
    }

    #[test]
    fn query_distinguishes_extensionless_paths() {
        let urls = vec![
            "https://a.com/image?id=1".to_string(),
            "https://a.com/image?id=2".to_string(),
        ];
        assert_eq!(deduplicate(&urls).len(), 2);
    }

    #[test]
    fn problematic_hosts() {
        assert!(is_problematic("https://cdn.openai.com/x.png"));
        assert!(is_problematic("https://files.gencdn.ai/a.png"));
        assert!(is_problematic("https://s3.aws.com/x.png?X-Amz-Signature=abc"));
        assert!(!is_problematic("https://example.com/logo.png"));
    }
}
