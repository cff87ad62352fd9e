use url::Url;

use super::ytdlp::YtDlpSource;
use super::SourceContext;

pub const SERVICE: &str = "twitter";

pub fn new(ctx: SourceContext) -> YtDlpSource {
    YtDlpSource::new(SERVICE, ctx)
}

/// `twitter.com/<usuario>/status/<id>` (también x.com)
pub fn validate_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let on_twitter = matches!(
        parsed.host_str(),
        Some("twitter.com" | "www.twitter.com" | "mobile.twitter.com" | "x.com" | "www.x.com")
    );
    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    on_twitter
        && segments.len() >= 3
        && segments[1] == "status"
        && segments[2].chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_twitter_urls() {
        assert!(validate_url("https://twitter.com/user/status/1234567890"));
        assert!(validate_url("https://x.com/user/status/1234567890/video/1"));
        assert!(!validate_url("https://twitter.com/user"));
        assert!(!validate_url("https://twitter.com/user/status/abc"));
    }
}
