use url::Url;

use super::ytdlp::YtDlpSource;
use super::SourceContext;

pub const SERVICE: &str = "niconico";

pub fn new(ctx: SourceContext) -> YtDlpSource {
    YtDlpSource::new(SERVICE, ctx)
}

/// `nicovideo.jp/watch/sm…` o `nico.ms/sm…`
pub fn validate_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|s| s.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let id = match host {
        "www.nicovideo.jp" | "nicovideo.jp" | "sp.nicovideo.jp" if segments.len() == 2 && segments[0] == "watch" => {
            segments[1]
        }
        "nico.ms" if segments.len() == 1 => segments[0],
        _ => return false,
    };

    let digits = id.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    id.len() > digits.len() && !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}
