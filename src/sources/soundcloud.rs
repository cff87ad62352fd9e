// SoundCloud vía yt-dlp (tracks y sets)

use url::Url;

use super::ytdlp::{self, YtDlpSource};
use super::{ExportedSource, SourceContext};
use crate::error::SourceError;

pub const SERVICE: &str = "soundcloud";

pub fn new(ctx: SourceContext) -> YtDlpSource {
    YtDlpSource::new(SERVICE, ctx)
}

fn segments(url: &str) -> Option<Vec<String>> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    if host != "soundcloud.com" && host != "www.soundcloud.com" && host != "m.soundcloud.com" {
        return None;
    }
    Some(
        parsed
            .path_segments()?
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// `soundcloud.com/<usuario>/<track>`
pub fn validate_url(url: &str) -> bool {
    matches!(segments(url), Some(s) if s.len() == 2 && s[0] != "discover" && s[1] != "sets")
}

/// `soundcloud.com/<usuario>/sets/<playlist>`
pub fn is_playlist_url(url: &str) -> bool {
    matches!(segments(url), Some(s) if s.len() == 3 && s[1] == "sets")
}

pub async fn playlist(
    ctx: &SourceContext,
    url: &str,
    limit: usize,
) -> Result<Vec<ExportedSource>, SourceError> {
    let entries = ytdlp::flat_playlist(&ctx.config.ytdlp_path, url, limit).await?;
    Ok(entries
        .iter()
        .filter_map(|entry| entry.entry_url().map(|u| entry.to_exported(&u)))
        .collect())
}
