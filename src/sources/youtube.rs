use url::Url;

use super::ytdlp::{self, YtDlpInfo, YtDlpSource};
use super::{ExportedSource, SourceContext};
use crate::error::SourceError;

pub const SERVICE: &str = "youtube";

const HOSTS: [&str; 5] = [
    "www.youtube.com",
    "youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "youtu.be",
];

pub fn new(ctx: SourceContext) -> YtDlpSource {
    YtDlpSource::new(SERVICE, ctx)
}

fn is_video_id(id: &str) -> bool {
    id.len() == 11 && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Extrae el ID de video de cualquier forma de URL de YouTube
pub fn video_id(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    if !HOSTS.contains(&host) {
        return None;
    }

    let mut segments = parsed.path_segments()?.filter(|s| !s.is_empty());
    let id = if host == "youtu.be" {
        segments.next().map(str::to_string)
    } else {
        match segments.next() {
            Some("watch") => parsed
                .query_pairs()
                .find(|(k, _)| k == "v")
                .map(|(_, v)| v.into_owned()),
            Some("shorts") | Some("live") | Some("embed") | Some("v") => {
                segments.next().map(str::to_string)
            }
            _ => None,
        }
    };

    id.filter(|id| is_video_id(id))
}

/// Verifica si una URL es un video de YouTube
pub fn is_youtube_url(url: &str) -> bool {
    video_id(url).is_some()
}

/// Verifica si una URL es una playlist de YouTube (sin video seleccionado)
pub fn is_playlist_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let on_youtube = parsed.host_str().is_some_and(|h| HOSTS.contains(&h) && h != "youtu.be");
    let has_list = parsed.query_pairs().any(|(k, v)| k == "list" && !v.is_empty());
    on_youtube && has_list && parsed.path() == "/playlist"
}

pub fn watch_url(id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", id)
}

fn entry_to_exported(entry: &YtDlpInfo) -> Option<ExportedSource> {
    let url = if is_video_id(&entry.id) {
        watch_url(&entry.id)
    } else {
        entry.entry_url()?
    };
    Some(entry.to_exported(&url))
}

/// Entradas de una playlist como snapshots exportables
pub async fn playlist(
    ctx: &SourceContext,
    url: &str,
    limit: usize,
) -> Result<Vec<ExportedSource>, SourceError> {
    let entries = ytdlp::flat_playlist(&ctx.config.ytdlp_path, url, limit).await?;
    Ok(entries.iter().filter_map(entry_to_exported).collect())
}

/// Busca videos por palabras clave
pub async fn search(
    ctx: &SourceContext,
    query: &str,
    limit: usize,
) -> Result<Vec<ExportedSource>, SourceError> {
    let entries = ytdlp::search(&ctx.config.ytdlp_path, query, limit).await?;
    Ok(entries.iter().filter_map(entry_to_exported).collect())
}

/// Un video relacionado con el actual (búsqueda por título, descartando el mismo video)
pub async fn related(
    ctx: &SourceContext,
    current: &ExportedSource,
) -> Result<Option<ExportedSource>, SourceError> {
    let current_id = video_id(&current.url);
    let query = match &current.channel {
        Some(channel) => format!("{} {}", channel, current.title),
        None => current.title.clone(),
    };
    let results = search(ctx, &query, 5).await?;
    Ok(results
        .into_iter()
        .find(|candidate| video_id(&candidate.url) != current_id && !candidate.is_live.unwrap_or(false)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_youtube_url_detection() {
        assert!(is_youtube_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(is_youtube_url("https://youtu.be/dQw4w9WgXcQ"));
        assert!(is_youtube_url("https://music.youtube.com/watch?v=dQw4w9WgXcQ&feature=share"));
        assert!(is_youtube_url("https://www.youtube.com/shorts/dQw4w9WgXcQ"));
        assert!(!is_youtube_url("https://www.google.com"));
        assert!(!is_youtube_url("https://www.youtube.com/watch?v=short"));
        assert!(!is_youtube_url("https://www.youtube.com/playlist?list=PL123"));
    }

    #[test]
    fn test_video_id_extraction() {
        assert_eq!(video_id("https://youtu.be/dQw4w9WgXcQ?t=10").as_deref(), Some("dQw4w9WgXcQ"));
        assert_eq!(
            video_id("https://www.youtube.com/live/dQw4w9WgXcQ").as_deref(),
            Some("dQw4w9WgXcQ")
        );
    }

    #[test]
    fn test_playlist_detection() {
        assert!(is_playlist_url("https://www.youtube.com/playlist?list=PLx0sYbCqOb8TBPRdmBHs5Iftvv9TPboYG"));
        assert!(!is_playlist_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ&list=PL123"));
        assert!(!is_playlist_url("https://example.com/playlist?list=PL123"));
    }

    #[test]
    fn test_entry_to_exported_builds_watch_url() {
        let entry: YtDlpInfo =
            serde_json::from_str(r#"{"id": "dQw4w9WgXcQ", "title": "Never", "duration": 212}"#).unwrap();
        let exported = entry_to_exported(&entry).unwrap();
        assert_eq!(exported.url, "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert_eq!(exported.length, 212);
    }
}
