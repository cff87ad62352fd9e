use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;
use url::Url;

use super::custom::probe_length;
use super::{AudioSource, ExportedSource, SourceContext, StreamInfo, StreamType};
use crate::error::SourceError;

pub const SERVICE: &str = "googledrive";

/// ID de archivo de `drive.google.com/file/d/<id>/…`
pub fn file_id(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if parsed.host_str()? != "drive.google.com" {
        return None;
    }
    let segments: Vec<&str> = parsed.path_segments()?.collect();
    match segments.as_slice() {
        ["file", "d", id, ..] if !id.is_empty() => Some(id.to_string()),
        _ => None,
    }
}

pub fn validate_url(url: &str) -> bool {
    file_id(url).is_some()
}

fn download_url(id: &str) -> String {
    format!("https://drive.google.com/uc?id={}&export=download", id)
}

/// Título desde el `<title>` de la página del archivo.
fn page_title(html: &str) -> Option<String> {
    let start = html.find("<title>")? + "<title>".len();
    let end = start + html[start..].find("</title>")?;
    let title = html[start..end].trim_end_matches(" - Google Drive").trim();
    (!title.is_empty()).then(|| title.to_string())
}

pub struct GoogleDrive {
    ctx: SourceContext,
    meta: RwLock<ExportedSource>,
}

impl GoogleDrive {
    pub fn new(ctx: SourceContext) -> Self {
        Self {
            ctx,
            meta: RwLock::new(ExportedSource::default()),
        }
    }
}

#[async_trait]
impl AudioSource for GoogleDrive {
    fn service_identifier(&self) -> &'static str {
        SERVICE
    }

    fn snapshot(&self) -> ExportedSource {
        self.meta.read().clone()
    }

    async fn init(&self, url: &str, known: Option<ExportedSource>) -> Result<(), SourceError> {
        let id = file_id(url).ok_or_else(|| SourceError::InvalidUrl {
            service: SERVICE,
            url: url.to_string(),
        })?;

        if let Some(known) = known {
            *self.meta.write() = ExportedSource {
                url: url.to_string(),
                ..known
            };
            return Ok(());
        }

        let response = self.ctx.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(SourceError::from_status(SERVICE, response.status()));
        }
        let title = page_title(&response.text().await?).unwrap_or_else(|| "Google Drive".to_string());
        let length = probe_length(&self.ctx, &download_url(&id)).await.unwrap_or(0);
        debug!("☁️ Google Drive {} → {} ({}s)", id, title, length);

        *self.meta.write() = ExportedSource {
            url: url.to_string(),
            title,
            length,
            ..Default::default()
        };
        Ok(())
    }

    async fn fetch(&self, _force_url: bool) -> Result<StreamInfo, SourceError> {
        let id = file_id(&self.url()).ok_or(SourceError::NotInitialized)?;
        Ok(StreamInfo::Url {
            url: download_url(&id),
            user_agent: None,
            stream_type: StreamType::Unknown,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_id() {
        assert_eq!(
            file_id("https://drive.google.com/file/d/1AbC_dEf/view?usp=sharing").as_deref(),
            Some("1AbC_dEf")
        );
        assert!(!validate_url("https://drive.google.com/drive/folders/xyz"));
        assert!(!validate_url("https://docs.google.com/file/d/1AbC/view"));
    }

    #[test]
    fn test_page_title() {
        assert_eq!(
            page_title("<html><title>track.mp3 - Google Drive</title></html>").as_deref(),
            Some("track.mp3")
        );
        assert_eq!(page_title("<html></html>"), None);
    }
}
