//! Remote backup of queues and guild statuses over HTTP.
//!
//! Queues are uploaded only for guilds whose queue changed since the last
//! successful upload; statuses only when their encoded string changed. Both
//! run on every second tick of the main loop.

use anyhow::{bail, Result};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::audio::events::QueueEvent;
use crate::audio::player::{MAX_VOLUME, MIN_VOLUME};
use crate::config::Config;
use crate::guild::{GuildRegistry, YmxFormat};

/// Volumen usado cuando el guardado está fuera de rango
pub const FALLBACK_VOLUME: u16 = 100;

/// Estado exportable de una guild
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildStatus {
    /// `"0"` si no está sonando
    pub voice_channel: String,
    pub bound_channel: String,
    pub loop_enabled: bool,
    pub queue_loop_enabled: bool,
    pub add_related: bool,
    pub equally_playback: bool,
    pub volume: u16,
}

impl GuildStatus {
    /// `vc:canal:loop:qloop:related:equally:volumen`
    pub fn encode(&self) -> String {
        let flag = |v: bool| if v { "1" } else { "0" };
        [
            self.voice_channel.as_str(),
            self.bound_channel.as_str(),
            flag(self.loop_enabled),
            flag(self.queue_loop_enabled),
            flag(self.add_related),
            flag(self.equally_playback),
            &self.volume.to_string(),
        ]
        .join(":")
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw.split(':').collect();
        let [voice, bound, looped, queue_looped, related, equally, volume] = parts.as_slice() else {
            return None;
        };
        let volume = volume
            .parse::<u16>()
            .ok()
            .filter(|v| (MIN_VOLUME..=MAX_VOLUME).contains(v))
            .unwrap_or(FALLBACK_VOLUME);
        Some(Self {
            voice_channel: voice.to_string(),
            bound_channel: bound.to_string(),
            loop_enabled: *looped == "1",
            queue_loop_enabled: *queue_looped == "1",
            add_related: *related == "1",
            equally_playback: *equally == "1",
            volume,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupKind {
    #[serde(rename = "queue")]
    Queue,
    #[serde(rename = "j")]
    Status,
}

#[derive(Debug, Serialize)]
struct BackupRequest<'a> {
    token: &'a str,
    guildid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(rename = "type")]
    kind: BackupKind,
}

#[derive(Debug, Deserialize)]
struct BackupResponse {
    status: u16,
    #[serde(default)]
    data: serde_json::Value,
}

/// Cuerpo `data` de la subida de colas: JSON URL-encoded por guild
fn encode_queues(queues: &HashMap<String, YmxFormat>) -> Result<String> {
    let mut raw = HashMap::with_capacity(queues.len());
    for (guild_id, ymx) in queues {
        raw.insert(guild_id.clone(), urlencoding::encode(&serde_json::to_string(ymx)?).into_owned());
    }
    Ok(serde_json::to_string(&raw)?)
}

fn decode_statuses(data: serde_json::Value) -> HashMap<String, GuildStatus> {
    let raw: HashMap<String, String> = serde_json::from_value(data).unwrap_or_default();
    raw.into_iter()
        .filter_map(|(guild_id, value)| GuildStatus::decode(&value).map(|s| (guild_id, s)))
        .collect()
}

fn decode_queues(data: serde_json::Value) -> HashMap<String, YmxFormat> {
    let raw: HashMap<String, String> = serde_json::from_value(data).unwrap_or_default();
    raw.into_iter()
        .filter_map(|(guild_id, value)| match serde_json::from_str(&value) {
            Ok(ymx) => Some((guild_id, ymx)),
            Err(e) => {
                warn!("⚠️ Cola de respaldo inválida para {}: {}", guild_id, e);
                None
            }
        })
        .collect()
}

pub struct HttpBackupper {
    http: reqwest::Client,
    url: String,
    token: String,
    registry: Arc<GuildRegistry>,
    modified: DashSet<u64>,
    previous_statuses: DashMap<u64, String>,
    ticks: AtomicU64,
}

impl HttpBackupper {
    /// `None` si no hay URL o token configurados
    pub fn new(config: &Config, http: reqwest::Client, registry: Arc<GuildRegistry>) -> Option<Self> {
        let (Some(url), Some(token)) = (config.backup_url.clone(), config.backup_token.clone()) else {
            return None;
        };
        info!("💾 Backup HTTP habilitado");
        Some(Self {
            http,
            url,
            token,
            registry,
            modified: DashSet::new(),
            previous_statuses: DashMap::new(),
            ticks: AtomicU64::new(0),
        })
    }

    pub fn mark_modified(&self, guild_id: u64) {
        self.modified.insert(guild_id);
    }

    /// Marca la guild como modificada con cada cambio de su cola
    pub fn watch(self: &Arc<Self>, guild_id: u64, mut events: broadcast::Receiver<QueueEvent>) {
        let backupper = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => match backupper.upgrade() {
                        Some(backupper) => backupper.mark_modified(guild_id),
                        None => break,
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Respalda cada segundo tick
    pub async fn tick(&self) {
        let count = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        if count % 2 != 0 {
            return;
        }
        if let Err(e) = self.backup_queues().await {
            error!("❌ Error respaldando colas: {:?}", e);
        }
        if let Err(e) = self.backup_statuses().await {
            warn!("⚠️ Error respaldando estados: {:?}", e);
        }
    }

    async fn backup_queues(&self) -> Result<()> {
        let guild_ids: Vec<u64> = self.modified.iter().map(|id| *id).collect();
        if guild_ids.is_empty() {
            debug!("Sin colas modificadas");
            return Ok(());
        }

        let mut queues = HashMap::new();
        for guild_id in &guild_ids {
            if let Some(container) = self.registry.get(*guild_id) {
                queues.insert(guild_id.to_string(), container.export_queue());
            }
        }
        info!("💾 Respaldando {} colas", queues.len());
        self.post(BackupKind::Queue, &guild_ids, encode_queues(&queues)?).await?;
        for guild_id in guild_ids {
            self.modified.remove(&guild_id);
        }
        Ok(())
    }

    async fn backup_statuses(&self) -> Result<()> {
        let mut changed = HashMap::new();
        for container in self.registry.all() {
            let encoded = container.export_status().encode();
            let previous = self.previous_statuses.get(&container.guild_id()).map(|s| s.value().clone());
            if previous.as_deref() != Some(encoded.as_str()) {
                changed.insert(container.guild_id(), encoded);
            }
        }
        if changed.is_empty() {
            debug!("Sin estados modificados");
            return Ok(());
        }

        info!("💾 Respaldando {} estados", changed.len());
        let guild_ids: Vec<u64> = changed.keys().copied().collect();
        let raw: HashMap<String, &String> = changed.iter().map(|(id, s)| (id.to_string(), s)).collect();
        self.post(BackupKind::Status, &guild_ids, serde_json::to_string(&raw)?).await?;
        for (guild_id, encoded) in changed {
            self.previous_statuses.insert(guild_id, encoded);
        }
        Ok(())
    }

    fn request(&self, kind: BackupKind, guild_ids: &[u64], data: Option<String>) -> BackupRequest<'_> {
        BackupRequest {
            token: &self.token,
            guildid: guild_ids.iter().map(u64::to_string).collect::<Vec<_>>().join(","),
            data,
            kind,
        }
    }

    async fn post(&self, kind: BackupKind, guild_ids: &[u64], data: String) -> Result<()> {
        let body = self.request(kind, guild_ids, Some(data));
        let response: BackupResponse = self
            .http
            .post(&self.url)
            .timeout(Duration::from_secs(30))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        if response.status != 200 {
            bail!("el servidor de respaldo respondió {}", response.status);
        }
        Ok(())
    }

    async fn get(&self, kind: BackupKind, guild_ids: &[u64]) -> Result<serde_json::Value> {
        let body = self.request(kind, guild_ids, None);
        let response: BackupResponse = self
            .http
            .get(&self.url)
            .timeout(Duration::from_secs(30))
            .query(&body)
            .send()
            .await?
            .json()
            .await?;
        if response.status != 200 {
            bail!("el servidor de respaldo respondió {}", response.status);
        }
        Ok(response.data)
    }

    pub async fn fetch_statuses(&self, guild_ids: &[u64]) -> Result<HashMap<String, GuildStatus>> {
        Ok(decode_statuses(self.get(BackupKind::Status, guild_ids).await?))
    }

    pub async fn fetch_queues(&self, guild_ids: &[u64]) -> Result<HashMap<String, YmxFormat>> {
        Ok(decode_queues(self.get(BackupKind::Queue, guild_ids).await?))
    }

    /// Restaura colas y estados de las guilds indicadas
    pub async fn restore(&self, guild_ids: &[u64]) -> Result<()> {
        if guild_ids.is_empty() {
            return Ok(());
        }
        let queues = self.fetch_queues(guild_ids).await?;
        let statuses = self.fetch_statuses(guild_ids).await?;
        info!("♻️ Restaurando {} colas y {} estados", queues.len(), statuses.len());

        for guild_id in guild_ids {
            let key = guild_id.to_string();
            let container = self.registry.get_or_create(*guild_id);
            if let Some(ymx) = queues.get(&key) {
                match container.import_queue(ymx).await {
                    Ok(count) => debug!("cola restaurada para {}: {} canciones", guild_id, count),
                    Err(e) => warn!("⚠️ No se pudo restaurar la cola de {}: {}", guild_id, e),
                }
            }
            if let Some(status) = statuses.get(&key) {
                self.previous_statuses.insert(*guild_id, status.encode());
                container.import_status(status.clone()).await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_codec() {
        let status = GuildStatus {
            voice_channel: "123".into(),
            bound_channel: "456".into(),
            loop_enabled: true,
            queue_loop_enabled: false,
            add_related: true,
            equally_playback: false,
            volume: 80,
        };
        assert_eq!(status.encode(), "123:456:1:0:1:0:80");
        assert_eq!(GuildStatus::decode(&status.encode()), Some(status));
        assert_eq!(GuildStatus::decode("1:2:3"), None);
    }

    #[test]
    fn test_out_of_range_volume_falls_back() {
        assert_eq!(GuildStatus::decode("0:1:0:0:0:0:500").unwrap().volume, FALLBACK_VOLUME);
        assert_eq!(GuildStatus::decode("0:1:0:0:0:0:abc").unwrap().volume, FALLBACK_VOLUME);
        assert_eq!(GuildStatus::decode("0:1:0:0:0:0:200").unwrap().volume, 200);
    }

    #[test]
    fn test_request_shape() {
        let request = BackupRequest {
            token: "secret",
            guildid: "1,2".into(),
            data: None,
            kind: BackupKind::Status,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({"token": "secret", "guildid": "1,2", "type": "j"})
        );
    }

    #[test]
    fn test_queue_payload_is_url_encoded_json() {
        let mut queues = HashMap::new();
        queues.insert(
            "42".to_string(),
            YmxFormat {
                version: crate::guild::YMX_VERSION,
                data: Vec::new(),
            },
        );
        let payload: HashMap<String, String> = serde_json::from_str(&encode_queues(&queues).unwrap()).unwrap();
        let decoded = urlencoding::decode(&payload["42"]).unwrap();
        assert_eq!(decoded, r#"{"version":5,"data":[]}"#);
    }

    #[test]
    fn test_decode_responses_skip_invalid_entries() {
        let statuses = decode_statuses(serde_json::json!({"1": "0:9:0:1:0:0:100", "2": "bad"}));
        assert_eq!(statuses.len(), 1);
        assert!(statuses["1"].queue_loop_enabled);

        let queues = decode_queues(serde_json::json!({"1": r#"{"version":5,"data":[]}"#, "2": "{"}));
        assert_eq!(queues.len(), 1);
        assert_eq!(queues["1"].version, 5);
    }
}
