use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identificadores de servicio reconocidos por el resolver.
pub const KNOWN_SOURCES: [&str; 11] = [
    "youtube",
    "custom",
    "fs",
    "soundcloud",
    "spotify",
    "googledrive",
    "streamable",
    "bestdori",
    "hibiki",
    "niconico",
    "twitter",
];

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub application_id: u64,
    pub guild_id: Option<u64>, // Para comandos de desarrollo

    // Audio
    pub default_volume: u16,
    pub max_queue_size: usize,
    pub idle_timeout_secs: u64,

    // Fuentes
    pub disabled_sources: Vec<String>,
    pub enable_bestdori: bool,
    pub enable_hibiki: bool,
    pub spotify_client_id: Option<String>,
    pub spotify_client_secret: Option<String>,

    // Binarios externos
    pub ffmpeg_path: String,
    pub ytdlp_path: String,

    // Backup remoto
    pub backup_url: Option<String>,
    pub backup_token: Option<String>,
    pub tick_interval_secs: u64,

    // Paths
    pub data_dir: PathBuf,
}

impl Config {
    /// Carga la configuración: valores por defecto, `config.{toml,json}` opcional y
    /// variables de entorno (en ese orden de prioridad creciente).
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let settings = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::default()
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("disabled_sources"),
            )
            .build()?;

        let mut config: Config = settings.try_deserialize()?;
        config.disabled_sources = config
            .disabled_sources
            .iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        config.validate()?;

        Ok(config)
    }

    /// Valida los valores de configuración.
    ///
    /// # Validation Rules
    ///
    /// - Token y application id son obligatorios
    /// - El volumen debe estar entre 1 y 200
    /// - El tamaño de cola y los intervalos deben ser > 0
    /// - Los identificadores de `disabled_sources` deben ser conocidos
    pub fn validate(&self) -> Result<()> {
        if self.discord_token.trim().is_empty() {
            anyhow::bail!("DISCORD_TOKEN es obligatorio");
        }

        if self.application_id == 0 {
            anyhow::bail!("APPLICATION_ID es obligatorio");
        }

        if !(1..=200).contains(&self.default_volume) {
            anyhow::bail!("Default volume must be between 1 and 200, got: {}", self.default_volume);
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.idle_timeout_secs == 0 || self.tick_interval_secs == 0 {
            anyhow::bail!("Timeouts and tick interval must be greater than 0");
        }

        if let Some(unknown) = self
            .disabled_sources
            .iter()
            .find(|s| !KNOWN_SOURCES.contains(&s.as_str()))
        {
            anyhow::bail!("Unknown source in DISABLED_SOURCES: {}", unknown);
        }

        Ok(())
    }

    pub fn is_disabled_source(&self, id: &str) -> bool {
        self.disabled_sources.iter().any(|s| s == id)
    }

    pub fn spotify_available(&self) -> bool {
        self.spotify_client_id.is_some() && self.spotify_client_secret.is_some()
    }

    pub fn backup_available(&self) -> bool {
        self.backup_url.is_some() && self.backup_token.is_some()
    }

    /// Resumen seguro (sin tokens) para logging.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: App ID {} (Guild: {})\n  \
            Audio: {} vol, {} max queue, {}s idle timeout\n  \
            Sources: disabled={:?}, bestdori={}, hibiki={}, spotify={}\n  \
            Backup: {}",
            self.application_id,
            self.guild_id.map_or("global".to_string(), |id| id.to_string()),
            self.default_volume,
            self.max_queue_size,
            self.idle_timeout_secs,
            self.disabled_sources,
            self.enable_bestdori,
            self.enable_hibiki,
            self.spotify_available(),
            if self.backup_available() { "enabled" } else { "disabled" },
        )
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (sin valores por defecto, deben proveerse)
            discord_token: String::new(),
            application_id: 0,
            guild_id: None,

            default_volume: 100,
            max_queue_size: 999,
            idle_timeout_secs: 10 * 60,

            disabled_sources: Vec::new(),
            enable_bestdori: false,
            enable_hibiki: false,
            spotify_client_id: None,
            spotify_client_secret: None,

            ffmpeg_path: "ffmpeg".to_string(),
            ytdlp_path: "yt-dlp".to_string(),

            backup_url: None,
            backup_token: None,
            tick_interval_secs: 60,

            data_dir: "./data".into(),
        }
    }
}
