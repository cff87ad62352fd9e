use anyhow::Result;
use serenity::{http::Http, model::gateway::GatewayIntents, model::id::GuildId, Client};
use songbird::{SerenityInit, Songbird};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};

mod audio;
mod backup;
mod bot;
mod config;
mod error;
mod guild;
mod sources;
mod ui;

use crate::audio::stream::{FfmpegStreamResolver, StreamResolver};
use crate::audio::transport::{SongbirdTransport, VoiceTransport};
use crate::backup::HttpBackupper;
use crate::bot::SimpleMusicBot;
use crate::config::Config;
use crate::guild::{GuildDataContainer, GuildRegistry};
use crate::sources::{Resolver, SourceContext};

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("simple_music=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Simple Music v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Config::load()?);

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }
    info!("{}", config.summary());

    let sources = SourceContext::new(config.clone());
    let songbird = Songbird::serenity();

    let streams: Arc<dyn StreamResolver> =
        Arc::new(FfmpegStreamResolver::new(config.ffmpeg_path.clone()));
    let voice = songbird.clone();
    let registry = Arc::new(GuildRegistry::new(
        Resolver::new(sources.clone()),
        streams,
        move |guild_id| -> Arc<dyn VoiceTransport> {
            Arc::new(SongbirdTransport::new(voice.clone(), GuildId::new(guild_id)))
        },
    ));

    let backupper = HttpBackupper::new(&config, sources.http.clone(), registry.clone()).map(Arc::new);

    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let handler = SimpleMusicBot::new(config.clone(), registry.clone(), backupper.clone());
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    attach_containers(client.http.clone(), registry.clone(), backupper.clone());

    if let Some(backupper) = backupper {
        let interval = Duration::from_secs(config.tick_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                backupper.tick().await;
            }
        });
    }

    // Manejar shutdown graceful
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {:?}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        shard_manager.shutdown_all().await;
    });

    info!("🚀 Bot iniciado exitosamente");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    Ok(())
}

/// Conecta el notificador y el backup a cada contenedor nuevo
fn attach_containers(
    http: Arc<Http>,
    registry: Arc<GuildRegistry>,
    backupper: Option<Arc<HttpBackupper>>,
) {
    let mut created = registry.subscribe();
    tokio::spawn(async move {
        let mut attached = HashSet::new();
        let mut attach = |container: Arc<GuildDataContainer>| {
            if !attached.insert(container.guild_id()) {
                return;
            }
            bot::events::spawn_notifier(http.clone(), container.clone());
            if let Some(backupper) = &backupper {
                backupper.watch(container.guild_id(), container.queue().subscribe());
            }
        };
        loop {
            match created.recv().await {
                Ok(container) => attach(container),
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    registry.all().into_iter().for_each(&mut attach);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn health_check(config: &Config) -> Result<()> {
    // Verificar dependencias críticas
    let yt_dlp = async_process::Command::new(&config.ytdlp_path)
        .arg("--version")
        .output()
        .await?;

    let ffmpeg = async_process::Command::new(&config.ffmpeg_path)
        .arg("-version")
        .output()
        .await?;

    if yt_dlp.status.success() && ffmpeg.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Dependencias faltantes");
    }
}
