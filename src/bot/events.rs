//! Avisos del reproductor en el canal de texto enlazado a cada guild.

use anyhow::Result;
use serenity::{
    builder::{CreateEmbed, CreateMessage},
    http::Http,
    model::id::ChannelId,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::audio::events::PlayerEvent;
use crate::guild::GuildDataContainer;
use crate::ui::embeds;

/// Mensaje a publicar por un evento del reproductor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    NowPlaying,
    Warning { title: String, description: String },
    Error { title: String, description: String },
    Info(String),
}

/// Qué publicar (si algo) para cada evento
pub fn notice_for(event: &PlayerEvent) -> Option<Notice> {
    match event {
        PlayerEvent::Started { quiet: false, .. } => Some(Notice::NowPlaying),
        PlayerEvent::WaitingForLive { url, wait_secs } => Some(Notice::Info(format!(
            "⏳ El directo aún no empezó, reintentando en {}s: {}",
            wait_secs, url
        ))),
        PlayerEvent::Failed { url, error, will_skip: true } => Some(Notice::Warning {
            title: "Canción omitida".to_string(),
            description: format!("No se pudo reproducir {} tras varios intentos.\n`{}`", url, error),
        }),
        PlayerEvent::RateLimited { .. } => Some(Notice::Error {
            title: "Límite de peticiones".to_string(),
            description: "El servicio limitó las peticiones del bot (HTTP 429). \
                          La reproducción se detuvo; prueba de nuevo más tarde."
                .to_string(),
        }),
        PlayerEvent::IdleDisconnect => Some(Notice::Info(
            "👋 Me desconecté por inactividad".to_string(),
        )),
        _ => None,
    }
}

fn render(notice: Notice, container: &GuildDataContainer) -> Option<CreateMessage> {
    let message = CreateMessage::new();
    let embed: CreateEmbed = match notice {
        Notice::NowPlaying => {
            let head = container.queue().head()?;
            let effects = container.effects();
            let effects = if effects.is_active() { effects.describe() } else { String::new() };
            embeds::create_now_playing_embed(&head, container.player().volume(), &effects)
        }
        Notice::Warning { title, description } => embeds::create_warning_embed(&title, &description),
        Notice::Error { title, description } => embeds::create_error_embed(&title, &description),
        Notice::Info(text) => return Some(message.content(text)),
    };
    Some(message.embed(embed))
}

async fn publish(http: &Http, container: &GuildDataContainer, notice: Notice) -> Result<()> {
    let Some(channel) = container.bound_channel() else {
        debug!("guild {} sin canal enlazado", container.guild_id());
        return Ok(());
    };
    if let Some(message) = render(notice, container) {
        ChannelId::new(channel).send_message(http, message).await?;
    }
    Ok(())
}

/// Publica los avisos del reproductor de `container` hasta que se cierre su canal
pub fn spawn_notifier(http: Arc<Http>, container: Arc<GuildDataContainer>) {
    let mut events = container.player().subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("notificador atrasado, {} eventos omitidos", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if let Some(notice) = notice_for(&event) {
                if let Err(e) = publish(&http, &container, notice).await {
                    warn!("⚠️ No se pudo publicar aviso en guild {}: {:?}", container.guild_id(), e);
                }
            }
        }
    });
}
