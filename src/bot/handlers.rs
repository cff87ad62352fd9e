use anyhow::Result;
use async_trait::async_trait;
use serenity::{
    builder::{CreateInteractionResponse, CreateInteractionResponseMessage, EditInteractionResponse},
    http::Http,
    model::{
        application::{CommandDataOptionValue, CommandInteraction},
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use crate::{
    audio::{
        effects::Effect,
        queue::{AddedBy, PlaylistProgress},
    },
    bot::SimpleMusicBot,
    guild::{GuildDataContainer, PlayOutcome},
    sources::youtube,
    ui::embeds::{self, LoopFlags},
};

/// Maneja comandos slash
pub async fn handle_command(
    ctx: &Context,
    command: CommandInteraction,
    bot: &SimpleMusicBot,
) -> Result<()> {
    let guild_id = command
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Comando usado fuera de un servidor"))?;

    info!(
        "📝 Comando /{} usado por {} en guild {}",
        command.data.name, command.user.name, guild_id
    );

    let container = bot.registry.get_or_create(guild_id.get());
    match command.data.name.as_str() {
        "play" => return handle_play(ctx, &command, &container).await,
        "join" => return handle_join(ctx, &command, &container).await,
        "seek" => return handle_seek(ctx, &command, &container).await,
        name if is_slow_control(name) => return handle_slow_control(ctx, &command, &container).await,
        _ => {}
    }

    let reply = match command.data.name.as_str() {
        "leave" => {
            container.cancel_all();
            container.player().disconnect().await;
            "👋 Desconectado del canal de voz".to_string()
        }
        "pause" => {
            if container.player().pause() {
                "⏸️ Reproducción pausada".to_string()
            } else {
                "❌ No hay nada reproduciéndose".to_string()
            }
        }
        "resume" => {
            if container.player().resume() {
                "▶️ Reproducción reanudada".to_string()
            } else {
                "❌ No hay nada en pausa".to_string()
            }
        }
        "stop" => {
            if container.player().stop() {
                "⏹️ Reproducción detenida".to_string()
            } else {
                "❌ No hay nada reproduciéndose".to_string()
            }
        }
        "queue" => {
            let page = option_i64(&command, "page").unwrap_or(1).max(1) as usize;
            let queue = container.queue();
            let loops = LoopFlags {
                track: queue.loop_enabled(),
                queue: queue.queue_loop_enabled(),
                once: queue.once_loop_enabled(),
            };
            let embed = embeds::create_queue_embed(
                &queue.entries(),
                page,
                loops,
                container.player().is_playing(),
            );
            command
                .create_response(
                    &ctx.http,
                    CreateInteractionResponse::Message(
                        CreateInteractionResponseMessage::new().embed(embed),
                    ),
                )
                .await?;
            return Ok(());
        }
        "nowplaying" => {
            let head = container
                .queue()
                .head()
                .filter(|_| container.player().is_playing());
            let Some(head) = head else {
                return respond(ctx, &command, "❌ No hay nada reproduciéndose actualmente", true).await;
            };
            let effects = container.effects();
            let effects = if effects.is_active() { effects.describe() } else { String::new() };
            let position = container.player().current_time().await / 1000;
            let embed = embeds::create_now_playing_embed(&head, container.player().volume(), &effects)
                .field(
                    "⏯️ Posición",
                    embeds::format_duration(Duration::from_secs(position)),
                    true,
                );
            command
                .create_response(
                    &ctx.http,
                    CreateInteractionResponse::Message(
                        CreateInteractionResponseMessage::new().embed(embed),
                    ),
                )
                .await?;
            return Ok(());
        }
        "loop" => {
            let mode = option_str(&command, "mode").unwrap_or("off");
            let queue = container.queue();
            queue.set_loop_enabled(mode == "track");
            queue.set_queue_loop_enabled(mode == "queue");
            queue.set_once_loop_enabled(mode == "once");
            match mode {
                "track" => "🔂 Repetir canción activado",
                "queue" => "🔁 Repetir cola activado",
                "once" => "🔂 La canción actual se repetirá una vez",
                _ => "➡️ Repetición desactivada",
            }
            .to_string()
        }
        "shuffle" => {
            container.queue().shuffle();
            "🔀 Cola mezclada".to_string()
        }
        "clear" => match option_user(&command, "user") {
            Some(user) => {
                let removed = container.queue().remove_by_user(&user.to_string());
                format!("🗑️ {} canciones de <@{}> eliminadas", removed, user)
            }
            None => {
                container.queue().remove_all();
                "🗑️ Cola limpiada".to_string()
            }
        },
        "remove" => {
            let index = option_i64(&command, "index").unwrap_or(0).max(0) as usize;
            match container.queue().remove_at(index) {
                Ok(entry) => format!("🗑️ Eliminada: **{}**", entry.basic_info.title()),
                Err(e) => format!("❌ {}", e),
            }
        }
        "move" => {
            let from = option_i64(&command, "from").unwrap_or(0).max(0) as usize;
            let to = option_i64(&command, "to").unwrap_or(0).max(0) as usize;
            match container.queue().move_entry(from, to) {
                Ok(()) => format!("↕️ Canción movida de {} a {}", from, to),
                Err(e) => format!("❌ {}", e),
            }
        }
        "volume" => match option_i64(&command, "level") {
            Some(level) => {
                let level = u16::try_from(level).unwrap_or(u16::MAX);
                if container.player().set_volume(level) {
                    format!("🔊 Volumen ajustado a {}%", container.player().volume())
                } else {
                    format!(
                        "🔊 Volumen ajustado a {}% (se aplicará desde la próxima canción)",
                        container.player().volume()
                    )
                }
            }
            None => format!("🔊 Volumen actual: {}%", container.player().volume()),
        },
        "effect" => match option_str(&command, "type").and_then(Effect::from_id) {
            Some(effect) => {
                let enabled = container.toggle_effect(effect);
                format!(
                    "🎛️ {} {} (se aplicará desde la próxima canción)",
                    effect.display_name(),
                    if enabled { "activado" } else { "desactivado" }
                )
            }
            None => "❌ Efecto desconocido".to_string(),
        },
        "related" => {
            let enabled = !container.add_related();
            container.set_add_related(enabled);
            if enabled {
                "🎲 Canciones relacionadas activadas".to_string()
            } else {
                "🎲 Canciones relacionadas desactivadas".to_string()
            }
        }
        "equallyplayback" => {
            let enabled = !container.equally_playback();
            container.set_equally_playback(enabled);
            if enabled {
                container.queue().sort_with_added_by();
                "⚖️ Reproducción equitativa activada".to_string()
            } else {
                "⚖️ Reproducción equitativa desactivada".to_string()
            }
        }
        "cancel" => {
            if container.cancel_all() {
                "🛑 Carga cancelada".to_string()
            } else {
                "❌ No hay cargas en curso".to_string()
            }
        }
        _ => return respond(ctx, &command, "❌ Comando no reconocido", true).await,
    };

    respond(ctx, &command, reply, false).await
}

async fn handle_play(
    ctx: &Context,
    command: &CommandInteraction,
    container: &Arc<GuildDataContainer>,
) -> Result<()> {
    let query = option_str(command, "query")
        .ok_or_else(|| anyhow::anyhow!("Query no proporcionado"))?
        .trim()
        .to_string();
    let first = option_bool(command, "first").unwrap_or(false);

    // Defer la respuesta ya que puede tomar tiempo
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    if let Err(e) = connect(ctx, command, container).await {
        return edit(ctx, command, embeds::create_error_embed("Sin conexión de voz", &e.to_string())).await;
    }

    let url = if Url::parse(&query).is_ok() {
        query.clone()
    } else {
        let resolver_ctx = container.queue().resolver().context();
        match youtube::search(resolver_ctx, &query, 1).await {
            Ok(results) => match results.into_iter().next() {
                Some(found) => found.url,
                None => {
                    return edit(
                        ctx,
                        command,
                        embeds::create_error_embed("Sin resultados", &format!("No se encontró `{}`", query)),
                    )
                    .await
                }
            },
            Err(e) => {
                warn!("⚠️ Búsqueda fallida para {}: {}", query, e);
                return edit(ctx, command, embeds::create_error_embed("Error de búsqueda", &e.to_string())).await;
            }
        }
    };

    let progress = InteractionProgress {
        http: ctx.http.clone(),
        command: command.clone(),
    };
    let added_by = AddedBy::new(display_name(command), command.user.id.to_string());
    let embed = match container.play_from_url(&url, added_by, first, false, &progress).await {
        Ok(PlayOutcome::Single(added)) => embeds::create_track_added_embed(&added.entry, added.index),
        Ok(PlayOutcome::Playlist { added }) => embeds::create_playlist_added_embed(added),
        Err(e) => {
            warn!("⚠️ /play {} falló: {:?}", url, e);
            embeds::create_error_embed("No se pudo agregar", &e.to_string())
        }
    };
    edit(ctx, command, embed).await
}

async fn handle_join(
    ctx: &Context,
    command: &CommandInteraction,
    container: &Arc<GuildDataContainer>,
) -> Result<()> {
    match connect(ctx, command, container).await {
        Ok(true) => {
            container.player().play(0, false).await;
            respond(ctx, command, "🔊 Conectado al canal de voz", false).await
        }
        Ok(false) => respond(ctx, command, "🔊 Ya estoy en tu canal de voz", true).await,
        Err(e) => respond(ctx, command, format!("❌ {}", e), true).await,
    }
}

async fn handle_seek(
    ctx: &Context,
    command: &CommandInteraction,
    container: &Arc<GuildDataContainer>,
) -> Result<()> {
    let Some(position) = option_str(command, "position").and_then(parse_position) else {
        return respond(ctx, command, "❌ Posición inválida (ej: 1:30, 90, 2m10s)", true).await;
    };
    let Some(current) = container.player().current().filter(|_| container.player().is_playing()) else {
        return respond(ctx, command, "❌ No hay nada reproduciéndose", true).await;
    };
    if current.is_live() || (current.length_seconds() > 0 && position >= current.length_seconds()) {
        return respond(ctx, command, "❌ No se puede saltar a esa posición", true).await;
    }

    defer(ctx, command).await?;
    container.player().seek(position).await;
    command
        .edit_response(
            &ctx.http,
            EditInteractionResponse::new().content(format!(
                "⏩ Saltando a {}",
                embeds::format_duration(Duration::from_secs(position))
            )),
        )
        .await?;
    Ok(())
}

/// Controles que esperan a que la siguiente canción arranque
fn is_slow_control(name: &str) -> bool {
    matches!(name, "skip" | "rewind")
}

async fn handle_slow_control(
    ctx: &Context,
    command: &CommandInteraction,
    container: &Arc<GuildDataContainer>,
) -> Result<()> {
    if container.queue().is_empty() {
        return respond(ctx, command, "❌ La cola está vacía", true).await;
    }

    defer(ctx, command).await?;
    let content = if command.data.name == "skip" {
        container.player().skip().await;
        "⏭️ Canción saltada"
    } else {
        container.player().rewind().await;
        "⏪ Volviendo al inicio"
    };
    command
        .edit_response(&ctx.http, EditInteractionResponse::new().content(content))
        .await?;
    Ok(())
}

/// Une al bot al canal de voz del usuario y enlaza el canal de texto
async fn connect(
    ctx: &Context,
    command: &CommandInteraction,
    container: &Arc<GuildDataContainer>,
) -> Result<bool> {
    let guild_id = command
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Comando usado fuera de un servidor"))?;
    let channel = get_user_voice_channel(ctx, guild_id, command.user.id)?;
    let joined = container.join_voice_channel(channel.get()).await?;
    container.set_bound_channel(command.channel_id.get());
    Ok(joined)
}

/// Reporta el avance de una playlist editando la respuesta diferida
struct InteractionProgress {
    http: Arc<Http>,
    command: CommandInteraction,
}

#[async_trait]
impl PlaylistProgress for InteractionProgress {
    async fn report(&self, processed: usize, total: usize) {
        let edit = EditInteractionResponse::new()
            .content(format!("📋 Procesando playlist: {}/{}", processed, total));
        if let Err(e) = self.command.edit_response(&self.http, edit).await {
            warn!("⚠️ No se pudo reportar progreso: {}", e);
        }
    }
}

// Funciones auxiliares

async fn respond(
    ctx: &Context,
    command: &CommandInteraction,
    content: impl Into<String>,
    ephemeral: bool,
) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(ephemeral),
            ),
        )
        .await?;
    Ok(())
}

async fn defer(ctx: &Context, command: &CommandInteraction) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;
    Ok(())
}

async fn edit(
    ctx: &Context,
    command: &CommandInteraction,
    embed: serenity::builder::CreateEmbed,
) -> Result<()> {
    command
        .edit_response(&ctx.http, EditInteractionResponse::new().content("").embed(embed))
        .await?;
    Ok(())
}

fn option<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a CommandDataOptionValue> {
    command
        .data
        .options
        .iter()
        .find(|opt| opt.name == name)
        .map(|opt| &opt.value)
}

fn option_str<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a str> {
    option(command, name).and_then(|v| v.as_str())
}

fn option_i64(command: &CommandInteraction, name: &str) -> Option<i64> {
    option(command, name).and_then(|v| v.as_i64())
}

fn option_bool(command: &CommandInteraction, name: &str) -> Option<bool> {
    option(command, name).and_then(|v| v.as_bool())
}

fn option_user(command: &CommandInteraction, name: &str) -> Option<UserId> {
    option(command, name).and_then(|v| v.as_user_id())
}

fn display_name(command: &CommandInteraction) -> String {
    command
        .member
        .as_ref()
        .and_then(|m| m.nick.clone())
        .or_else(|| command.user.global_name.clone())
        .unwrap_or_else(|| command.user.name.clone())
}

fn get_user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Result<ChannelId> {
    let guild = guild_id
        .to_guild_cached(&ctx.cache)
        .ok_or_else(|| anyhow::anyhow!("Guild no encontrada en caché"))?;

    let channel_id = guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
        .ok_or_else(|| anyhow::anyhow!("Debes estar en un canal de voz"))?;

    Ok(channel_id)
}

/// Posición en segundos: `90`, `1:30`, `1:02:03` o duraciones humanas (`2m10s`)
pub fn parse_position(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.contains(':') {
        let parts: Vec<u64> = raw
            .split(':')
            .map(|p| p.parse::<u64>().ok())
            .collect::<Option<_>>()?;
        if parts.len() > 3 || parts.iter().skip(1).any(|p| *p >= 60) {
            return None;
        }
        return Some(parts.iter().fold(0, |acc, p| acc * 60 + p));
    }
    raw.parse::<u64>()
        .ok()
        .or_else(|| humantime::parse_duration(raw).ok().map(|d| d.as_secs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_position() {
        assert_eq!(parse_position("90"), Some(90));
        assert_eq!(parse_position("1:30"), Some(90));
        assert_eq!(parse_position("1:02:03"), Some(3723));
        assert_eq!(parse_position("2m 10s"), Some(130));
        assert_eq!(parse_position("1:75"), None);
        assert_eq!(parse_position("soon"), None);
    }

    #[test]
    fn test_track_changing_controls_are_deferred() {
        assert!(is_slow_control("skip"));
        assert!(is_slow_control("rewind"));
        assert!(!is_slow_control("pause"));
        assert!(!is_slow_control("stop"));
    }
}
