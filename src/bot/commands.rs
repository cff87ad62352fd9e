use anyhow::Result;
use serenity::{
    builder::{CreateCommand, CreateCommandOption},
    model::{application::Command, application::CommandOptionType, id::GuildId},
    prelude::Context,
};

use crate::audio::effects::Effect;
use crate::audio::player::{MAX_VOLUME, MIN_VOLUME};

/// Registra comandos globales
pub async fn register_global_commands(ctx: &Context) -> Result<()> {
    Command::set_global_commands(&ctx.http, all_commands()).await?;
    Ok(())
}

/// Registra comandos para una guild específica (desarrollo)
pub async fn register_guild_commands(ctx: &Context, guild_id: GuildId) -> Result<()> {
    guild_id.set_commands(&ctx.http, all_commands()).await?;
    Ok(())
}

pub fn all_commands() -> Vec<CreateCommand> {
    vec![
        play_command(),
        join_command(),
        leave_command(),
        pause_command(),
        resume_command(),
        skip_command(),
        stop_command(),
        rewind_command(),
        seek_command(),
        queue_command(),
        nowplaying_command(),
        loop_command(),
        shuffle_command(),
        clear_command(),
        remove_command(),
        move_command(),
        volume_command(),
        effect_command(),
        related_command(),
        equally_command(),
        cancel_command(),
    ]
}

// Comandos de reproducción

fn play_command() -> CreateCommand {
    CreateCommand::new("play")
        .description("Reproduce una canción o playlist")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::String,
                "query",
                "URL o término de búsqueda",
            )
            .required(true),
        )
        .add_option(CreateCommandOption::new(
            CommandOptionType::Boolean,
            "first",
            "Agregar al principio de la cola",
        ))
}

fn pause_command() -> CreateCommand {
    CreateCommand::new("pause").description("Pausa la reproducción actual")
}

fn resume_command() -> CreateCommand {
    CreateCommand::new("resume").description("Reanuda la reproducción pausada")
}

fn skip_command() -> CreateCommand {
    CreateCommand::new("skip").description("Salta a la siguiente canción")
}

fn stop_command() -> CreateCommand {
    CreateCommand::new("stop").description("Detiene la reproducción sin vaciar la cola")
}

fn rewind_command() -> CreateCommand {
    CreateCommand::new("rewind").description("Vuelve al inicio de la canción actual")
}

fn seek_command() -> CreateCommand {
    CreateCommand::new("seek")
        .description("Salta a una posición de la canción actual")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::String,
                "position",
                "Posición (ej: 1:30, 90, 2m10s)",
            )
            .required(true),
        )
}

// Comandos de cola

fn queue_command() -> CreateCommand {
    CreateCommand::new("queue")
        .description("Muestra la cola de reproducción")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "page", "Número de página")
                .min_int_value(1),
        )
}

fn nowplaying_command() -> CreateCommand {
    CreateCommand::new("nowplaying").description("Muestra información de la canción actual")
}

fn loop_command() -> CreateCommand {
    CreateCommand::new("loop")
        .description("Configura el modo de repetición")
        .add_option(
            CreateCommandOption::new(CommandOptionType::String, "mode", "Modo de repetición")
                .add_string_choice("Desactivar", "off")
                .add_string_choice("Canción", "track")
                .add_string_choice("Cola", "queue")
                .add_string_choice("Una vez", "once")
                .required(true),
        )
}

fn shuffle_command() -> CreateCommand {
    CreateCommand::new("shuffle").description("Mezcla la cola de reproducción")
}

fn clear_command() -> CreateCommand {
    CreateCommand::new("clear")
        .description("Limpia la cola de reproducción")
        .add_option(CreateCommandOption::new(
            CommandOptionType::User,
            "user",
            "Quitar solo las canciones de este usuario",
        ))
}

fn remove_command() -> CreateCommand {
    CreateCommand::new("remove")
        .description("Quita una canción de la cola")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "index", "Posición en la cola")
                .min_int_value(1)
                .required(true),
        )
}

fn move_command() -> CreateCommand {
    CreateCommand::new("move")
        .description("Mueve una canción dentro de la cola")
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "from", "Posición actual")
                .min_int_value(1)
                .required(true),
        )
        .add_option(
            CreateCommandOption::new(CommandOptionType::Integer, "to", "Nueva posición")
                .min_int_value(1)
                .required(true),
        )
}

// Comandos de audio

fn volume_command() -> CreateCommand {
    CreateCommand::new("volume")
        .description("Ajusta el volumen de reproducción")
        .add_option(
            CreateCommandOption::new(
                CommandOptionType::Integer,
                "level",
                format!("Nivel de volumen ({}-{})", MIN_VOLUME, MAX_VOLUME),
            )
            .min_int_value(u64::from(MIN_VOLUME))
            .max_int_value(u64::from(MAX_VOLUME)),
        )
}

fn effect_command() -> CreateCommand {
    let option = Effect::ALL.iter().fold(
        CreateCommandOption::new(CommandOptionType::String, "type", "Tipo de efecto")
            .required(true),
        |option, effect| option.add_string_choice(effect.display_name(), effect.id()),
    );
    CreateCommand::new("effect")
        .description("Activa/desactiva efectos de audio (desde la próxima canción)")
        .add_option(option)
}

fn related_command() -> CreateCommand {
    CreateCommand::new("related")
        .description("Agrega canciones relacionadas cuando la cola se vacía")
}

fn equally_command() -> CreateCommand {
    CreateCommand::new("equallyplayback")
        .description("Alterna las canciones de cada usuario de forma equitativa")
}

fn cancel_command() -> CreateCommand {
    CreateCommand::new("cancel").description("Cancela la carga de playlists en curso")
}

// Comandos de conexión

fn join_command() -> CreateCommand {
    CreateCommand::new("join").description("Conecta el bot a tu canal de voz")
}

fn leave_command() -> CreateCommand {
    CreateCommand::new("leave").description("Desconecta el bot del canal de voz")
}
