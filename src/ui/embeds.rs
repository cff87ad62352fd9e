use serenity::{
    all::Timestamp,
    builder::{CreateEmbed, CreateEmbedFooter},
};
use std::time::Duration;

use crate::audio::queue::QueueEntry;

/// Paleta de colores estandarizada para el bot
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
    pub const ERROR_RED: Colour = Colour::from_rgb(220, 53, 69);
    pub const WARNING_ORANGE: Colour = Colour::from_rgb(255, 193, 7);
    pub const INFO_BLUE: Colour = Colour::from_rgb(52, 144, 220);
    pub const MUSIC_PURPLE: Colour = Colour::from_rgb(138, 43, 226);
    pub const NEUTRAL_GRAY: Colour = Colour::from_rgb(108, 117, 125);
}

/// Footer estandarizado para todos los embeds
const STANDARD_FOOTER: &str = "🎵 Simple Music";

/// Canciones por página en `/queue`
pub const ITEMS_PER_PAGE: usize = 10;

/// Modos de repetición activos, para los embeds
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopFlags {
    pub track: bool,
    pub queue: bool,
    pub once: bool,
}

impl LoopFlags {
    fn icon(&self) -> &'static str {
        if self.track {
            "🔂"
        } else if self.once {
            "🔂¹"
        } else if self.queue {
            "🔁"
        } else {
            "▶️"
        }
    }
}

fn source_field(entry: &QueueEntry) -> String {
    match entry.basic_info.service_identifier() {
        "youtube" => "YouTube",
        "soundcloud" => "SoundCloud",
        "spotify" => "Spotify",
        "niconico" => "NicoNico",
        "twitter" => "Twitter",
        "googledrive" => "Google Drive",
        "streamable" => "Streamable",
        "bestdori" => "Bestdori",
        "hibiki" => "Hibiki",
        "fs" => "Archivo local",
        _ => "URL directa",
    }
    .to_string()
}

fn duration_field(entry: &QueueEntry) -> String {
    if entry.basic_info.is_live() {
        "🔴 En vivo".to_string()
    } else {
        format_duration(Duration::from_secs(entry.basic_info.length_seconds()))
    }
}

/// Crea un embed para mostrar la canción actual
pub fn create_now_playing_embed(entry: &QueueEntry, volume: u16, effects: &str) -> CreateEmbed {
    let source = &entry.basic_info;
    let mut embed = CreateEmbed::default()
        .title("🎵 Reproduciendo Ahora")
        .description(format!("**{}**", source.title()))
        .color(colors::SUCCESS_GREEN)
        .field("⏱️ Duración", duration_field(entry), true)
        .field("👤 Solicitado por", &entry.additional_info.display_name, true)
        .field("🔗 Fuente", source_field(entry), true)
        .field("🔊 Volumen", format!("{}%", volume), true);

    if !effects.is_empty() {
        embed = embed.field("🎛️ Efectos", effects, true);
    }
    if let Some(channel) = source.snapshot().channel {
        embed = embed.field("🎤 Canal", channel, true);
    }
    if let Some(thumbnail) = source.thumbnail() {
        embed = embed.thumbnail(thumbnail);
    }

    embed
        .url(source.url())
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Crea un embed para mostrar que se agregó una canción
pub fn create_track_added_embed(entry: &QueueEntry, position: usize) -> CreateEmbed {
    let source = &entry.basic_info;
    let mut embed = CreateEmbed::default()
        .title("✅ Canción Agregada")
        .description(format!("**{}** se agregó a la cola", source.title()))
        .color(colors::SUCCESS_GREEN)
        .field("⏱️ Duración", duration_field(entry), true)
        .field("📍 Posición", position.to_string(), true)
        .field("🔗 Fuente", source_field(entry), true);

    if let Some(thumbnail) = source.thumbnail() {
        embed = embed.thumbnail(thumbnail);
    }

    embed
        .url(source.url())
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(
            "🎵 Se reproducirá automáticamente si no hay música sonando",
        ))
}

/// Crea un embed para mostrar que una playlist fue agregada
pub fn create_playlist_added_embed(track_count: usize) -> CreateEmbed {
    let description = if track_count == 1 {
        "Se agregó **1 canción** de la playlist a la cola".to_string()
    } else {
        format!("Se agregaron **{} canciones** de la playlist a la cola", track_count)
    };

    CreateEmbed::default()
        .title("📋 Playlist Agregada")
        .description(description)
        .color(colors::MUSIC_PURPLE)
        .field("📊 Canciones agregadas", track_count.to_string(), true)
        .footer(CreateEmbedFooter::new(
            "🎵 La reproducción comenzará automáticamente • Usa /queue para ver todas las canciones",
        ))
        .timestamp(Timestamp::now())
}

/// Número de páginas de una cola de `total` entradas (la actual no cuenta)
pub fn page_count(total: usize) -> usize {
    total.saturating_sub(1).div_ceil(ITEMS_PER_PAGE).max(1)
}

/// Crea un embed para mostrar la cola de reproducción
pub fn create_queue_embed(
    entries: &[QueueEntry],
    page: usize,
    loops: LoopFlags,
    playing: bool,
) -> CreateEmbed {
    let mut embed = CreateEmbed::default()
        .title("📋 Cola de Reproducción")
        .color(colors::INFO_BLUE);

    let Some((current, upcoming)) = entries.split_first() else {
        return embed
            .description("😴 **La cola está vacía**\n\n💡 Usa `/play <url>` para agregar música")
            .color(colors::NEUTRAL_GRAY)
            .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
            .timestamp(Timestamp::now());
    };

    let heading = if playing {
        format!("{} Reproduciendo", loops.icon())
    } else {
        "⏸️ Siguiente".to_string()
    };
    embed = embed.field(
        heading,
        format!(
            "**{}** `[{}]` • {}",
            current.basic_info.title(),
            duration_field(current),
            current.additional_info.display_name
        ),
        false,
    );

    let pages = page_count(entries.len());
    let page = page.clamp(1, pages);
    let start = (page - 1) * ITEMS_PER_PAGE;
    let listing: String = upcoming
        .iter()
        .enumerate()
        .skip(start)
        .take(ITEMS_PER_PAGE)
        .map(|(i, entry)| {
            format!(
                "**{}**. {} `[{}]`\n",
                i + 1,
                entry.basic_info.title(),
                duration_field(entry)
            )
        })
        .collect();
    if !listing.is_empty() {
        embed = embed.field("Próximas canciones", listing, false);
    }

    let total_seconds: u64 = entries.iter().map(|e| e.basic_info.length_seconds()).sum();
    let mut info = format!("**Total:** {} canciones", entries.len());
    if total_seconds > 0 {
        info.push_str(&format!(
            " • **Duración:** {}",
            format_duration(Duration::from_secs(total_seconds))
        ));
    }
    if loops.queue {
        info.push_str(" • 🔁 **Repetir cola**");
    }
    embed = embed.field("Información", info, false);

    embed
        .footer(CreateEmbedFooter::new(format!(
            "Página {} de {} • Simple Music",
            page, pages
        )))
        .timestamp(Timestamp::now())
}

/// Crea un embed de error
pub fn create_error_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("❌ {}", title))
        .description(description)
        .color(colors::ERROR_RED)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Crea un embed de advertencia
pub fn create_warning_embed(title: &str, description: &str) -> CreateEmbed {
    CreateEmbed::default()
        .title(format!("⚠️ {}", title))
        .description(description)
        .color(colors::WARNING_ORANGE)
        .timestamp(Timestamp::now())
        .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Formatea una duración en formato legible
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}
