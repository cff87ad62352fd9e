//! # Bot Module
//!
//! Discord glue for Simple Music.
//!
//! - [`commands`]: slash command definitions and registration
//! - [`handlers`]: command handlers, each resolving the guild container and
//!   calling into its queue / player
//! - [`events`]: player-event notifier that posts to the bound text channel
//!
//! [`SimpleMusicBot`] implements Serenity's [`EventHandler`]. On the first
//! `ready` it registers commands and restores queues and statuses from the
//! HTTP backup, if one is configured.

use anyhow::Result;
use serenity::{
    all::{Context, EventHandler, GuildId, Interaction, Ready, VoiceState},
    async_trait,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

pub mod commands;
pub mod events;
pub mod handlers;

use crate::{backup::HttpBackupper, config::Config, guild::GuildRegistry};

pub struct SimpleMusicBot {
    config: Arc<Config>,
    pub registry: Arc<GuildRegistry>,
    backupper: Option<Arc<HttpBackupper>>,
    /// La restauración se hace solo en el primer `ready`
    restored: AtomicBool,
}

impl SimpleMusicBot {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<GuildRegistry>,
        backupper: Option<Arc<HttpBackupper>>,
    ) -> Self {
        Self {
            config,
            registry,
            backupper,
            restored: AtomicBool::new(false),
        }
    }

    /// Registra los comandos globales, o solo en `guild_id` si está configurada.
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registrando comandos slash...");

        match self.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::new(guild_id);
                info!("🏠 Registrando comandos para guild específica: {}", guild_id);

                if !ctx.cache.guilds().contains(&guild_id) {
                    warn!("⚠️ El bot no está en la guild especificada: {}", guild_id);
                    return Ok(());
                }

                commands::register_guild_commands(ctx, guild_id).await.map_err(|e| {
                    error!("❌ Error registrando comandos de guild: {:?}", e);
                    anyhow::anyhow!("No se pudieron registrar comandos de guild. Verifica que el bot tenga permisos de 'applications.commands' en la guild.")
                })?;
                info!("✅ Comandos de guild registrados para: {}", guild_id);
            }
            None => {
                info!("🌐 Registrando comandos globalmente");
                commands::register_global_commands(ctx).await.map_err(|e| {
                    error!("❌ Error registrando comandos globales: {:?}", e);
                    anyhow::anyhow!("No se pudieron registrar comandos globales. Verifica que el bot tenga permisos de 'applications.commands'.")
                })?;
                info!("✅ Comandos globales registrados");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl EventHandler for SimpleMusicBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error al registrar comandos: {:?}", e);
        }

        if self.restored.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(backupper) = self.backupper.clone() {
            let guild_ids: Vec<u64> = ready.guilds.iter().map(|g| g.id.get()).collect();
            tokio::spawn(async move {
                info!("📥 Restaurando {} guilds desde el backup", guild_ids.len());
                if let Err(e) = backupper.restore(&guild_ids).await {
                    error!("❌ Error restaurando el backup: {:?}", e);
                }
            });
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command_interaction) = interaction {
            if let Err(e) = handlers::handle_command(&ctx, command_interaction, self).await {
                error!("Error manejando comando: {:?}", e);
            }
        }
    }

    /// Si el bot fue desconectado desde fuera, detiene la reproducción de la guild.
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id || old.is_none() || new.channel_id.is_some() {
            return;
        }
        let Some(guild_id) = new.guild_id else {
            return;
        };
        info!("🔌 Bot desconectado en guild {}", guild_id);

        if let Some(container) = self.registry.get(guild_id.get()) {
            container.cancel_all();
            container.player().disconnect().await;
        }
    }
}
