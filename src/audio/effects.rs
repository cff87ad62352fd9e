use serde::{Deserialize, Serialize};
use tracing::info;

/// Efectos disponibles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    BassBoost,
    Reverb,
    LoudnessEq,
}

impl Effect {
    pub const ALL: [Effect; 3] = [Effect::BassBoost, Effect::Reverb, Effect::LoudnessEq];

    pub fn id(&self) -> &'static str {
        match self {
            Effect::BassBoost => "bass_boost",
            Effect::Reverb => "reverb",
            Effect::LoudnessEq => "loudness_eq",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.id() == id)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Effect::BassBoost => "Bass Boost",
            Effect::Reverb => "Reverb",
            Effect::LoudnessEq => "Loudness Eq",
        }
    }

    /// Filtro de ffmpeg correspondiente
    fn filter(&self) -> &'static str {
        match self {
            Effect::BassBoost => "bass=g=10",
            Effect::Reverb => "aecho=1.0:0.7:20:0.5",
            Effect::LoudnessEq => "loudnorm=I=-16:TP=-1.5:LRA=11",
        }
    }
}

/// Preferencias de efectos de una guild
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectPrefs {
    pub bass_boost: bool,
    pub reverb: bool,
    pub loudness_eq: bool,
}

impl EffectPrefs {
    pub fn enabled(&self, effect: Effect) -> bool {
        match effect {
            Effect::BassBoost => self.bass_boost,
            Effect::Reverb => self.reverb,
            Effect::LoudnessEq => self.loudness_eq,
        }
    }

    /// Alterna un efecto; devuelve el nuevo estado
    pub fn toggle(&mut self, effect: Effect) -> bool {
        let slot = match effect {
            Effect::BassBoost => &mut self.bass_boost,
            Effect::Reverb => &mut self.reverb,
            Effect::LoudnessEq => &mut self.loudness_eq,
        };
        *slot = !*slot;
        info!("🎛️ Efecto {} → {}", effect.display_name(), *slot);
        *slot
    }

    pub fn is_active(&self) -> bool {
        Effect::ALL.iter().any(|e| self.enabled(*e))
    }

    /// Argumentos `-af` para ffmpeg (vacío sin efectos)
    pub fn ffmpeg_args(&self) -> Vec<String> {
        let filters: Vec<&str> = Effect::ALL
            .iter()
            .filter(|e| self.enabled(**e))
            .map(Effect::filter)
            .collect();
        if filters.is_empty() {
            Vec::new()
        } else {
            vec!["-af".to_string(), filters.join(",")]
        }
    }

    pub fn describe(&self) -> String {
        let active: Vec<&str> = Effect::ALL
            .iter()
            .filter(|e| self.enabled(**e))
            .map(Effect::display_name)
            .collect();
        if active.is_empty() {
            "Sin efectos".to_string()
        } else {
            active.join(", ")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ffmpeg_args() {
        let mut prefs = EffectPrefs::default();
        assert!(prefs.ffmpeg_args().is_empty());
        assert!(!prefs.is_active());

        assert!(prefs.toggle(Effect::BassBoost));
        prefs.toggle(Effect::LoudnessEq);
        assert_eq!(
            prefs.ffmpeg_args(),
            vec!["-af".to_string(), "bass=g=10,loudnorm=I=-16:TP=-1.5:LRA=11".to_string()]
        );
        assert_eq!(prefs.describe(), "Bass Boost, Loudness Eq");

        assert!(!prefs.toggle(Effect::BassBoost));
        assert_eq!(Effect::from_id("reverb"), Some(Effect::Reverb));
    }
}
