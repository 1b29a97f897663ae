use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt, str::FromStr};

/// Exponente de la curva de volumen perceptual (mismo que usa Discord)
const LOG_VOLUME_EXPONENT: f32 = 1.660_964;

/// Filtros de audio aplicados con ffmpeg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFilter {
    BassBoost,
    Nightcore,
    Vaporwave,
    #[serde(rename = "8d")]
    EightD,
    Karaoke,
    Tremolo,
    Vibrato,
}

impl AudioFilter {
    pub const ALL: [AudioFilter; 7] = [
        AudioFilter::BassBoost,
        AudioFilter::Nightcore,
        AudioFilter::Vaporwave,
        AudioFilter::EightD,
        AudioFilter::Karaoke,
        AudioFilter::Tremolo,
        AudioFilter::Vibrato,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AudioFilter::BassBoost => "bassboost",
            AudioFilter::Nightcore => "nightcore",
            AudioFilter::Vaporwave => "vaporwave",
            AudioFilter::EightD => "8d",
            AudioFilter::Karaoke => "karaoke",
            AudioFilter::Tremolo => "tremolo",
            AudioFilter::Vibrato => "vibrato",
        }
    }

    /// Expresión `-af` de ffmpeg
    pub fn ffmpeg_expr(self) -> &'static str {
        match self {
            AudioFilter::BassBoost => "bass=g=10,dynaudnorm=f=150",
            AudioFilter::Nightcore => "aresample=48000,asetrate=48000*1.25,aresample=48000",
            AudioFilter::Vaporwave => "aresample=48000,asetrate=48000*0.8,aresample=48000",
            AudioFilter::EightD => "apulsator=hz=0.08",
            AudioFilter::Karaoke => "stereotools=mlev=0.03",
            AudioFilter::Tremolo => "tremolo",
            AudioFilter::Vibrato => "vibrato=f=6.5",
        }
    }
}

impl fmt::Display for AudioFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AudioFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AudioFilter::ALL
            .into_iter()
            .find(|filter| filter.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("filtro desconocido: {s}"))
    }
}

/// Conjunto de filtros activos de un guild
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSet {
    enabled: BTreeSet<AudioFilter>,
}

impl FilterSet {
    /// Activa o desactiva un filtro; devuelve `true` si el estado cambió
    pub fn set(&mut self, filter: AudioFilter, enabled: bool) -> bool {
        if enabled {
            self.enabled.insert(filter)
        } else {
            self.enabled.remove(&filter)
        }
    }

    pub fn is_enabled(&self, filter: AudioFilter) -> bool {
        self.enabled.contains(&filter)
    }

    pub fn is_empty(&self) -> bool {
        self.enabled.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = AudioFilter> + '_ {
        self.enabled.iter().copied()
    }

    /// Cadena de filtros para `-af`, o `None` si no hay ninguno activo
    pub fn ffmpeg_chain(&self) -> Option<String> {
        if self.enabled.is_empty() {
            return None;
        }
        Some(
            self.enabled
                .iter()
                .map(|filter| filter.ffmpeg_expr())
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

/// Convierte un porcentaje de volumen en ganancia lineal con curva logarítmica
pub fn volume_to_gain(percent: u32) -> f32 {
    (percent as f32 / 100.0).powf(LOG_VOLUME_EXPONENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_curve_is_perceptual() {
        assert_eq!(volume_to_gain(0), 0.0);
        assert!((volume_to_gain(100) - 1.0).abs() < f32::EPSILON);
        // A mitad de volumen la ganancia lineal cae bastante por debajo de 0.5
        let half = volume_to_gain(50);
        assert!(half > 0.3 && half < 0.33, "ganancia {half}");
        assert!(volume_to_gain(200) > 3.0);
    }

    #[test]
    fn filter_names_round_trip() {
        for filter in AudioFilter::ALL {
            assert_eq!(filter.name().parse::<AudioFilter>().unwrap(), filter);
        }
        assert!("reverse".parse::<AudioFilter>().is_err());
        assert_eq!("NightCore".parse::<AudioFilter>().unwrap(), AudioFilter::Nightcore);
    }

    #[test]
    fn filter_set_builds_chain() {
        let mut filters = FilterSet::default();
        assert_eq!(filters.ffmpeg_chain(), None);

        assert!(filters.set(AudioFilter::Tremolo, true));
        assert!(!filters.set(AudioFilter::Tremolo, true));
        assert!(filters.set(AudioFilter::BassBoost, true));
        assert_eq!(
            filters.ffmpeg_chain().as_deref(),
            Some("bass=g=10,dynaudnorm=f=150,tremolo")
        );

        assert!(filters.set(AudioFilter::BassBoost, false));
        assert!(!filters.is_enabled(AudioFilter::BassBoost));
    }
}
