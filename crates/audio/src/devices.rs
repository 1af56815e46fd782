//! Inventaire des périphériques par défaut
//!
//! Utilisé par la commande `devices` de la console pour vérifier la
//! configuration avant de lancer un appel.

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

/// Description d'un périphérique par défaut
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceSummary {
    pub name: String,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

impl std::fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if let (Some(rate), Some(channels)) = (self.sample_rate, self.channels) {
            write!(f, " ({} Hz, {} canal(aux))", rate, channels)?;
        }
        Ok(())
    }
}

fn device_name(device: &cpal::Device) -> String {
    device
        .description()
        .ok()
        .map(|desc| desc.name().to_string())
        .unwrap_or_else(|| "Périphérique inconnu".to_string())
}

/// Microphone par défaut de l'host, s'il existe
pub fn default_input() -> Option<DeviceSummary> {
    let device = cpal::default_host().default_input_device()?;
    let config = device.default_input_config().ok();
    Some(DeviceSummary {
        name: device_name(&device),
        sample_rate: config.as_ref().map(|c| c.sample_rate()),
        channels: config.as_ref().map(|c| c.channels()),
    })
}

/// Sortie par défaut de l'host, si elle existe
pub fn default_output() -> Option<DeviceSummary> {
    let device = cpal::default_host().default_output_device()?;
    let config = device.default_output_config().ok();
    Some(DeviceSummary {
        name: device_name(&device),
        sample_rate: config.as_ref().map(|c| c.sample_rate()),
        channels: config.as_ref().map(|c| c.channels()),
    })
}
