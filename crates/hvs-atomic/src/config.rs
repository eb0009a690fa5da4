// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Device configuration: HVS generation, channel pool and output routing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channels::{ChannelMask, HVS_NUM_CHANNELS, MAX_CHANNELS};
use crate::core_clock::MODESET_BOOST_CLOCK_HZ;

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Serialization/deserialization failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    /// The configuration is well-formed but cannot describe a device.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// HVS hardware generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HvsGeneration {
    /// BCM2835/6/7 HVS.
    #[default]
    Vc4,
    /// BCM2711 HVS ("HVS5"), with a managed core clock and a wider mux.
    Vc5,
}

fn default_true() -> bool {
    true
}

/// Fixed routing data of one output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDesc {
    /// Name used in logs.
    pub name: String,
    /// HVS channels the output's pixel valve can be muxed onto.
    pub allowed_channels: ChannelMask,
    /// HVS output index, selecting the mux register on VC5.
    pub hvs_output: u8,
    /// The output is the transposer writeback, which bypasses the pixel valve.
    #[serde(default)]
    pub feed_txp: bool,
    /// The output raises real vblank interrupts; otherwise completion is faked.
    #[serde(default = "default_true")]
    pub has_vblank: bool,
}

impl OutputDesc {
    /// Describes a pixel-valve output.
    #[must_use]
    pub fn new(name: &str, allowed_channels: ChannelMask, hvs_output: u8) -> Self {
        Self {
            name: name.to_owned(),
            allowed_channels,
            hvs_output,
            feed_txp: false,
            has_vblank: true,
        }
    }

    /// Describes the transposer writeback output.
    #[must_use]
    pub fn txp(allowed_channels: ChannelMask, hvs_output: u8) -> Self {
        Self {
            feed_txp: true,
            has_vblank: false,
            ..Self::new("txp", allowed_channels, hvs_output)
        }
    }
}

/// Device configuration.
///
/// Unset optional fields take the per-generation default, see the accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KmsConfig {
    /// Hardware generation.
    pub generation: HvsGeneration,
    /// Size of the HVS channel pool.
    pub num_channels: u8,
    /// Firmware owns the display pipe: skip channel muxing and CTM registers.
    pub firmware_kms: bool,
    /// Initial state of the load-tracker enforcement switch.
    pub load_tracker_enabled: Option<bool>,
    /// Largest mode / plane width accepted by the mode-config check.
    pub max_width: Option<u32>,
    /// Largest mode / plane height accepted by the mode-config check.
    pub max_height: Option<u32>,
    /// Core clock floor requested while a modeset is applied, in Hz.
    pub min_boost_clock_hz: u64,
    /// Outputs in device order.
    pub outputs: Vec<OutputDesc>,
    /// Number of scanout planes.
    pub num_planes: u32,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self::bcm2835()
    }
}

fn bits(channels: &[u8]) -> ChannelMask {
    ChannelMask::from_bits(channels.iter().fold(0_u32, |acc, c| acc | (1 << *c)))
}

impl KmsConfig {
    /// BCM2835 routing: three pixel valves plus the transposer.
    #[must_use]
    pub fn bcm2835() -> Self {
        Self {
            generation: HvsGeneration::Vc4,
            num_channels: HVS_NUM_CHANNELS,
            firmware_kms: false,
            load_tracker_enabled: None,
            max_width: None,
            max_height: None,
            min_boost_clock_hz: MODESET_BOOST_CLOCK_HZ,
            outputs: vec![
                OutputDesc::new("pixelvalve-0", bits(&[0]), 0),
                OutputDesc::new("pixelvalve-1", bits(&[2]), 2),
                OutputDesc::new("pixelvalve-2", bits(&[1]), 1),
                OutputDesc::txp(bits(&[2]), 2),
            ],
            num_planes: 8,
        }
    }

    /// BCM2711 routing: five pixel valves plus the transposer.
    #[must_use]
    pub fn bcm2711() -> Self {
        Self {
            generation: HvsGeneration::Vc5,
            outputs: vec![
                OutputDesc::new("pixelvalve-0", bits(&[0]), 0),
                OutputDesc::new("pixelvalve-1", bits(&[0, 2]), 3),
                OutputDesc::new("pixelvalve-2", bits(&[0, 2]), 4),
                OutputDesc::new("pixelvalve-3", bits(&[1]), 1),
                OutputDesc::new("pixelvalve-4", bits(&[0, 1, 2]), 5),
                OutputDesc::txp(bits(&[2]), 2),
            ],
            ..Self::bcm2835()
        }
    }

    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    /// [`ConfigError::Serde`] on malformed JSON, [`ConfigError::Invalid`] if
    /// [`KmsConfig::validate`] refuses it.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_slice(bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration describes a routable device.
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_channels == 0 || self.num_channels > MAX_CHANNELS {
            return Err(ConfigError::Invalid(format!(
                "num_channels must be within 1..={MAX_CHANNELS}, got {}",
                self.num_channels
            )));
        }
        let pool = ChannelMask::full(self.num_channels);
        for desc in &self.outputs {
            if desc.allowed_channels.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "output {} cannot reach any channel",
                    desc.name
                )));
            }
            if !desc.allowed_channels.is_subset(pool) {
                return Err(ConfigError::Invalid(format!(
                    "output {} routes to channels outside the pool ({:#x})",
                    desc.name,
                    desc.allowed_channels.bits()
                )));
            }
        }
        Ok(())
    }

    /// Whether bandwidth enforcement starts enabled.
    ///
    /// The limits are not relevant on VC5, where the tracked load only feeds
    /// the core clock computation.
    #[must_use]
    pub fn load_tracker_default(&self) -> bool {
        self.load_tracker_enabled
            .unwrap_or(self.generation == HvsGeneration::Vc4)
    }

    /// Largest `(width, height)` accepted by the mode-config check.
    #[must_use]
    pub fn max_dimensions(&self) -> (u32, u32) {
        let fallback = match self.generation {
            HvsGeneration::Vc4 => 2048,
            HvsGeneration::Vc5 => 7680,
        };
        (
            self.max_width.unwrap_or(fallback),
            self.max_height.unwrap_or(fallback),
        )
    }

    /// Whether commits request core clock rates.
    #[must_use]
    pub fn manages_core_clock(&self) -> bool {
        self.generation == HvsGeneration::Vc5 && !self.firmware_kms
    }
}
