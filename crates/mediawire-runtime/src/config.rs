use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;

use mediawire_transport::congestion::DropConfig;
use mediawire_transport::media::{AudioEncoding, VideoFormat};
use mediawire_transport::reassembly::ReassemblyConfig;
use mediawire_transport::wire::{FRAGMENT_HEADER_SIZE, MAX_FRAGMENTS, MAX_PAYLOAD_LEN};

use crate::channel::ChannelKind;

pub const CONFIG_VERSION: u32 = 1;

const DEFAULT_SERVICE_NAME: &str = "mediawire";

// ─── Input (as parsed) ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContextConfigInput {
    pub version: u32,
    pub service_name: Option<String>,
    pub event_queue_capacity: Option<usize>,
    pub control: ChannelConfigInput,
    pub video: ChannelConfigInput,
    pub audio: ChannelConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChannelConfigInput {
    pub packing: Option<PackingInput>,
    pub fragmentation: Option<FragmentationInput>,
    /// Video only.
    pub drop: Option<DropInput>,
    /// Video only.
    pub format: Option<VideoFormat>,
    /// Audio only.
    pub encoding: Option<AudioEncoding>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PackingInput {
    pub enabled: Option<bool>,
    pub max_rx_size: Option<usize>,
    pub max_tx_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FragmentationInput {
    pub enabled: Option<bool>,
    pub fragment_size: Option<usize>,
    pub frame_capacity: Option<usize>,
    pub pool_slots: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DropInput {
    pub buffer_budget: Option<usize>,
    pub max_level: Option<u32>,
    pub gop_i_frame_budget: Option<u32>,
    pub min_sampling_ms: Option<u64>,
    pub max_sampling_ms: Option<u64>,
}

// ─── Resolved ───────────────────────────────────────────────────────────────

/// Framer limits, in payload bytes (header excluded).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackingConfig {
    pub max_rx_size: usize,
    pub max_tx_size: usize,
}

impl Default for PackingConfig {
    fn default() -> Self {
        Self {
            max_rx_size: 4096,
            max_tx_size: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentationConfig {
    /// Payload bytes per fragment, header excluded.
    pub fragment_size: usize,
    /// Largest frame the receive side reassembles.
    pub frame_capacity: usize,
    pub pool_slots: usize,
}

impl Default for FragmentationConfig {
    fn default() -> Self {
        Self {
            fragment_size: 1200,
            frame_capacity: 256 * 1024,
            pool_slots: 64,
        }
    }
}

impl FragmentationConfig {
    pub fn reassembly(&self) -> ReassemblyConfig {
        ReassemblyConfig {
            frame_capacity: self.frame_capacity,
            pool_slots: self.pool_slots,
            slot_size: self.fragment_size + FRAGMENT_HEADER_SIZE,
            ..ReassemblyConfig::default()
        }
    }
}

/// Pipeline stages of one channel. `None` means the stage is skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub packing: Option<PackingConfig>,
    pub fragmentation: Option<FragmentationConfig>,
}

impl Default for ChannelConfig {
    /// Packing only.
    fn default() -> Self {
        Self {
            packing: Some(PackingConfig::default()),
            fragmentation: None,
        }
    }
}

impl ChannelConfig {
    /// Packing plus fragmentation.
    pub fn video_default() -> Self {
        Self {
            packing: Some(PackingConfig::default()),
            fragmentation: Some(FragmentationConfig::default()),
        }
    }

    pub fn default_for(kind: ChannelKind) -> Self {
        match kind {
            ChannelKind::Video => Self::video_default(),
            ChannelKind::Control | ChannelKind::Audio => Self::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub version: u32,
    pub service_name: String,
    pub event_queue_capacity: usize,
    pub control: ChannelConfig,
    pub video: ChannelConfig,
    pub audio: ChannelConfig,
    pub video_format: VideoFormat,
    pub audio_encoding: AudioEncoding,
    pub video_drop: DropConfig,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            event_queue_capacity: 20,
            control: ChannelConfig::default_for(ChannelKind::Control),
            video: ChannelConfig::default_for(ChannelKind::Video),
            audio: ChannelConfig::default_for(ChannelKind::Audio),
            video_format: VideoFormat::default(),
            audio_encoding: AudioEncoding::default(),
            video_drop: DropConfig::default(),
        }
    }
}

impl ContextConfig {
    pub fn channel(&self, kind: ChannelKind) -> &ChannelConfig {
        match kind {
            ChannelKind::Control => &self.control,
            ChannelKind::Video => &self.video,
            ChannelKind::Audio => &self.audio,
        }
    }

    pub fn channel_mut(&mut self, kind: ChannelKind) -> &mut ChannelConfig {
        match kind {
            ChannelKind::Control => &mut self.control,
            ChannelKind::Video => &mut self.video,
            ChannelKind::Audio => &mut self.audio,
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(ContextConfig::default());
        }
        let parsed: ContextConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))?;
        parsed.resolve()
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&text).map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))
    }

    /// Re-check a config built in code rather than parsed.
    pub fn validate(&self) -> Result<(), String> {
        if self.event_queue_capacity == 0 {
            return Err("event_queue_capacity must be at least 1".to_string());
        }
        for kind in ChannelKind::ALL {
            check_channel(kind, self.channel(kind))?;
        }
        Ok(())
    }
}

// ─── Resolution ─────────────────────────────────────────────────────────────

impl ContextConfigInput {
    pub fn resolve(self) -> Result<ContextConfig, String> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(format!("Unsupported config version {}", version));
        }

        let service_name = self
            .service_name
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());

        for (kind, input) in [
            (ChannelKind::Control, &self.control),
            (ChannelKind::Audio, &self.audio),
        ] {
            if input.drop.is_some() || input.format.is_some() {
                return Err(format!("[{}] drop and format are only valid for [video]", kind));
            }
        }
        if self.video.encoding.is_some() || self.control.encoding.is_some() {
            return Err("encoding is only valid for [audio]".to_string());
        }

        let video_drop = resolve_drop(self.video.drop.as_ref())?;
        let video_format = self.video.format.unwrap_or_default();
        let audio_encoding = self.audio.encoding.unwrap_or_default();

        Ok(ContextConfig {
            version,
            service_name,
            event_queue_capacity: self.event_queue_capacity.unwrap_or(20).max(1),
            control: self.control.resolve(ChannelKind::Control)?,
            video: self.video.resolve(ChannelKind::Video)?,
            audio: self.audio.resolve(ChannelKind::Audio)?,
            video_format,
            audio_encoding,
            video_drop,
        })
    }
}

impl ChannelConfigInput {
    fn resolve(&self, kind: ChannelKind) -> Result<ChannelConfig, String> {
        let defaults = ChannelConfig::default_for(kind);

        let packing = match &self.packing {
            None => defaults.packing,
            Some(p) if p.enabled == Some(false) => None,
            Some(p) => {
                let base = PackingConfig::default();
                Some(PackingConfig {
                    max_rx_size: p.max_rx_size.unwrap_or(base.max_rx_size).clamp(1, MAX_PAYLOAD_LEN),
                    max_tx_size: p.max_tx_size.unwrap_or(base.max_tx_size).clamp(1, MAX_PAYLOAD_LEN),
                })
            }
        };

        let fragmentation = match &self.fragmentation {
            None => defaults.fragmentation,
            Some(f) if f.enabled == Some(false) => None,
            Some(f) => {
                let base = FragmentationConfig::default();
                let fragment_size = f.fragment_size.unwrap_or(base.fragment_size).max(1);
                // An unset capacity shrinks to what the fragment count can carry.
                let frame_capacity = f
                    .frame_capacity
                    .unwrap_or_else(|| base.frame_capacity.min(fragment_size * MAX_FRAGMENTS))
                    .max(1);
                Some(FragmentationConfig {
                    fragment_size,
                    frame_capacity,
                    pool_slots: f.pool_slots.unwrap_or(base.pool_slots).max(2),
                })
            }
        };

        let out = ChannelConfig {
            packing,
            fragmentation,
        };
        check_channel(kind, &out)?;
        Ok(out)
    }
}

/// Cross-stage checks: a fragment must fit in one framed unit.
fn check_channel(kind: ChannelKind, config: &ChannelConfig) -> Result<(), String> {
    let Some(frag) = &config.fragmentation else {
        return Ok(());
    };
    let unit = frag.fragment_size + FRAGMENT_HEADER_SIZE;
    if let Some(pack) = &config.packing {
        if unit > pack.max_tx_size || unit > pack.max_rx_size {
            return Err(format!(
                "[{}] fragment_size {} plus {}-byte fragment header exceeds packing limits (tx {}, rx {})",
                kind, frag.fragment_size, FRAGMENT_HEADER_SIZE, pack.max_tx_size, pack.max_rx_size
            ));
        }
    }
    if frag.frame_capacity > frag.fragment_size * MAX_FRAGMENTS {
        return Err(format!(
            "[{}] frame_capacity {} needs more than {} fragments of {} bytes",
            kind, frag.frame_capacity, MAX_FRAGMENTS, frag.fragment_size
        ));
    }
    Ok(())
}

fn resolve_drop(input: Option<&DropInput>) -> Result<DropConfig, String> {
    let base = DropConfig::default();
    let Some(d) = input else {
        return Ok(base);
    };
    let buffer_budget = d.buffer_budget.unwrap_or(base.buffer_budget);
    if buffer_budget == 0 {
        return Err("[video.drop] buffer_budget must be positive".to_string());
    }
    let min_sampling = d
        .min_sampling_ms
        .map(Duration::from_millis)
        .unwrap_or(base.min_sampling);
    let max_sampling = d
        .max_sampling_ms
        .map(Duration::from_millis)
        .unwrap_or(base.max_sampling);
    if max_sampling < min_sampling {
        return Err(format!(
            "[video.drop] max_sampling_ms {} is below min_sampling_ms {}",
            max_sampling.as_millis(),
            min_sampling.as_millis()
        ));
    }
    Ok(DropConfig {
        buffer_budget,
        max_level: d.max_level.unwrap_or(base.max_level).max(2),
        gop_i_frame_budget: d.gop_i_frame_budget.unwrap_or(base.gop_i_frame_budget).max(1),
        min_sampling,
        max_sampling,
    })
}
