use std::fmt::Debug;

use anyhow::bail;
use bytes::Bytes;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PhotoQuality {
    VeryLow,
    Low,
    #[default]
    Medium,
    High,
    VeryHigh,
}
impl PhotoQuality {
    fn script_name(&self) -> &'static str {
        match self {
            PhotoQuality::VeryLow => "VERY_LOW",
            PhotoQuality::Low => "LOW",
            PhotoQuality::Medium => "MEDIUM",
            PhotoQuality::High => "HIGH",
            PhotoQuality::VeryHigh => "VERY_HIGH",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MeteringMode {
    Spot,
    Average,
    #[default]
    CenterWeighted,
}
impl MeteringMode {
    fn script_name(&self) -> &'static str {
        match self {
            MeteringMode::Spot => "SPOT",
            MeteringMode::Average => "AVERAGE",
            MeteringMode::CenterWeighted => "CENTER_WEIGHTED",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PhotoParams {
    pub quality: PhotoQuality,
    /// time the sensor gets to adjust exposure before capturing, `None` to capture immediately
    pub autofocus_seconds: Option<u32>,
    pub metering: MeteringMode,
    /// edge length of the square image in pixels
    pub resolution: u16,
    /// vertical pan of the capture window
    pub pan: i16,
}

impl PhotoParams {
    pub const RESOLUTION_RANGE: std::ops::RangeInclusive<u16> = 100..=720;
    pub const PAN_RANGE: std::ops::RangeInclusive<i16> = -140..=140;

    pub fn new() -> PhotoParams {
        PhotoParams {
            quality: PhotoQuality::Medium,
            autofocus_seconds: Some(3),
            metering: MeteringMode::CenterWeighted,
            resolution: 512,
            pan: 0,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !Self::RESOLUTION_RANGE.contains(&self.resolution) {
            bail!("photo resolution must be in {:?}, was {}", Self::RESOLUTION_RANGE, self.resolution);
        }
        if !Self::PAN_RANGE.contains(&self.pan) {
            bail!("photo pan must be in {:?}, was {}", Self::PAN_RANGE, self.pan);
        }
        Ok(())
    }
}

impl Default for PhotoParams {
    fn default() -> Self {
        PhotoParams::new()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub bit_depth: u8,
    /// the device stops recording on its own after this time; `None` records until cancelled
    pub max_seconds: Option<u32>,
}

impl AudioParams {
    pub fn new() -> AudioParams {
        AudioParams {
            sample_rate: 8000,
            bit_depth: 16,
            max_seconds: None,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !matches!(self.sample_rate, 8000 | 16000) {
            bail!("audio sample rate must be 8000 or 16000, was {}", self.sample_rate);
        }
        if !matches!(self.bit_depth, 8 | 16) {
            bail!("audio bit depth must be 8 or 16, was {}", self.bit_depth);
        }
        Ok(())
    }

    pub fn bytes_per_second(&self) -> u32 {
        self.sample_rate * (self.bit_depth as u32 / 8)
    }
}

impl Default for AudioParams {
    fn default() -> Self {
        AudioParams::new()
    }
}

/// What a bulk transfer reads or writes. All resources share the same transfer protocol and
///  differ only in how the transfer is requested.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResourceId {
    File(String),
    Photo(PhotoParams),
    Audio(AudioParams),
    /// the initiation request is sent as is
    Raw(Bytes),
}

/// Renders the device requests that initiate transfers.
pub trait TransferAddressing: Debug + Send + Sync {
    fn download_request(&self, resource: &ResourceId) -> anyhow::Result<Bytes>;

    fn upload_request(&self, resource: &ResourceId, len: u64) -> anyhow::Result<Bytes>;
}

/// Addresses resources through the helper functions of the device's script library.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameScriptAddressing;

impl TransferAddressing for FrameScriptAddressing {
    fn download_request(&self, resource: &ResourceId) -> anyhow::Result<Bytes> {
        let script = match resource {
            ResourceId::File(path) => format!("printCompleteFile(\"{}\")", escape_lua_string(path)),
            ResourceId::Photo(params) => {
                params.validate()?;
                format!("cameraCaptureAndSend('{}',{},'{}',{},{})",
                    params.quality.script_name(),
                    lua_optional(params.autofocus_seconds),
                    params.metering.script_name(),
                    params.resolution,
                    params.pan,
                )
            }
            ResourceId::Audio(params) => {
                params.validate()?;
                format!("microphoneRecordAndSend({},{},{})", params.sample_rate, params.bit_depth, lua_optional(params.max_seconds))
            }
            ResourceId::Raw(request) => return Ok(request.clone()),
        };
        Ok(Bytes::from(script))
    }

    fn upload_request(&self, resource: &ResourceId, len: u64) -> anyhow::Result<Bytes> {
        match resource {
            ResourceId::File(path) => Ok(Bytes::from(format!("receiveCompleteFile(\"{}\",{})", escape_lua_string(path), len))),
            ResourceId::Raw(request) => Ok(request.clone()),
            other => bail!("{:?} can not be uploaded", other),
        }
    }
}

fn lua_optional(value: Option<u32>) -> String {
    value
        .map(|v| v.to_string())
        .unwrap_or_else(|| "nil".to_string())
}

/// Escapes a string for use inside a double quoted Lua string literal.
pub fn escape_lua_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\t' => result.push_str("\\t"),
            '"' => result.push_str("\\\""),
            c => result.push(c),
        }
    }
    result
}
