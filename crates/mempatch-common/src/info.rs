//! Patch-pack metadata: display info and user-tunable extra settings.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::wire::{self, Wire, WireReader};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtraSettingKind {
    #[default]
    Text,
    Number,
    Slider,
    Checkbox,
}

impl ExtraSettingKind {
    fn to_wire(self) -> u32 {
        match self {
            ExtraSettingKind::Text => 0,
            ExtraSettingKind::Number => 1,
            ExtraSettingKind::Slider => 2,
            ExtraSettingKind::Checkbox => 3,
        }
    }

    fn from_wire(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(ExtraSettingKind::Text),
            1 => Ok(ExtraSettingKind::Number),
            2 => Ok(ExtraSettingKind::Slider),
            3 => Ok(ExtraSettingKind::Checkbox),
            other => Err(Error::protocol(format!(
                "unknown extra setting kind {}",
                other
            ))),
        }
    }
}

/// One user-facing knob of a patch pack. `current_value` is owned by the
/// manager and ignored on input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtraSetting {
    pub label: String,
    pub kind: ExtraSettingKind,
    #[serde(default)]
    pub current_value: String,
    pub default_value: String,
    #[serde(default)]
    pub newline_after_label: bool,
    #[serde(default)]
    pub size: usize,
    // Number and Slider kinds only.
    #[serde(default)]
    pub min: i64,
    #[serde(default)]
    pub max: i64,
    #[serde(default)]
    pub interval: u64,
    #[serde(default)]
    pub precision: u8,
}

pub type ExtraSettings = Vec<ExtraSetting>;

pub fn extra_setting_by_label_mut<'a>(
    settings: &'a mut ExtraSettings,
    label: &str,
) -> Result<&'a mut ExtraSetting> {
    settings
        .iter_mut()
        .find(|setting| setting.label == label)
        .ok_or_else(|| Error::validation(format!("no setting labelled `{}' exists", label)))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Ignored on input; the manager owns the live value.
    #[serde(default)]
    pub currently_enabled: bool,
    #[serde(default)]
    pub default_enabled: bool,
    #[serde(default)]
    pub extra_settings: ExtraSettings,
}

impl Wire for ExtraSetting {
    fn encode(&self, out: &mut Vec<u8>) {
        wire::put_string(out, &self.label);
        wire::put_u32(out, self.kind.to_wire());
        wire::put_string(out, &self.current_value);
        wire::put_string(out, &self.default_value);
        wire::put_bool(out, self.newline_after_label);
        wire::put_size(out, self.size);
        wire::put_i64(out, self.min);
        wire::put_i64(out, self.max);
        wire::put_u64(out, self.interval);
        wire::put_u8(out, self.precision);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(ExtraSetting {
            label: r.string()?,
            kind: ExtraSettingKind::from_wire(r.u32()?)?,
            current_value: r.string()?,
            default_value: r.string()?,
            newline_after_label: r.bool()?,
            size: r.size()?,
            min: r.i64()?,
            max: r.i64()?,
            interval: r.u64()?,
            precision: r.u8()?,
        })
    }
}

impl Wire for Info {
    fn encode(&self, out: &mut Vec<u8>) {
        wire::put_string(out, &self.name);
        wire::put_string(out, &self.description);
        wire::put_bool(out, self.currently_enabled);
        wire::put_bool(out, self.default_enabled);
        wire::put_entities(out, &self.extra_settings);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Info {
            name: r.string()?,
            description: r.string()?,
            currently_enabled: r.bool()?,
            default_enabled: r.bool()?,
            extra_settings: r.entities()?,
        })
    }
}
