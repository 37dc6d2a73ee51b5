// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Raw sample type and the register/field map of the simulated inverter
//!
//! One sample is ten 16-bit words read from holding registers 0..9. Values
//! are stored raw; presentation scaling (tenths for voltage, current and
//! temperature, hundredths for frequency) is applied only when formatting.
//!
//! | addr | field | scale | r/w |
//! |------|-------|-------|-----|
//! | 0 | vac1 | /10 V | r |
//! | 1 | iac1 | /10 A | r |
//! | 2 | fac1 | /100 Hz | r |
//! | 3 | vpv1 | /10 V | r |
//! | 4 | vpv2 | /10 V | r |
//! | 5 | ipv1 | /10 A | r |
//! | 6 | ipv2 | /10 A | r |
//! | 7 | temp | /10 °C | r |
//! | 8 | export_percent | x1 % | r/w |
//! | 9 | pac | x1 W | r |

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// One raw reading of the full register map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub vac1: u16,
    pub iac1: u16,
    pub fac1: u16,
    pub vpv1: u16,
    pub vpv2: u16,
    pub ipv1: u16,
    pub ipv2: u16,
    pub temp: u16,
    pub export_percent: u16,
    pub pac: u16,
}

/// Identifier of one sample field; the discriminant equals the holding
/// register address of the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum FieldId {
    Vac1 = 0,
    Iac1 = 1,
    Fac1 = 2,
    Vpv1 = 3,
    Vpv2 = 4,
    Ipv1 = 5,
    Ipv2 = 6,
    Temp = 7,
    ExportPercent = 8,
    Pac = 9,
}

/// Canonical field names in register order; also the column order of the
/// compressed block and the `order` array of the upload payload.
pub const FIELD_ORDER: [&str; 10] = [
    "vac1",
    "iac1",
    "fac1",
    "vpv1",
    "vpv2",
    "ipv1",
    "ipv2",
    "temp",
    "export_percent",
    "pac",
];

impl FieldId {
    /// All fields in register order.
    pub const ALL: [FieldId; 10] = [
        FieldId::Vac1,
        FieldId::Iac1,
        FieldId::Fac1,
        FieldId::Vpv1,
        FieldId::Vpv2,
        FieldId::Ipv1,
        FieldId::Ipv2,
        FieldId::Temp,
        FieldId::ExportPercent,
        FieldId::Pac,
    ];

    /// Holding register address of this field.
    pub fn register(self) -> u16 {
        self as u16
    }

    /// Canonical field name.
    pub fn name(self) -> &'static str {
        FIELD_ORDER[self as usize]
    }

    /// Field for a register address, if it is part of the map.
    pub fn from_register(addr: u16) -> Option<FieldId> {
        FieldId::ALL.get(addr as usize).copied()
    }

    /// Resolve a cloud-side field name, case-insensitively, accepting the
    /// documented synonyms (`voltage`, `current`, `frequency`,
    /// `temperature`, `export`, `power`).
    pub fn parse(name: &str) -> Option<FieldId> {
        match name.to_ascii_lowercase().as_str() {
            "voltage" | "vac1" => Some(FieldId::Vac1),
            "current" | "iac1" => Some(FieldId::Iac1),
            "frequency" | "fac1" => Some(FieldId::Fac1),
            "vpv1" => Some(FieldId::Vpv1),
            "vpv2" => Some(FieldId::Vpv2),
            "ipv1" => Some(FieldId::Ipv1),
            "ipv2" => Some(FieldId::Ipv2),
            "temperature" | "temp" => Some(FieldId::Temp),
            "export_percent" | "export" => Some(FieldId::ExportPercent),
            "pac" | "power" => Some(FieldId::Pac),
            _ => None,
        }
    }
}

// Persisted as the bare register address (`cfg/runtime` in the store).
impl Serialize for FieldId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for FieldId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = u8::deserialize(deserializer)?;
        FieldId::from_register(u16::from(v))
            .ok_or_else(|| D::Error::custom(format!("field id {v} out of range")))
    }
}

impl Sample {
    /// Field value by id.
    pub fn field(&self, id: FieldId) -> u16 {
        self.as_words()[id as usize]
    }

    /// Set a field value by id.
    pub fn set_field(&mut self, id: FieldId, value: u16) {
        match id {
            FieldId::Vac1 => self.vac1 = value,
            FieldId::Iac1 => self.iac1 = value,
            FieldId::Fac1 => self.fac1 = value,
            FieldId::Vpv1 => self.vpv1 = value,
            FieldId::Vpv2 => self.vpv2 = value,
            FieldId::Ipv1 => self.ipv1 = value,
            FieldId::Ipv2 => self.ipv2 = value,
            FieldId::Temp => self.temp = value,
            FieldId::ExportPercent => self.export_percent = value,
            FieldId::Pac => self.pac = value,
        }
    }

    /// All ten words in register order.
    pub fn as_words(&self) -> [u16; 10] {
        [
            self.vac1,
            self.iac1,
            self.fac1,
            self.vpv1,
            self.vpv2,
            self.ipv1,
            self.ipv2,
            self.temp,
            self.export_percent,
            self.pac,
        ]
    }

    /// Human-readable scaled view for logging; stored values stay raw.
    pub fn scaled_summary(&self) -> String {
        format!(
            "vac1={:.1}V iac1={:.1}A fac1={:.2}Hz vpv1={:.1}V vpv2={:.1}V ipv1={:.1}A ipv2={:.1}A temp={:.1}C export={}% pac={}W",
            f64::from(self.vac1) / 10.0,
            f64::from(self.iac1) / 10.0,
            f64::from(self.fac1) / 100.0,
            f64::from(self.vpv1) / 10.0,
            f64::from(self.vpv2) / 10.0,
            f64::from(self.ipv1) / 10.0,
            f64::from(self.ipv2) / 10.0,
            f64::from(self.temp) / 10.0,
            self.export_percent,
            self.pac,
        )
    }
}
