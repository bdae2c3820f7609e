//! The service ticket ("chamado") carried by queue messages.

use crate::error::WorkerError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const TITLE_MAX_LEN: usize = 100;
pub const DESCRIPTION_MAX_LEN: usize = 500;
pub const TECHNICIAN_MAX_LEN: usize = 100;
pub const EQUIPMENT_MAX_LEN: usize = 100;
pub const LOCATION_MAX_LEN: usize = 200;
pub const MODEL_MAX_LEN: usize = 100;

/// Kind of maintenance requested by a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MaintenanceType {
    Preventive = 1,
    Corrective = 2,
    Predictive = 3,
}

impl TryFrom<u8> for MaintenanceType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Preventive),
            2 => Ok(Self::Corrective),
            3 => Ok(Self::Predictive),
            other => Err(format!("unknown maintenance type {}", other)),
        }
    }
}

impl From<MaintenanceType> for u8 {
    fn from(value: MaintenanceType) -> Self {
        value as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Criticality {
    Low = 1,
    Medium = 2,
    High = 3,
}

impl TryFrom<u8> for Criticality {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Low),
            2 => Ok(Self::Medium),
            3 => Ok(Self::High),
            other => Err(format!("unknown criticality {}", other)),
        }
    }
}

impl From<Criticality> for u8 {
    fn from(value: Criticality) -> Self {
        value as u8
    }
}

/// Ticket status. Note that `Closed` is encoded as 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Status {
    Closed = 0,
    Open = 1,
}

impl TryFrom<u8> for Status {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Closed),
            1 => Ok(Self::Open),
            other => Err(format!("unknown status {}", other)),
        }
    }
}

impl From<Status> for u8 {
    fn from(value: Status) -> Self {
        value as u8
    }
}

/// Reads a message body as UTF-8 text, then parses it as JSON.
pub fn decode_message<T: DeserializeOwned>(body: &[u8]) -> Result<T, WorkerError> {
    let text = std::str::from_utf8(body)?;
    Ok(serde_json::from_str(text)?)
}

/// A service ticket as published by the producer.
///
/// Field names follow the wire format. The store-assigned identifier is not part
/// of this type; an `Id` sent by the producer is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    #[serde(rename = "Titulo")]
    pub title: String,
    #[serde(rename = "Descricao")]
    pub description: String,
    #[serde(rename = "TipoManutencao")]
    pub maintenance_type: MaintenanceType,
    #[serde(rename = "Criticidade")]
    pub criticality: Criticality,
    #[serde(rename = "Tecnico")]
    pub technician: String,
    #[serde(rename = "DataAbertura", with = "timestamp")]
    pub opened_at: DateTime<Utc>,
    #[serde(rename = "DataFechamento", default, with = "optional_timestamp")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(rename = "Status")]
    pub status: Status,
    #[serde(rename = "Equipamento")]
    pub equipment: String,
    #[serde(rename = "Localizacao")]
    pub location: String,
    #[serde(rename = "Modelo")]
    pub model: String,
}

impl Ticket {
    /// Decodes a raw message body: UTF-8 first, then JSON.
    pub fn decode(body: &[u8]) -> Result<Self, WorkerError> {
        decode_message(body)
    }

    /// Checks the constraints the `Chamados` table enforces.
    pub fn validate(&self) -> Result<(), WorkerError> {
        let fields = [
            ("Titulo", &self.title, TITLE_MAX_LEN),
            ("Descricao", &self.description, DESCRIPTION_MAX_LEN),
            ("Tecnico", &self.technician, TECHNICIAN_MAX_LEN),
            ("Equipamento", &self.equipment, EQUIPMENT_MAX_LEN),
            ("Localizacao", &self.location, LOCATION_MAX_LEN),
            ("Modelo", &self.model, MODEL_MAX_LEN),
        ];

        for (name, value, max) in fields {
            let len = value.chars().count();
            if len > max {
                return Err(WorkerError::Validation(format!(
                    "{} has {} characters, limit is {}",
                    name, len, max
                )));
            }
        }

        if self.status == Status::Open && self.closed_at.is_some() {
            return Err(WorkerError::Validation(
                "DataFechamento must be empty while the ticket is open".to_string(),
            ));
        }

        Ok(())
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Titulo={}, Descricao={}, Data={}",
            self.title,
            self.description,
            self.opened_at.to_rfc3339()
        )
    }
}

/// ISO-8601 timestamps. A value without an offset is read as UTC; a date
/// without a time is midnight UTC.
mod timestamp {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub(super) fn parse(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Ok(dt.with_timezone(&Utc));
        }
        if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M%#z") {
            return Ok(dt.with_timezone(&Utc));
        }

        let naive = raw.strip_suffix(|c: char| c == 'Z' || c == 'z').unwrap_or(raw);
        for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
            if let Ok(dt) = NaiveDateTime::parse_from_str(naive, format) {
                return Ok(dt.and_utc());
            }
        }
        NaiveDate::parse_from_str(naive, "%Y-%m-%d").map(|date| date.and_time(NaiveTime::default()).and_utc())
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(|e| de::Error::custom(format!("invalid timestamp '{}': {}", raw, e)))
    }
}

mod optional_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => serializer.serialize_str(&dt.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) => super::timestamp::parse(&raw)
                .map(Some)
                .map_err(|e| de::Error::custom(format!("invalid timestamp '{}': {}", raw, e))),
            None => Ok(None),
        }
    }
}
