use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Name of the remote collection holding every incident.
pub const INCIDENTS_COLLECTION: &str = "incidentes";

/// A single user-submitted incident report.
///
/// Field names on the wire are fixed by the persisted collection and must
/// round-trip through every store implementation. Every field falls back to a
/// default when missing; a field present with the wrong type makes the whole
/// entry malformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "descripcion", default)]
    pub description: String,
    #[serde(rename = "fotoUrl", default)]
    pub encoded_photo: String,
    #[serde(rename = "latitud", default)]
    pub latitude: f64,
    #[serde(rename = "longitud", default)]
    pub longitude: f64,
    #[serde(rename = "fecha", default, deserialize_with = "deserialize_millis")]
    pub timestamp: i64,
    #[serde(rename = "usuarioEmail", default)]
    pub reporter_email: String,
    #[serde(rename = "usuarioId", default)]
    pub reporter_id: String,
}

impl IncidentRecord {
    /// Build a persisted record from a freshly allocated key and the caller's fields.
    pub fn from_parts(id: String, timestamp: i64, incident: NewIncident) -> Self {
        Self {
            id,
            description: incident.description,
            encoded_photo: incident.encoded_photo,
            latitude: incident.coordinate.latitude,
            longitude: incident.coordinate.longitude,
            timestamp,
            reporter_email: incident.reporter.email,
            reporter_id: incident.reporter.id,
        }
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    pub fn has_photo(&self) -> bool {
        !self.encoded_photo.is_empty()
    }
}

// Accepts any JSON number; older clients wrote `fecha` as a double.
fn deserialize_millis<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let value: serde_json::Value = serde::Deserialize::deserialize(deserializer)?;
    match value {
        serde_json::Value::Number(n) => {
            if let Some(ms) = n.as_i64() {
                Ok(ms)
            } else if let Some(ms) = n.as_f64() {
                if ms.is_finite() && ms.fract() == 0.0 {
                    Ok(ms as i64)
                } else {
                    Err(Error::custom(format!("fecha is not a whole millisecond: {}", ms)))
                }
            } else {
                Err(Error::custom("fecha out of range"))
            }
        }
        serde_json::Value::Null => Ok(0),
        other => Err(Error::custom(format!("expected number for fecha, got {}", other))),
    }
}

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// True for exactly `(0.0, 0.0)`, which usually means the fix was never
    /// taken. Informational only: such coordinates are stored as-is.
    pub fn is_null_island(&self) -> bool {
        self.latitude == 0.0 && self.longitude == 0.0
    }
}

/// The signed-in reporter, copied into each record at submission time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub email: String,
    pub id: String,
}

impl Identity {
    pub fn new(email: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            id: id.into(),
        }
    }
}

/// Caller-supplied part of a record; the ledger adds id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewIncident {
    pub description: String,
    pub encoded_photo: String,
    pub coordinate: Coordinate,
    pub reporter: Identity,
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
