use crate::encoder::decode;
use crate::types::{Coordinate, IncidentRecord};
use chrono::DateTime;
use std::fmt;

/// Shown instead of a photo that is missing or cannot be decoded.
pub const PHOTO_PLACEHOLDER: &str = "[no evidence]";

/// `geo:` URI that opens the coordinate in a maps application.
pub fn map_uri(coordinate: Coordinate) -> String {
    format!(
        "geo:{lat},{lon}?q={lat},{lon}",
        lat = coordinate.latitude,
        lon = coordinate.longitude
    )
}

/// Short `dd Mon, HH:MM` rendering of a millisecond timestamp, in UTC.
pub fn format_timestamp(ms: i64) -> String {
    match DateTime::from_timestamp_millis(ms) {
        Some(ts) => ts.format("%d %b, %H:%M").to_string(),
        None => "--".to_string(),
    }
}

/// One row of the incident list, ready for presentation.
#[derive(Debug, Clone, PartialEq)]
pub struct IncidentView {
    pub id: String,
    pub description: String,
    pub when: String,
    pub reporter: String,
    pub map_uri: String,
    /// Dimensions of the decoded photo, `None` when it should render as a placeholder.
    pub photo_dimensions: Option<(u32, u32)>,
}

impl IncidentView {
    pub fn from_record(record: &IncidentRecord) -> Self {
        let photo_dimensions = decode(&record.encoded_photo).map(|img| (img.width(), img.height()));
        Self {
            id: record.id.clone(),
            description: record.description.clone(),
            when: format_timestamp(record.timestamp),
            reporter: record.reporter_email.clone(),
            map_uri: map_uri(record.coordinate()),
            photo_dimensions,
        }
    }
}

impl fmt::Display for IncidentView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let photo = match self.photo_dimensions {
            Some((w, h)) => format!("[photo {}x{}]", w, h),
            None => PHOTO_PLACEHOLDER.to_string(),
        };
        write!(
            f,
            "{}  {}  {}  {}  {}",
            self.when, self.description, self.reporter, photo, self.map_uri
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_uri() {
        assert_eq!(
            map_uri(Coordinate::new(-12.5, -77.25)),
            "geo:-12.5,-77.25?q=-12.5,-77.25"
        );
    }

    #[test]
    fn test_format_timestamp() {
        // 2023-03-05T14:07:00Z
        assert_eq!(format_timestamp(1_678_025_220_000), "05 Mar, 14:07");
    }

    #[test]
    fn test_undecodable_photo_renders_placeholder() {
        let record = IncidentRecord {
            id: "k".to_string(),
            description: "Vereda rota".to_string(),
            encoded_photo: "not-a-photo".to_string(),
            latitude: 1.0,
            longitude: 2.0,
            timestamp: 0,
            reporter_email: "e@x".to_string(),
            reporter_id: "u".to_string(),
        };

        let view = IncidentView::from_record(&record);
        assert_eq!(view.photo_dimensions, None);
        assert!(view.to_string().contains(PHOTO_PLACEHOLDER));
        assert_eq!(view.when, "01 Jan, 00:00");
    }
}
