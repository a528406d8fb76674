//! Driver profile as seen by riders, drivers and the presence store.

use serde::{Deserialize, Serialize};

/// Geographic coordinate.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// Profile assigned to a driver when it comes online.
///
/// Serialized in camelCase since it is pushed verbatim to clients and stored
/// as the profile blob in the shared presence store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverProfile {
    pub id: String,
    pub name: String,
    pub package_slug: String,
    pub profile_picture: String,
    pub car_plate: String,
    pub geohash: String,
    pub location: Location,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_uses_client_field_names() {
        let profile = DriverProfile {
            id: "d1".into(),
            name: "Test Driver".into(),
            package_slug: "suv".into(),
            profile_picture: "https://example.invalid/1.jpg".into(),
            car_plate: "ABC-1234".into(),
            geohash: "u4pruydqq".into(),
            location: Location {
                latitude: 57.64911,
                longitude: 10.40744,
            },
        };

        let json = serde_json::to_value(&profile).unwrap();
        assert_eq!(json["packageSlug"], "suv");
        assert_eq!(json["carPlate"], "ABC-1234");
        assert_eq!(json["location"]["latitude"], 57.64911);
    }
}
