//! Synthetic driver profiles assigned at registration.

use fleetline_core::{DriverProfile, Location};
use geohash::Coord;
use rand::prelude::*;
use tracing::warn;

/// Precision used for profile geohashes (~5m cells).
pub const PROFILE_GEOHASH_PRECISION: usize = 9;

/// Start points of the predefined routes drivers are placed on.
const ROUTE_STARTS: &[(f64, f64)] = &[
    (37.7749, -122.4194),
    (37.7858, -122.4064),
    (37.7694, -122.4862),
    (37.8024, -122.4058),
    (37.7599, -122.4148),
    (37.7879, -122.4075),
    (37.7786, -122.3893),
    (37.7955, -122.3937),
];

const NAMES: &[&str] = &[
    "Lando Norris",
    "Ayla Brooks",
    "Mateo Ruiz",
    "Noor Haddad",
    "Jonas Weber",
    "Priya Raman",
    "Kenji Sato",
    "Lena Novak",
];

/// Geohash of a position at profile precision.
fn profile_geohash(latitude: f64, longitude: f64) -> String {
    let position = Coord {
        x: longitude,
        y: latitude,
    };
    geohash::encode(position, PROFILE_GEOHASH_PRECISION).unwrap_or_else(|err| {
        warn!(error = %err, latitude, longitude, "position not encodable as geohash");
        String::new()
    })
}

fn avatar_url(index: usize) -> String {
    format!("https://randomuser.me/api/portraits/lego/{index}.jpg")
}

/// Builds driver profiles from a (seedable) random source.
#[derive(Debug)]
pub struct ProfileGenerator {
    rng: StdRng,
}

impl ProfileGenerator {
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn generate(&mut self, driver_id: &str, package_slug: &str) -> DriverProfile {
        let route = self.rng.gen_range(0..ROUTE_STARTS.len());
        let (latitude, longitude) = ROUTE_STARTS[route];
        let name = NAMES[self.rng.gen_range(0..NAMES.len())];

        DriverProfile {
            id: driver_id.to_string(),
            name: name.to_string(),
            package_slug: package_slug.to_string(),
            profile_picture: avatar_url(route),
            car_plate: self.plate(),
            geohash: profile_geohash(latitude, longitude),
            location: Location {
                latitude,
                longitude,
            },
        }
    }

    /// Three letters, a dash, four digits.
    fn plate(&mut self) -> String {
        let mut plate = String::with_capacity(8);
        for _ in 0..3 {
            plate.push(char::from(b'A' + self.rng.gen_range(0..26u8)));
        }
        plate.push('-');
        for _ in 0..4 {
            plate.push(char::from(b'0' + self.rng.gen_range(0..10u8)));
        }
        plate
    }
}

impl Default for ProfileGenerator {
    fn default() -> Self {
        Self::from_entropy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_geohash_has_profile_precision() {
        assert_eq!(profile_geohash(57.64911, 10.40744), "u4pruydqq");
        assert_eq!(profile_geohash(37.7749, -122.4194).len(), PROFILE_GEOHASH_PRECISION);
    }

    #[test]
    fn generated_profile_is_consistent() {
        let mut generator = ProfileGenerator::seeded(7);
        let profile = generator.generate("d1", "suv");

        assert_eq!(profile.id, "d1");
        assert_eq!(profile.package_slug, "suv");
        assert_eq!(profile.geohash.len(), PROFILE_GEOHASH_PRECISION);
        assert_eq!(
            profile.geohash,
            profile_geohash(profile.location.latitude, profile.location.longitude)
        );
        assert!(profile.profile_picture.starts_with("https://randomuser.me/"));

        let plate = profile.car_plate.as_bytes();
        assert_eq!(plate.len(), 8);
        assert!(plate[..3].iter().all(u8::is_ascii_uppercase));
        assert_eq!(plate[3], b'-');
        assert!(plate[4..].iter().all(u8::is_ascii_digit));
    }

    #[test]
    fn same_seed_same_profiles() {
        let a = ProfileGenerator::seeded(42).generate("d1", "sedan");
        let b = ProfileGenerator::seeded(42).generate("d1", "sedan");
        assert_eq!(a, b);
    }
}
