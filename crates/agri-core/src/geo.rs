//! Random placeholder coordinates for newly observed units.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

/// Sampling box in decimal degrees.
///
/// A latitude (or longitude) range of exactly `0..0` means "unspecified" and is
/// widened to the whole globe on that axis, so a literal zero-width box at the
/// equator or prime meridian cannot be requested.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub const GLOBE: Self = Self {
        min_lat: -90.0,
        max_lat: 90.0,
        min_lon: -180.0,
        max_lon: 180.0,
    };

    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Self {
        Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        }
    }

    /// Bounds actually sampled, after zero ranges are widened.
    pub fn resolved(&self) -> Self {
        let (min_lat, max_lat) = if self.min_lat == 0.0 && self.max_lat == 0.0 {
            (Self::GLOBE.min_lat, Self::GLOBE.max_lat)
        } else {
            (self.min_lat, self.max_lat)
        };
        let (min_lon, max_lon) = if self.min_lon == 0.0 && self.max_lon == 0.0 {
            (Self::GLOBE.min_lon, Self::GLOBE.max_lon)
        } else {
            (self.min_lon, self.max_lon)
        };
        Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        }
    }
}

/// Uniform coordinate sampler over an injected random source.
#[derive(Debug, Clone)]
pub struct CoordinateGenerator<R = StdRng> {
    rng: R,
}

impl CoordinateGenerator<StdRng> {
    /// Seeds from the wall clock, once, at construction.
    pub fn seeded_from_clock() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default();
        Self::new(StdRng::seed_from_u64(seed))
    }

    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> CoordinateGenerator<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    /// Draws each axis independently from `[min, max]`. Inverted ranges are not
    /// rejected; they simply sample the mirrored interval.
    pub fn generate(&mut self, bounds: BoundingBox) -> Coordinate {
        let bounds = bounds.resolved();
        Coordinate {
            latitude: self.draw(bounds.min_lat, bounds.max_lat),
            longitude: self.draw(bounds.min_lon, bounds.max_lon),
        }
    }

    /// Whole-globe draw, used for units created without a known location.
    pub fn generate_global(&mut self) -> Coordinate {
        self.generate(BoundingBox::default())
    }

    fn draw(&mut self, min: f64, max: f64) -> f64 {
        let value = min + self.rng.gen::<f64>() * (max - min);
        // rounding in `max - min` can overshoot by one ulp
        if min <= max {
            value.clamp(min, max)
        } else {
            value
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bounded_range(limit: f64) -> impl Strategy<Value = (f64, f64)> {
        (-limit..=limit, -limit..=limit).prop_map(|(a, b)| if a <= b { (a, b) } else { (b, a) })
    }

    proptest! {
        #[test]
        fn generated_points_stay_inside_box(
            (min_lat, max_lat) in bounded_range(90.0),
            (min_lon, max_lon) in bounded_range(180.0),
            seed in any::<u64>(),
        ) {
            prop_assume!(!(min_lat == 0.0 && max_lat == 0.0));
            prop_assume!(!(min_lon == 0.0 && max_lon == 0.0));
            let mut generator = CoordinateGenerator::seeded(seed);
            let bounds = BoundingBox::new(min_lat, max_lat, min_lon, max_lon);
            for _ in 0..16 {
                let point = generator.generate(bounds);
                prop_assert!(point.latitude >= min_lat && point.latitude <= max_lat);
                prop_assert!(point.longitude >= min_lon && point.longitude <= max_lon);
            }
        }
    }

    #[test]
    fn all_zero_box_spans_the_globe() {
        let mut generator = CoordinateGenerator::seeded(7);
        let mut lat_span = (f64::MAX, f64::MIN);
        let mut lon_span = (f64::MAX, f64::MIN);
        for _ in 0..5_000 {
            let point = generator.generate_global();
            assert!((-90.0..=90.0).contains(&point.latitude));
            assert!((-180.0..=180.0).contains(&point.longitude));
            lat_span = (lat_span.0.min(point.latitude), lat_span.1.max(point.latitude));
            lon_span = (lon_span.0.min(point.longitude), lon_span.1.max(point.longitude));
        }
        assert!(lat_span.0 < -80.0 && lat_span.1 > 80.0);
        assert!(lon_span.0 < -170.0 && lon_span.1 > 170.0);
    }

    #[test]
    fn degenerate_box_returns_fixed_point() {
        let mut generator = CoordinateGenerator::seeded(11);
        let point = generator.generate(BoundingBox::new(48.85, 48.85, 2.35, 2.35));
        assert!((point.latitude - 48.85).abs() < 1e-12);
        assert!((point.longitude - 2.35).abs() < 1e-12);
    }

    #[test]
    fn zero_axis_is_widened_independently() {
        let resolved = BoundingBox::new(10.0, 20.0, 0.0, 0.0).resolved();
        assert_eq!((resolved.min_lat, resolved.max_lat), (10.0, 20.0));
        assert_eq!((resolved.min_lon, resolved.max_lon), (-180.0, 180.0));
    }

    #[test]
    fn same_seed_same_sequence() {
        let mut a = CoordinateGenerator::seeded(42);
        let mut b = CoordinateGenerator::seeded(42);
        assert_eq!(a.generate_global(), b.generate_global());
        assert_eq!(a.generate_global(), b.generate_global());
    }
}
