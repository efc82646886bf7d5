//! Service-area geometry: polygon containment and distance to the polygon boundary.
//!
//! Distances use an equirectangular projection around the point being tested, which is
//! accurate enough for regional service areas and area relaxation buffers.

const EARTH_RADIUS_KM: f64 = 6371.0;

/// A WGS84 coordinate in degrees.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

impl Location {
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Simple polygon (vertices in order, implicitly closed).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ServiceArea {
    pub vertices: Vec<Location>,
}

impl ServiceArea {
    pub fn new(vertices: Vec<Location>) -> Self {
        Self { vertices }
    }

    /// Axis-aligned rectangle; convenient for tests and generated pools.
    pub fn rect(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Self {
        Self::new(vec![
            Location { lat: min_lat, lon: min_lon },
            Location { lat: min_lat, lon: max_lon },
            Location { lat: max_lat, lon: max_lon },
            Location { lat: max_lat, lon: min_lon },
        ])
    }

    /// Ray-casting point-in-polygon. Fewer than three vertices never contain anything.
    pub fn contains(&self, point: Location) -> bool {
        let n = self.vertices.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (vi, vj) = (self.vertices[i], self.vertices[j]);
            if (vi.lat > point.lat) != (vj.lat > point.lat) {
                let cross_lon = vi.lon + (point.lat - vi.lat) / (vj.lat - vi.lat) * (vj.lon - vi.lon);
                if point.lon < cross_lon {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    /// Distance in km from `point` to the nearest polygon edge (0 when inside).
    pub fn distance_km(&self, point: Location) -> f64 {
        if self.contains(point) {
            return 0.0;
        }
        let n = self.vertices.len();
        match n {
            0 => f64::INFINITY,
            1 => project(point, self.vertices[0]).norm(),
            _ => (0..n)
                .map(|i| {
                    let a = project(point, self.vertices[i]);
                    let b = project(point, self.vertices[(i + 1) % n]);
                    segment_distance(a, b)
                })
                .fold(f64::INFINITY, f64::min),
        }
    }

    /// True when `point` is inside the polygon or within `buffer_km` of its boundary.
    pub fn covers(&self, point: Location, buffer_km: f64) -> bool {
        if buffer_km <= 0.0 {
            return self.contains(point);
        }
        self.distance_km(point) <= buffer_km
    }
}

#[derive(Clone, Copy)]
struct Vec2 {
    x: f64,
    y: f64,
}

impl Vec2 {
    fn norm(self) -> f64 {
        (self.x * self.x + self.y * self.y).sqrt()
    }
}

/// Projects `p` into km offsets relative to `origin`.
fn project(origin: Location, p: Location) -> Vec2 {
    let lat0 = origin.lat.to_radians();
    Vec2 {
        x: (p.lon - origin.lon).to_radians() * lat0.cos() * EARTH_RADIUS_KM,
        y: (p.lat - origin.lat).to_radians() * EARTH_RADIUS_KM,
    }
}

/// Distance from the origin (0, 0) to segment `ab`.
fn segment_distance(a: Vec2, b: Vec2) -> f64 {
    let d = Vec2 { x: b.x - a.x, y: b.y - a.y };
    let len2 = d.x * d.x + d.y * d.y;
    if len2 == 0.0 {
        return a.norm();
    }
    let t = (-(a.x * d.x + a.y * d.y) / len2).clamp(0.0, 1.0);
    Vec2 { x: a.x + t * d.x, y: a.y + t * d.y }.norm()
}
