use anyhow::Result;
use geo::algorithm::haversine_distance::HaversineDistance;
use geojson::{Geometry, Value};

/// mean earth radius used by `geo`'s haversine, in meters
const EARTH_RADIUS: f64 = 6_371_008.8;
/// meters covered by one degree of latitude
const METERS_PER_DEGREE: f64 = EARTH_RADIUS * std::f64::consts::PI / 180.0;
/// below this cosine the longitude extent of a cell is clamped
const MIN_COS_LAT: f64 = 0.01;

/// (x, y) = (lon, lat) for geographic data, plain meters for planar data
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point(pub f64, pub f64);

impl Point {
    pub fn x(&self) -> f64 {
        self.0
    }

    pub fn y(&self) -> f64 {
        self.1
    }

    /// linear interpolation between `self` and `other`, `t` in [0, 1]
    pub fn lerp(&self, other: &Point, t: f64) -> Point {
        Point(
            self.0 + (other.0 - self.0) * t,
            self.1 + (other.1 - self.1) * t,
        )
    }
}

/// Closest point of a segment to a query point.
#[derive(Debug, Clone, Copy)]
pub struct Projection {
    pub point: Point,
    /// distance from the query point to `point`, in meters
    pub distance: f64,
    /// position of `point` along the segment, 0 at the start and 1 at the end
    pub fraction: f64,
}

/// The metric shared by segment lengths, candidate radius checks and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceFunction {
    /// haversine distance over lon/lat coordinates
    #[default]
    GreatCircle,
    /// planar distance over coordinates already expressed in meters
    Euclidean,
}

impl DistanceFunction {
    pub fn distance(&self, a: &Point, b: &Point) -> f64 {
        match self {
            DistanceFunction::GreatCircle => {
                geo::Point::new(a.0, a.1).haversine_distance(&geo::Point::new(b.0, b.1))
            }
            DistanceFunction::Euclidean => (a.0 - b.0).hypot(a.1 - b.1),
        }
    }

    /// Projects `p` onto the segment `a`-`b`.
    ///
    /// Geographic coordinates are flattened with an equirectangular
    /// approximation around `p` to find the projection parameter; the
    /// reported distance always comes from [`DistanceFunction::distance`].
    pub fn project(&self, p: &Point, a: &Point, b: &Point) -> Projection {
        let x_scale = match self {
            DistanceFunction::GreatCircle => p.1.to_radians().cos(),
            DistanceFunction::Euclidean => 1.0,
        };
        let dx = (b.0 - a.0) * x_scale;
        let dy = b.1 - a.1;
        let len2 = dx * dx + dy * dy;
        let fraction = if len2 <= 0.0 {
            0.0
        } else {
            (((p.0 - a.0) * x_scale * dx + (p.1 - a.1) * dy) / len2).clamp(0.0, 1.0)
        };
        let point = a.lerp(b, fraction);
        Projection {
            point,
            distance: self.distance(p, &point),
            fraction,
        }
    }

    /// Coordinate extent (dx, dy) covering at least `meters` anywhere at or
    /// below the absolute latitude `max_abs_lat`.
    pub fn coordinate_extent(&self, meters: f64, max_abs_lat: f64) -> (f64, f64) {
        match self {
            DistanceFunction::GreatCircle => {
                let dy = meters / METERS_PER_DEGREE;
                let cos = max_abs_lat.to_radians().cos().max(MIN_COS_LAT);
                (dy / cos, dy)
            }
            DistanceFunction::Euclidean => (meters, meters),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: Point,
    pub max: Point,
}

impl BoundingBox {
    pub fn from_points<'a, I: IntoIterator<Item = &'a Point>>(points: I) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = *iter.next()?;
        let mut bbox = BoundingBox {
            min: first,
            max: first,
        };
        for p in iter {
            bbox.extend(p);
        }
        Some(bbox)
    }

    pub fn extend(&mut self, p: &Point) {
        self.min.0 = self.min.0.min(p.0);
        self.min.1 = self.min.1.min(p.1);
        self.max.0 = self.max.0.max(p.0);
        self.max.1 = self.max.1.max(p.1);
    }

    pub fn width(&self) -> f64 {
        self.max.0 - self.min.0
    }

    pub fn height(&self) -> f64 {
        self.max.1 - self.min.1
    }

    /// a box collapsed to a single point cannot host a grid
    pub fn is_degenerate(&self) -> bool {
        !(self.width() > 0.0 || self.height() > 0.0)
    }

    pub fn max_abs_lat(&self) -> f64 {
        self.min.1.abs().max(self.max.1.abs())
    }
}

/// geojson position -> Point, extra dimensions are ignored
pub fn position_point(position: &[f64]) -> Result<Point> {
    match position {
        [x, y, ..] => Ok(Point(*x, *y)),
        _ => Err(anyhow::anyhow!(
            "position needs at least two coordinates, got {:?}",
            position
        )),
    }
}

/// 读取geojson linestring的坐标
pub fn linestring_points(geometry: &Geometry) -> Result<Vec<Point>> {
    match &geometry.value {
        Value::LineString(line_string) => {
            if line_string.len() < 2 {
                return Err(anyhow::anyhow!("linestring needs at least two positions"));
            }
            line_string.iter().map(|p| position_point(p)).collect()
        }
        _ => Err(anyhow::anyhow!("geometry is not linestring")),
    }
}
