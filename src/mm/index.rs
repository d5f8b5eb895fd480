use super::model::PointMatch;
use crate::algorithm::{BoundingBox, DistanceFunction, Point};
use crate::graph::{EdgePosition, RoadSegment};
use anyhow::Result;
use log::{debug, info};
use std::collections::{HashMap, HashSet};

/// empty cells kept around the map bounding box on every side
const MARGIN_CELLS: usize = 2;

/// Uniform grid over segment endpoints and intermediate points.
///
/// Cells are `cell_factor * radius` wide. Segments longer than
/// `(cell_factor * sqrt(2) - 2) * radius` get evenly spaced intermediate
/// entries, so every segment within `radius` of a query point has an entry
/// in the query cell or one of its 8 neighbors.
pub struct GridIndex {
    origin: Point,
    cell_width: f64,
    cell_height: f64,
    cell_size: f64,
    columns: usize,
    rows: usize,
    radius: f64,
    interval: f64,
    distance: DistanceFunction,
    cells: HashMap<usize, Vec<usize>>,
    segments: Vec<RoadSegment>,
}

impl GridIndex {
    pub fn new(
        bbox: &BoundingBox,
        radius: f64,
        cell_factor: f64,
        distance: DistanceFunction,
    ) -> Result<Self> {
        if bbox.is_degenerate() {
            return Err(anyhow::anyhow!("cannot build grid over a degenerate bounding box"));
        }
        if !(radius > 0.0) || cell_factor < 2.0 {
            return Err(anyhow::anyhow!(
                "invalid grid parameters: radius {}, cell factor {}",
                radius,
                cell_factor
            ));
        }
        let cell_size = cell_factor * radius;
        // widest longitude extent is reached at the highest latitude incl. margin
        let (_, margin_height) = distance.coordinate_extent(cell_size, 0.0);
        let max_abs_lat = (bbox.max_abs_lat() + margin_height * MARGIN_CELLS as f64).min(89.0);
        let (cell_width, cell_height) = distance.coordinate_extent(cell_size, max_abs_lat);
        let margin = MARGIN_CELLS as f64;
        let origin = Point(
            bbox.min.0 - margin * cell_width,
            bbox.min.1 - margin * cell_height,
        );
        let columns = (bbox.width() / cell_width).ceil() as usize + 2 * MARGIN_CELLS + 1;
        let rows = (bbox.height() / cell_height).ceil() as usize + 2 * MARGIN_CELLS + 1;
        info!(
            "grid index {} x {} cells, cell size {} m",
            columns, rows, cell_size
        );
        Ok(GridIndex {
            origin,
            cell_width,
            cell_height,
            cell_size,
            columns,
            rows,
            radius,
            interval: (cell_factor * std::f64::consts::SQRT_2 - 2.0) * radius,
            distance,
            cells: HashMap::new(),
            segments: Vec::new(),
        })
    }

    /// Builds the index and inserts `segments` in order, so the index of a
    /// segment in the slice is its id in query results.
    pub fn build(
        bbox: &BoundingBox,
        segments: &[RoadSegment],
        radius: f64,
        cell_factor: f64,
        distance: DistanceFunction,
    ) -> Result<Self> {
        let mut index = GridIndex::new(bbox, radius, cell_factor, distance)?;
        for segment in segments {
            index.insert(segment.clone())?;
        }
        info!(
            "grid index built, {} segments in {} cells",
            index.segments.len(),
            index.cells.len()
        );
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn insert(&mut self, segment: RoadSegment) -> Result<usize> {
        let id = self.segments.len();
        let length = self.distance.distance(&segment.from, &segment.to);
        if (length - segment.length).abs() > 1e-6 * length.max(1.0) {
            return Err(anyhow::anyhow!(
                "segment of road {} has length {} inconsistent with the index distance {}",
                segment.road_id,
                segment.length,
                length
            ));
        }
        let pieces = if length > self.interval {
            (length / self.interval).ceil() as usize
        } else {
            1
        };
        for i in 0..=pieces {
            let p = segment.from.lerp(&segment.to, i as f64 / pieces as f64);
            let cell = self
                .cell_of(&p)
                .ok_or_else(|| anyhow::anyhow!("segment of road {} outside the grid", segment.road_id))?;
            let key = self.cell_key(cell);
            let entries = self.cells.entry(key).or_default();
            if entries.last() != Some(&id) {
                entries.push(id);
            }
        }
        self.segments.push(segment);
        Ok(id)
    }

    /// Segments whose projected distance to `point` is strictly below
    /// `radius`, nearest first.
    pub fn query(&self, point: &Point, radius: f64) -> Vec<PointMatch> {
        let reach = if radius <= self.radius {
            1
        } else {
            1 + ((radius - self.radius) / self.cell_size).ceil() as usize
        };
        let (col, row) = self.raw_cell(point);
        let reach = reach as i64;
        let mut seen = HashSet::new();
        let mut accepted: Vec<usize> = Vec::new();
        let mut matches = Vec::new();
        for r in (row - reach)..=(row + reach) {
            if r < 0 || r >= self.rows as i64 {
                continue;
            }
            for c in (col - reach)..=(col + reach) {
                if c < 0 || c >= self.columns as i64 {
                    continue;
                }
                let Some(entries) = self.cells.get(&self.cell_key((c as usize, r as usize))) else {
                    continue;
                };
                for id in entries {
                    if !seen.insert(*id) {
                        continue;
                    }
                    let segment = &self.segments[*id];
                    // 同一路段重复插入只返回一次
                    if accepted
                        .iter()
                        .any(|other| self.segments[*other].same_segment(segment))
                    {
                        continue;
                    }
                    let projection = self.distance.project(point, &segment.from, &segment.to);
                    if projection.distance >= radius {
                        continue;
                    }
                    accepted.push(*id);
                    matches.push(PointMatch {
                        point: projection.point,
                        road_id: segment.road_id.clone(),
                        position: Some(EdgePosition {
                            segment: *id,
                            offset: projection.fraction * segment.length,
                        }),
                        distance: projection.distance,
                        segment_length: segment.length,
                    });
                }
            }
        }
        matches.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.position.map(|p| p.segment).cmp(&b.position.map(|p| p.segment)))
        });
        debug!("{} candidates around ({}, {})", matches.len(), point.0, point.1);
        matches
    }

    fn raw_cell(&self, p: &Point) -> (i64, i64) {
        (
            ((p.0 - self.origin.0) / self.cell_width).floor() as i64,
            ((p.1 - self.origin.1) / self.cell_height).floor() as i64,
        )
    }

    fn cell_of(&self, p: &Point) -> Option<(usize, usize)> {
        let (c, r) = self.raw_cell(p);
        if c < 0 || r < 0 || c >= self.columns as i64 || r >= self.rows as i64 {
            return None;
        }
        Some((c as usize, r as usize))
    }

    fn cell_key(&self, (c, r): (usize, usize)) -> usize {
        r * self.columns + c
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::Network;

    fn grid() -> (GridIndex, Vec<RoadSegment>) {
        let mut network = Network::new();
        network.add_node("a", Point(0.0, 0.0)).unwrap();
        network.add_node("b", Point(1000.0, 0.0)).unwrap();
        network.add_node("c", Point(1000.0, 1000.0)).unwrap();
        network.add_way("long", &["a", "b"]).unwrap();
        network.add_way("up", &["b", "c"]).unwrap();
        let segments = network.segments(DistanceFunction::Euclidean);
        let bbox = network.bounding_box().unwrap();
        let index =
            GridIndex::build(&bbox, &segments, 20.0, 2.0, DistanceFunction::Euclidean).unwrap();
        (index, segments)
    }

    #[test]
    fn test_long_segment_found_in_the_middle() {
        let (index, _) = grid();
        // far from both endpoints of "long"
        let hits = index.query(&Point(503.0, 19.0), 20.0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].road_id, "long");
        assert!((hits[0].distance - 19.0).abs() < 1e-9);
        assert!((hits[0].position.unwrap().offset - 503.0).abs() < 1e-9);
    }

    #[test]
    fn test_radius_is_strict() {
        let (index, _) = grid();
        assert!(index.query(&Point(500.0, 20.0), 20.0).is_empty());
        assert!(index.query(&Point(500.0, 25.0), 20.0).is_empty());
    }

    #[test]
    fn test_sweep_has_no_false_negatives() {
        let (index, segments) = grid();
        let d = DistanceFunction::Euclidean;
        let mut y = -30.0;
        while y <= 1030.0 {
            let mut x = -30.0;
            while x <= 1030.0 {
                let p = Point(x, y);
                let expected: HashSet<String> = segments
                    .iter()
                    .filter(|s| d.project(&p, &s.from, &s.to).distance < 20.0)
                    .map(|s| s.road_id.clone())
                    .collect();
                let found: HashSet<String> =
                    index.query(&p, 20.0).into_iter().map(|m| m.road_id).collect();
                assert_eq!(expected, found, "at ({}, {})", x, y);
                x += 7.3;
            }
            y += 7.3;
        }
    }

    #[test]
    fn test_point_outside_bbox_still_matches() {
        let (index, _) = grid();
        let hits = index.query(&Point(-15.0, -5.0), 20.0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].road_id, "long");
        assert!(index.query(&Point(-5000.0, 0.0), 20.0).is_empty());
    }

    #[test]
    fn test_corner_returns_both_nearest_first() {
        let (index, _) = grid();
        let hits = index.query(&Point(995.0, 3.0), 20.0);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].road_id, "long");
        assert_eq!(hits[1].road_id, "up");
    }

    #[test]
    fn test_great_circle_sweep_has_no_false_negatives() {
        let d = DistanceFunction::GreatCircle;
        let mut network = Network::new();
        network.add_node("a", Point(121.0, 31.0)).unwrap();
        network.add_node("b", Point(121.01, 31.0)).unwrap();
        network.add_node("c", Point(121.01, 31.01)).unwrap();
        network.add_way("east", &["a", "b"]).unwrap();
        network.add_way("north", &["b", "c"]).unwrap();
        let segments = network.segments(d);
        let bbox = network.bounding_box().unwrap();
        let index = GridIndex::build(&bbox, &segments, 20.0, 2.0, d).unwrap();
        let step = 0.00007;
        let mut y = 30.9997;
        while y <= 31.0103 {
            let mut x = 120.9997;
            while x <= 121.0103 {
                let p = Point(x, y);
                let expected: HashSet<String> = segments
                    .iter()
                    .filter(|s| d.project(&p, &s.from, &s.to).distance < 20.0)
                    .map(|s| s.road_id.clone())
                    .collect();
                let found: HashSet<String> =
                    index.query(&p, 20.0).into_iter().map(|m| m.road_id).collect();
                assert_eq!(expected, found, "at ({}, {})", x, y);
                x += step;
            }
            y += step;
        }
    }

    #[test]
    fn test_duplicate_segment_returned_once() {
        let (mut index, segments) = grid();
        index.insert(segments[0].clone()).unwrap();
        let hits = index.query(&Point(500.0, 5.0), 20.0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].road_id, "long");
    }

    #[test]
    fn test_inconsistent_length_rejected() {
        let (mut index, segments) = grid();
        let mut bad = segments[0].clone();
        bad.length = 5.0;
        assert!(index.insert(bad).is_err());
    }
}
