use crate::algorithm;
use anyhow::Result;
use geojson::JsonObject;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryPoint {
    pub point: algorithm::Point,
    /// seconds, strictly increasing within a trajectory
    pub time_stamp: i64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
}

impl TrajectoryPoint {
    pub fn new(x: f64, y: f64, time_stamp: i64) -> Self {
        TrajectoryPoint {
            point: algorithm::Point(x, y),
            time_stamp,
            speed: None,
            heading: None,
        }
    }
}

/// A non-empty, time ordered sequence of observations.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    id: String,
    points: Vec<TrajectoryPoint>,
}

impl Trajectory {
    pub fn new(id: impl Into<String>, points: Vec<TrajectoryPoint>) -> Result<Self> {
        let id = id.into();
        if points.is_empty() {
            return Err(anyhow::anyhow!("trajectory {} is empty", id));
        }
        if let Some(pair) = points
            .windows(2)
            .find(|pair| pair[1].time_stamp <= pair[0].time_stamp)
        {
            return Err(anyhow::anyhow!(
                "trajectory {} timestamps not increasing: {} -> {}",
                id,
                pair[0].time_stamp,
                pair[1].time_stamp
            ));
        }
        Ok(Trajectory { id, points })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn points(&self) -> &[TrajectoryPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// sub trajectory over `[begin, end)`
    pub fn sub(&self, begin: usize, end: usize) -> Result<Trajectory> {
        if begin >= end || end > self.points.len() {
            return Err(anyhow::anyhow!(
                "invalid sub range [{}, {}) of trajectory {} with {} points",
                begin,
                end,
                self.id,
                self.points.len()
            ));
        }
        Ok(Trajectory {
            id: format!("{}_{}_{}", self.id, begin, end),
            points: self.points[begin..end].to_vec(),
        })
    }
}

impl std::ops::Index<usize> for Trajectory {
    type Output = TrajectoryPoint;
    fn index(&self, index: usize) -> &Self::Output {
        &self.points[index]
    }
}

pub struct MutileTrajectory {
    pub trajs: Vec<Trajectory>,
}

fn feature_id(feature: &geojson::Feature) -> String {
    let from_props = feature
        .properties
        .as_ref()
        .and_then(|p| p.get("id"))
        .map(|v| v.as_str().map(|s| s.to_string()).unwrap_or_else(|| v.to_string()));
    match &feature.id {
        Some(geojson::feature::Id::String(s)) => s.clone(),
        Some(geojson::feature::Id::Number(n)) => n.to_string(),
        None => from_props.unwrap_or_else(|| Uuid::new_v4().to_string()),
    }
}

// 没有时间戳时使用点的序号
fn timestamps(properties: Option<&JsonObject>, len: usize) -> Result<Vec<i64>> {
    match properties.and_then(|p| p.get("timestamps")) {
        Some(value) => {
            let array = value
                .as_array()
                .ok_or_else(|| anyhow::anyhow!("timestamps must be an array"))?;
            if array.len() != len {
                return Err(anyhow::anyhow!(
                    "timestamps size {} not match point size {}",
                    array.len(),
                    len
                ));
            }
            array
                .iter()
                .map(|v| {
                    v.as_i64()
                        .ok_or_else(|| anyhow::anyhow!("timestamp {} is not an integer", v))
                })
                .collect()
        }
        None => Ok((0..len as i64).collect()),
    }
}

fn build_traj(id: String, positions: Vec<Vec<f64>>, time_stamps: Vec<i64>) -> Result<Trajectory> {
    let points = positions
        .iter()
        .zip(time_stamps)
        .map(|(p, t)| {
            let point = algorithm::position_point(p)?;
            Ok(TrajectoryPoint::new(point.0, point.1, t))
        })
        .collect::<Result<Vec<_>>>()?;
    Trajectory::new(id, points)
}

fn geometry_positions(value: geojson::Value) -> Result<Vec<Vec<f64>>> {
    match value {
        geojson::Value::LineString(line) => Ok(line),
        geojson::Value::MultiPoint(multi_points) => Ok(multi_points),
        _ => Err(anyhow::anyhow!(
            "geometry only support LineString, MultiPoint"
        )),
    }
}

// 实现轨迹转换trait
impl TryFrom<geojson::GeoJson> for MutileTrajectory {
    type Error = anyhow::Error;
    fn try_from(value: geojson::GeoJson) -> Result<Self, Self::Error> {
        let mut trajs = MutileTrajectory { trajs: Vec::new() };
        match value {
            geojson::GeoJson::FeatureCollection(fc) => {
                for feature in fc.features {
                    let id = feature_id(&feature);
                    let geometry = feature
                        .geometry
                        .ok_or_else(|| anyhow::anyhow!("feature {} without geometry", id))?;
                    let positions = geometry_positions(geometry.value)?;
                    let time_stamps = timestamps(feature.properties.as_ref(), positions.len())?;
                    trajs.trajs.push(build_traj(id, positions, time_stamps)?);
                }
            }
            geojson::GeoJson::Feature(feature) => {
                let id = feature_id(&feature);
                let geometry = feature
                    .geometry
                    .ok_or_else(|| anyhow::anyhow!("feature {} without geometry", id))?;
                let positions = geometry_positions(geometry.value)?;
                let time_stamps = timestamps(feature.properties.as_ref(), positions.len())?;
                trajs.trajs.push(build_traj(id, positions, time_stamps)?);
            }
            geojson::GeoJson::Geometry(geom) => {
                let positions = geometry_positions(geom.value)?;
                let time_stamps = timestamps(None, positions.len())?;
                trajs
                    .trajs
                    .push(build_traj(Uuid::new_v4().to_string(), positions, time_stamps)?);
            }
        }
        Ok(trajs)
    }
}

impl TryFrom<wkt::Wkt<f64>> for MutileTrajectory {
    type Error = anyhow::Error;
    fn try_from(value: wkt::Wkt<f64>) -> Result<Self, Self::Error> {
        let positions: Vec<Vec<f64>> = match value.item {
            wkt::Geometry::LineString(line) => {
                line.0.into_iter().map(|c| vec![c.x, c.y]).collect()
            }
            wkt::Geometry::MultiPoint(multi_points) => multi_points
                .0
                .into_iter()
                .filter_map(|point| point.0.map(|c| vec![c.x, c.y]))
                .collect(),
            _ => {
                return Err(anyhow::anyhow!("wkt only support LineString, MultiPoint"));
            }
        };
        let len = positions.len();
        let traj = build_traj(
            Uuid::new_v4().to_string(),
            positions,
            (0..len as i64).collect(),
        )?;
        Ok(MutileTrajectory { trajs: vec![traj] })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_empty_trajectory_rejected() {
        assert!(Trajectory::new("t", vec![]).is_err());
    }

    #[test]
    fn test_non_increasing_timestamps_rejected() {
        let points = vec![TrajectoryPoint::new(0.0, 0.0, 5), TrajectoryPoint::new(1.0, 0.0, 5)];
        assert!(Trajectory::new("t", points).is_err());
    }

    #[test]
    fn test_sub_is_end_exclusive() {
        let points = (0..5)
            .map(|i| TrajectoryPoint::new(i as f64, 0.0, i))
            .collect();
        let traj = Trajectory::new("t", points).unwrap();
        let sub = traj.sub(1, 3).unwrap();
        assert_eq!(sub.len(), 2);
        assert_eq!(sub[0].time_stamp, 1);
        assert_eq!(sub[1].time_stamp, 2);
        assert!(traj.sub(3, 3).is_err());
        assert!(traj.sub(2, 6).is_err());
    }

    #[test]
    fn test_geojson_with_timestamps() {
        let text = r#"{
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "id": "car-1",
                "geometry": {"type": "LineString", "coordinates": [[0.0, 0.0], [1.0, 0.0]]},
                "properties": {"timestamps": [100, 130]}
            }]
        }"#;
        let geojson: geojson::GeoJson = text.parse().unwrap();
        let trajs = MutileTrajectory::try_from(geojson).unwrap();
        assert_eq!(trajs.trajs.len(), 1);
        assert_eq!(trajs.trajs[0].id(), "car-1");
        assert_eq!(trajs.trajs[0][1].time_stamp, 130);
    }

    #[test]
    fn test_short_position_rejected() {
        let positions = vec![vec![0.0, 0.0], vec![1.0]];
        assert!(build_traj("t".to_string(), positions, vec![0, 1]).is_err());
    }

    #[test]
    fn test_wkt_linestring() {
        let wkt: wkt::Wkt<f64> = "LINESTRING(0 0, 1 1, 2 2)".parse().unwrap();
        let trajs = MutileTrajectory::try_from(wkt).unwrap();
        assert_eq!(trajs.trajs[0].len(), 3);
        assert_eq!(trajs.trajs[0][2].point, algorithm::Point(2.0, 2.0));
    }
}
