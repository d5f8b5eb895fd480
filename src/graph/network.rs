use crate::algorithm::{self, BoundingBox, DistanceFunction, Point};
use anyhow::Result;
use geojson::JsonObject;
use log::debug;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
/**
 * @file network.rs
 * 定义路网信息结构体
 * 节点 + 有向道路(有序节点列表), 可分解为路段。
 */
pub struct Network {
    ways_index: HashMap<String, usize>,  // way的id对应的索引
    nodes_index: HashMap<String, usize>, // node的id对应的索引
    pub ways: Vec<RoadWay>,              // 所有的way
    pub nodes: Vec<RoadNode>,            // 所有的node
}

#[derive(Debug, Clone)]
pub struct RoadNode {
    pub id: String,
    pub point: Point,
}

/// A directed road-way, traversed in node order.
#[derive(Debug, Clone)]
pub struct RoadWay {
    pub id: String,
    pub nodes: Vec<usize>, // node索引
}

/// One straight piece of a road-way between two consecutive nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct RoadSegment {
    pub from: Point,
    pub to: Point,
    pub road_id: String,
    pub from_node: usize,
    pub to_node: usize,
    /// meters, measured with the distance function the segment was built with
    pub length: f64,
}

impl RoadSegment {
    /// identity of a segment: endpoint pair + owning road-way
    pub fn same_segment(&self, other: &RoadSegment) -> bool {
        self.from == other.from && self.to == other.to && self.road_id == other.road_id
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl Network {
    pub fn new() -> Self {
        Network {
            ways_index: HashMap::new(),
            nodes_index: HashMap::new(),
            ways: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub fn find_node_by_id(&self, id: &str) -> Option<usize> {
        self.nodes_index.get(id).copied()
    }

    /// 添加node
    pub fn add_node(&mut self, id: &str, point: Point) -> Result<usize> {
        if self.nodes_index.contains_key(id) {
            return Err(anyhow::anyhow!("node {} already exists", id));
        }
        self.nodes.push(RoadNode {
            id: id.to_string(),
            point,
        });
        self.nodes_index.insert(id.to_string(), self.nodes.len() - 1);
        Ok(self.nodes.len() - 1)
    }

    /// 添加way, 节点必须已存在
    pub fn add_way(&mut self, id: &str, node_ids: &[&str]) -> Result<usize> {
        if self.ways_index.contains_key(id) {
            return Err(anyhow::anyhow!("way {} already exists", id));
        }
        if node_ids.len() < 2 {
            return Err(anyhow::anyhow!("way {} needs at least two nodes", id));
        }
        let mut nodes = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            let index = self
                .find_node_by_id(node_id)
                .ok_or_else(|| anyhow::anyhow!("way {} references unknown node {}", id, node_id))?;
            nodes.push(index);
        }
        self.ways.push(RoadWay {
            id: id.to_string(),
            nodes,
        });
        self.ways_index.insert(id.to_string(), self.ways.len() - 1);
        Ok(self.ways.len() - 1)
    }

    /// 分解为路段, 零长度路段被丢弃
    pub fn segments(&self, distance: DistanceFunction) -> Vec<RoadSegment> {
        let mut segments = Vec::new();
        for way in &self.ways {
            for pair in way.nodes.windows(2) {
                let from = self.nodes[pair[0]].point;
                let to = self.nodes[pair[1]].point;
                let length = distance.distance(&from, &to);
                if length <= 0.0 {
                    continue;
                }
                segments.push(RoadSegment {
                    from,
                    to,
                    road_id: way.id.clone(),
                    from_node: pair[0],
                    to_node: pair[1],
                    length,
                });
            }
        }
        segments
    }

    /// bounding box of every node referenced by a way
    pub fn bounding_box(&self) -> Result<BoundingBox> {
        let points = self
            .ways
            .iter()
            .flat_map(|way| way.nodes.iter())
            .map(|index| &self.nodes[*index].point);
        let bbox = BoundingBox::from_points(points)
            .ok_or_else(|| anyhow::anyhow!("road network is empty"))?;
        if bbox.is_degenerate() {
            return Err(anyhow::anyhow!("road network bounding box is degenerate"));
        }
        Ok(bbox)
    }

    fn ensure_node(&mut self, id: &str, point: Point) -> Result<()> {
        if self.find_node_by_id(id).is_none() {
            self.add_node(id, point)?;
        }
        Ok(())
    }
}

fn property_id(properties: &JsonObject, key: &str) -> Result<String> {
    match properties.get(key) {
        Some(v) if v.is_i64() || v.is_u64() => Ok(v.to_string()),
        Some(v) if v.is_string() => Ok(v.as_str().unwrap_or_default().to_string()),
        _ => Err(anyhow::anyhow!("feature property {} missing or invalid", key)),
    }
}

impl TryFrom<geojson::GeoJson> for Network {
    type Error = anyhow::Error;
    fn try_from(value: geojson::GeoJson) -> std::result::Result<Self, Self::Error> {
        let mut network = Network::new();
        let feature_collection = match value {
            geojson::GeoJson::FeatureCollection(fc) => fc,
            _ => return Err(anyhow::anyhow!("not a feature collection")),
        };
        for feature in feature_collection.features {
            let geometry = feature
                .geometry
                .ok_or_else(|| anyhow::anyhow!("feature without geometry"))?;
            let properties = feature
                .properties
                .ok_or_else(|| anyhow::anyhow!("feature without properties"))?;
            let points = algorithm::linestring_points(&geometry)?;
            let id = property_id(&properties, "edge_id")?;
            let from = property_id(&properties, "from_node_id")?;
            let to = property_id(&properties, "to_node_id")?;
            let oneway = properties
                .get("oneway")
                .and_then(|v| v.as_bool())
                .unwrap_or(true);

            // 中间点作为该way私有的节点
            let last = points.len() - 1;
            let mut node_ids = Vec::with_capacity(points.len());
            for (i, point) in points.iter().enumerate() {
                let node_id = if i == 0 {
                    from.clone()
                } else if i == last {
                    to.clone()
                } else {
                    format!("{}:{}", id, i)
                };
                network.ensure_node(&node_id, *point)?;
                node_ids.push(node_id);
            }
            let refs: Vec<&str> = node_ids.iter().map(|s| s.as_str()).collect();
            network.add_way(&id, &refs)?;
            if !oneway {
                let reversed: Vec<&str> = refs.iter().rev().copied().collect();
                network.add_way(&format!("{}-rev", id), &reversed)?;
            }
        }
        debug!(
            "geojson network loaded, node size: {}, way size: {}",
            network.nodes.len(),
            network.ways.len()
        );
        Ok(network)
    }
}

impl Network {
    /// 从geojson文件加载路网
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| anyhow::anyhow!("open network file {} failed: {}", path.display(), e))?;
        let geojson = geojson::GeoJson::from_reader(BufReader::new(file))?;
        Network::try_from(geojson)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_way_with_unknown_node_rejected() {
        let mut network = Network::new();
        network.add_node("a", Point(0.0, 0.0)).unwrap();
        assert!(network.add_way("w", &["a", "b"]).is_err());
        assert!(network.add_node("a", Point(1.0, 1.0)).is_err());
    }

    #[test]
    fn test_segment_decomposition() {
        let mut network = Network::new();
        network.add_node("a", Point(0.0, 0.0)).unwrap();
        network.add_node("b", Point(3.0, 4.0)).unwrap();
        network.add_node("c", Point(3.0, 4.0)).unwrap();
        network.add_node("d", Point(3.0, 10.0)).unwrap();
        network.add_way("w", &["a", "b", "c", "d"]).unwrap();
        let segments = network.segments(DistanceFunction::Euclidean);
        // b-c has zero length
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].length, 5.0);
        assert_eq!(segments[1].length, 6.0);
        assert!(segments.iter().all(|s| s.road_id == "w"));
    }

    #[test]
    fn test_empty_network_has_no_bbox() {
        assert!(Network::new().bounding_box().is_err());
    }

    #[test]
    fn test_geojson_two_way_road() {
        let text = r#"{
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "geometry": {"type": "LineString", "coordinates": [[0.0, 0.0], [0.001, 0.0], [0.002, 0.0]]},
                "properties": {"edge_id": 7, "from_node_id": 1, "to_node_id": 2, "oneway": false}
            }]
        }"#;
        let geojson: geojson::GeoJson = text.parse().unwrap();
        let network = Network::try_from(geojson).unwrap();
        assert_eq!(network.nodes.len(), 3);
        assert_eq!(network.ways.len(), 2);
        let reverse = network.ways.iter().find(|w| w.id == "7-rev").unwrap();
        assert_eq!(network.nodes[reverse.nodes[0]].id, "2");
    }
}
