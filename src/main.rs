use anyhow::Result;
use clap::Parser;
use geojson::{Feature, FeatureCollection, GeoJson, Geometry, JsonObject, Value};
use log::{debug, info};
use rkmm::algorithm::{DistanceFunction, Point};
use rkmm::graph::Network;
use rkmm::mm::{BatchOutput, Config, MapMatcher, MutileTrajectory, Trajectory};
use rkmm::utils;
use std::fs;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rkmm")]
#[command(version = "0.1")]
#[command(about = "top-k hmm map matching using rust", long_about = None)]
struct Args {
    /// find candidate roads in radius, meters
    #[arg(long, default_value_t = 50.0)]
    candidate_radius: f64,
    /// unmatched interval grows while the nearest road is farther, meters
    #[arg(long, default_value_t = 15.0)]
    gap_extension_range: f64,
    /// number of ranked matches per trajectory
    #[arg(short = 'k', long, default_value_t = 3)]
    rank_length: usize,
    /// max time between observations of one run, seconds
    #[arg(long, default_value_t = 180.0)]
    max_time_gap: f64,
    /// gps noise of the emission model
    #[arg(long, default_value_t = 4.07)]
    sigma: f64,
    /// scale of the transition model
    #[arg(long, default_value_t = 1.0)]
    beta: f64,
    /// max speed, meters per second
    #[arg(long, default_value_t = 50.0)]
    max_speed: f64,
    /// max route length relative to the straight line distance
    #[arg(long, default_value_t = 8.0)]
    route_factor: f64,
    /// keep only the nearest candidates of each observation
    #[arg(long)]
    max_candidates: Option<usize>,
    /// outliers a broken run may skip before restarting
    #[arg(long, default_value_t = 1)]
    max_skipped_points: usize,
    /// backward drift on one segment treated as standing still, meters
    #[arg(long, default_value_t = 5.0)]
    reverse_tolerance: f64,
    /// grid cell size relative to the candidate radius
    #[arg(long, default_value_t = 2.0)]
    grid_cell_factor: f64,
    /// steps between back pointer compactions
    #[arg(long, default_value_t = 16)]
    compaction_interval: usize,
    /// coordinates are planar meters instead of lon/lat
    #[arg(long)]
    euclidean: bool,
    /// match trajectories on all cores
    #[arg(long)]
    parallel: bool,
    /// road network path
    #[arg(short, long, value_name = "ROAD_NETWORK_FILE")]
    network_file: PathBuf,
    /// geojson output, stdout when absent
    #[arg(short, long, value_name = "OUTPUT_FILE")]
    output: Option<PathBuf>,

    /// input gps traj, geojson or wkt
    #[arg(value_name = "GPS_TRAJ_FILE")]
    input_file: PathBuf,
}

impl Args {
    fn config(&self) -> Config {
        Config {
            candidate_radius: self.candidate_radius,
            gap_extension_range: self.gap_extension_range,
            rank_length: self.rank_length,
            max_time_gap: self.max_time_gap,
            sigma: self.sigma,
            beta: self.beta,
            max_speed: self.max_speed,
            route_factor: self.route_factor,
            max_candidates: self.max_candidates,
            max_skipped_points: self.max_skipped_points,
            reverse_tolerance: self.reverse_tolerance,
            grid_cell_factor: self.grid_cell_factor,
            compaction_interval: self.compaction_interval,
            distance: if self.euclidean {
                DistanceFunction::Euclidean
            } else {
                DistanceFunction::GreatCircle
            },
        }
    }
}

fn read_trajectories(path: &PathBuf) -> Result<MutileTrajectory> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    match ext {
        "geojson" | "json" => {
            info!("read geojson file {} ", path.display());
            let reader = BufReader::new(File::open(path)?);
            let geojson = GeoJson::from_reader(reader)?;
            MutileTrajectory::try_from(geojson)
        }
        "wkt" => {
            info!("read wkt file {} ", path.display());
            let content = fs::read_to_string(path)?;
            let wkt: wkt::Wkt<f64> = content
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("parse wkt failed: {}", e))?;
            MutileTrajectory::try_from(wkt)
        }
        _ => Err(anyhow::anyhow!("gps file format {} not support", ext)),
    }
}

fn geometry(points: &[Point]) -> Geometry {
    let positions: Vec<Vec<f64>> = points.iter().map(|p| vec![p.x(), p.y()]).collect();
    if positions.len() == 1 {
        Geometry::new(Value::Point(positions[0].clone()))
    } else {
        Geometry::new(Value::LineString(positions))
    }
}

fn feature(geometry: Geometry, properties: JsonObject) -> Feature {
    Feature {
        bbox: None,
        geometry: Some(geometry),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

fn unmatched_feature(trajectory: &Trajectory) -> Feature {
    let points: Vec<Point> = trajectory.points().iter().map(|p| p.point).collect();
    let mut properties = JsonObject::new();
    properties.insert("trajectory_id".to_string(), trajectory.id().into());
    properties.insert("unmatched".to_string(), true.into());
    properties.insert(
        "timestamps".to_string(),
        trajectory
            .points()
            .iter()
            .map(|p| serde_json::Value::from(p.time_stamp))
            .collect::<Vec<_>>()
            .into(),
    );
    feature(geometry(&points), properties)
}

fn to_geojson(output: &BatchOutput) -> GeoJson {
    let mut features = Vec::new();
    for result in output.results.iter() {
        for (rank, ranked) in result.ranks.iter().enumerate() {
            let points: Vec<Point> = ranked
                .sequence
                .iter()
                .filter(|s| !s.state.is_empty())
                .map(|s| s.state.point)
                .collect();
            if points.is_empty() {
                continue;
            }
            let mut properties = JsonObject::new();
            properties.insert("trajectory_id".to_string(), result.trajectory_id.as_str().into());
            properties.insert("rank".to_string(), rank.into());
            properties.insert("probability".to_string(), ranked.probability.into());
            properties.insert("log_probability".to_string(), ranked.log_probability.into());
            properties.insert("road_ids".to_string(), ranked.road_ids.clone().into());
            properties.insert("break_points".to_string(), result.break_points.len().into());
            features.push(feature(geometry(&points), properties));
        }
    }
    features.extend(output.unmatched.iter().map(unmatched_feature));
    GeoJson::FeatureCollection(FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    })
}

fn main() -> Result<()> {
    utils::log::log_init();
    let args = Args::parse();
    debug!("{:?}", args);

    info!("try construct map matching network from geojson file");
    let network = Network::from_file(&args.network_file)?;
    let matcher = MapMatcher::new(&network, args.config())?;

    let trajectories = read_trajectories(&args.input_file)?;
    info!("{} trajectories loaded", trajectories.trajs.len());

    let output = if args.parallel {
        matcher.match_trajectories_parallel(&trajectories.trajs, None)
    } else {
        matcher.match_trajectories(&trajectories.trajs)
    };
    for result in output.results.iter() {
        if let Some(best) = result.best() {
            info!(
                "trajectory {} match roads: {:?}, probability {:.6}",
                result.trajectory_id, best.road_ids, best.probability
            );
        }
    }
    info!("{:?}", output.statistics);

    let content = to_geojson(&output).to_string();
    match &args.output {
        Some(path) => {
            fs::write(path, content)?;
            info!("result written to {}", path.display());
        }
        None => println!("{}", content),
    }
    Ok(())
}
