pub mod index;
pub mod matcher;
pub mod merge;
pub mod model;
pub mod probability;
pub mod traj;
pub mod viterbi;

pub use matcher::{BatchOutput, MapMatcher};
pub use model::{BreakType, Config, MatchOutcome, RankedMatch, TrajectoryMatchingResult};
pub use traj::{MutileTrajectory, Trajectory, TrajectoryPoint};
