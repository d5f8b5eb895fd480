/// Emission and transition log-probabilities of the HMM.
///
/// Emission follows a zero-mean Gaussian over the observation-to-candidate
/// distance; transition follows an exponential distribution over
/// `|linear distance - route length| / time difference`.
#[derive(Debug, Clone, Copy)]
pub struct HmmProbabilities {
    sigma: f64,
    beta: f64,
    max_speed: f64,
    route_factor: f64,
}

impl HmmProbabilities {
    pub fn new(sigma: f64, beta: f64, max_speed: f64, route_factor: f64) -> Self {
        HmmProbabilities {
            sigma,
            beta,
            max_speed,
            route_factor,
        }
    }

    pub fn emission_log_probability(&self, distance: f64) -> f64 {
        log_normal_distribution(self.sigma, distance)
    }

    /// # Panics
    /// when `time_diff` is not positive
    pub fn transition_log_probability(
        &self,
        route_length: f64,
        linear_distance: f64,
        time_diff: f64,
    ) -> f64 {
        assert!(
            time_diff > 0.0,
            "time difference between observations must be positive, got {}",
            time_diff
        );
        let metric = (linear_distance - route_length).abs() / time_diff;
        log_exponential_distribution(self.beta, metric)
    }

    /// Best case transition between two observations, used to price a skip
    /// over unmatched points.
    pub fn max_transition_log_probability(&self, linear_distance: f64, time_diff: f64) -> f64 {
        let route_length = self.max_route_length(linear_distance, time_diff);
        self.transition_log_probability(route_length, linear_distance, time_diff)
    }

    /// upper bound of the route length considered feasible between two observations
    pub fn max_route_length(&self, linear_distance: f64, time_diff: f64) -> f64 {
        (self.max_speed * time_diff).min(linear_distance * self.route_factor)
    }
}

fn log_normal_distribution(sigma: f64, x: f64) -> f64 {
    (1.0 / ((2.0 * std::f64::consts::PI).sqrt() * sigma)).ln() - 0.5 * (x / sigma).powi(2)
}

fn log_exponential_distribution(beta: f64, x: f64) -> f64 {
    (1.0 / beta).ln() - x / beta
}
