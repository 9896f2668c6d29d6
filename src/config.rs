use std::cell::RefCell;
use std::collections::BTreeSet;
use std::error::Error;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::str::FromStr;

use serde::Deserialize;

use crate::errors::SolverError;
use crate::individuals::Individual;
use crate::lru::{CacheCounters, LruCache};
use crate::penalty::PenaltyState;
use crate::tsp::{PathOrder, PathOrderCache};
use crate::utils::weird_round;

#[derive(Clone, Copy, Debug)]
pub struct Customer {
    pub x: f64,
    pub y: f64,
    pub low: u64,
    pub high: u64,
    pub w: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct Vehicle {
    pub speed: f64,
    pub capacity: u64,
    pub cost_per_distance: f64,
    pub trip_time_limit: f64,
}

#[derive(Debug, Deserialize)]
struct CostCoefficients {
    truck_cost_over_time: f64,
    drone_cost_over_time: f64,
}

/// The loaded problem: immutable after construction, except for the
/// algorithm-tuning knobs the driver sets before solving.
#[derive(Debug)]
pub struct ProblemConfig {
    pub problem: String,
    pub trucks_count: usize,
    pub drones_count: usize,
    pub working_time_limit: f64,
    pub truck: Vehicle,
    pub drone: Vehicle,

    /// Index 0 is the depot with a zeroed profile.
    pub customers: Vec<Customer>,
    /// Symmetric, zero diagonal, rounded up to 2 decimals.
    pub distances: Vec<Vec<f64>>,
    /// Customer indices sorted by profit descending, depot excluded.
    pub customers_by_profit: Vec<usize>,

    // Tuning knobs.
    pub mutation_rate: f64,
    pub reset_after: usize,
    pub stuck_penalty_increase_rate: f64,
    pub local_search_batch: usize,
    pub cache_limit: usize,
    pub fake_tsp_solver: bool,
}

fn config_error(path: &Path, source: impl Into<Box<dyn Error>>) -> SolverError {
    SolverError::Config {
        path: path.display().to_string(),
        source: source.into(),
    }
}

fn parse_field<T>(record: &csv::StringRecord, index: usize, path: &Path) -> Result<T, SolverError>
where
    T: FromStr,
    T::Err: Error + 'static,
{
    let raw = record
        .get(index)
        .ok_or_else(|| config_error(path, format!("missing column {index} in {record:?}")))?;

    raw.trim()
        .parse::<T>()
        .map_err(|error| config_error(path, Box::new(error) as Box<dyn Error>))
}

impl ProblemConfig {
    /// Read `params.csv`, `coefficients.json` and `<problem>.csv` from
    /// `problems_dir`.
    pub fn load(problem: &str, problems_dir: &str) -> Result<Self, SolverError> {
        let directory = Path::new(problems_dir);

        let params_path = directory.join("params.csv");
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&params_path)
            .map_err(|error| config_error(&params_path, error))?;

        let mut row = None;
        for record in reader.records() {
            let record = record.map_err(|error| config_error(&params_path, error))?;
            if record.get(0) == Some(problem) {
                row = Some(record);
                break;
            }
        }

        let row = row.ok_or_else(|| SolverError::UnknownProblem {
            name: problem.to_string(),
        })?;

        let trucks_count = parse_field::<usize>(&row, 1, &params_path)?;
        let drones_count = parse_field::<usize>(&row, 2, &params_path)?;
        let working_time_limit = parse_field::<f64>(&row, 3, &params_path)?;
        let truck_capacity = parse_field::<u64>(&row, 4, &params_path)?;
        let drone_capacity = parse_field::<u64>(&row, 5, &params_path)?;
        let drone_speed = parse_field::<f64>(&row, 6, &params_path)?;
        let truck_speed = parse_field::<f64>(&row, 7, &params_path)?;
        let drone_trip_time_limit = parse_field::<f64>(&row, 8, &params_path)?;

        let coefficients_path = directory.join("coefficients.json");
        let data = fs::read_to_string(&coefficients_path)
            .map_err(|error| config_error(&coefficients_path, error))?;
        let coefficients = serde_json::from_str::<CostCoefficients>(&data)
            .map_err(|error| config_error(&coefficients_path, error))?;

        let customers_path = directory.join(format!("{problem}.csv"));
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(&customers_path)
            .map_err(|error| config_error(&customers_path, error))?;

        let mut customers = vec![];
        for record in reader.records() {
            let record = record.map_err(|error| config_error(&customers_path, error))?;
            customers.push(Customer {
                x: parse_field(&record, 1, &customers_path)?,
                y: parse_field(&record, 2, &customers_path)?,
                low: parse_field(&record, 3, &customers_path)?,
                high: parse_field(&record, 4, &customers_path)?,
                w: parse_field(&record, 5, &customers_path)?,
            });
        }

        let truck = Vehicle {
            speed: truck_speed,
            capacity: truck_capacity,
            cost_per_distance: coefficients.truck_cost_over_time / truck_speed,
            trip_time_limit: f64::INFINITY,
        };
        let drone = Vehicle {
            speed: drone_speed,
            capacity: drone_capacity,
            cost_per_distance: coefficients.drone_cost_over_time / drone_speed,
            trip_time_limit: drone_trip_time_limit,
        };

        Ok(Self::from_parts(
            problem.to_string(),
            trucks_count,
            drones_count,
            working_time_limit,
            truck,
            drone,
            customers,
        ))
    }

    /// Assemble a problem from already-parsed parts. The depot row is
    /// prepended here; `customers` holds real customers only.
    pub fn from_parts(
        problem: String,
        trucks_count: usize,
        drones_count: usize,
        working_time_limit: f64,
        truck: Vehicle,
        drone: Vehicle,
        customers: Vec<Customer>,
    ) -> Self {
        let mut all_customers = Vec::with_capacity(customers.len() + 1);
        all_customers.push(Customer {
            x: 0.0,
            y: 0.0,
            low: 0,
            high: 0,
            w: 0,
        });
        all_customers.extend(customers);

        let count = all_customers.len();
        let mut distances = vec![vec![0.0; count]; count];
        for first in 0..count {
            for second in first + 1..count {
                let dx = all_customers[first].x - all_customers[second].x;
                let dy = all_customers[first].y - all_customers[second].y;
                let distance = weird_round(dx.hypot(dy), 2);
                distances[first][second] = distance;
                distances[second][first] = distance;
            }
        }

        let mut customers_by_profit = Vec::from_iter(1..count);
        customers_by_profit.sort_by(|&f, &s| all_customers[s].w.cmp(&all_customers[f].w));

        Self {
            problem,
            trucks_count,
            drones_count,
            working_time_limit,
            truck,
            drone,
            customers: all_customers,
            distances,
            customers_by_profit,
            mutation_rate: 0.6,
            reset_after: 15,
            stuck_penalty_increase_rate: 10.0,
            local_search_batch: 10,
            cache_limit: 50_000,
            fake_tsp_solver: false,
        }
    }
}

/// Everything one solve shares: the problem, both caches and the penalty
/// state. Passed explicitly wherever it is needed; solving another problem
/// means building a new context with fresh caches.
pub struct Context {
    pub config: ProblemConfig,
    pub tsp: PathOrderCache,
    pub penalty: PenaltyState,
    individuals: RefCell<LruCache<Rc<Individual>, Rc<Individual>>>,
}

impl Context {
    pub fn new(config: ProblemConfig) -> Self {
        let tsp = PathOrderCache::new(config.cache_limit, config.fake_tsp_solver);
        let individuals = RefCell::new(LruCache::new(config.cache_limit));
        Self {
            config,
            tsp,
            penalty: PenaltyState::new(),
            individuals,
        }
    }

    pub fn path_order(&self, customers: &BTreeSet<usize>) -> Rc<PathOrder> {
        self.tsp.path_order(&self.config.distances, customers)
    }

    pub fn refine_path_order(&self, customers: &BTreeSet<usize>) -> Rc<PathOrder> {
        self.tsp.refine(&self.config.distances, customers)
    }

    /// De-duplicate structurally equal individuals through the LRU intern
    /// table.
    pub fn intern(&self, candidate: Rc<Individual>) -> Rc<Individual> {
        let mut cache = self.individuals.borrow_mut();
        match cache.get(&candidate) {
            Some(existing) => existing,
            None => {
                cache.put(candidate.clone(), candidate.clone());
                candidate
            }
        }
    }

    pub fn individual_counters(&self) -> CacheCounters {
        self.individuals.borrow().counters()
    }
}


#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    use crate::errors::SolverError;
    use crate::utils::isclose;

    use super::ProblemConfig;

    static DIRECTORY_ID: AtomicU64 = AtomicU64::new(0);

    fn write_problem_files() -> PathBuf {
        let directory = std::env::temp_dir().join(format!(
            "flexible-drone-delivery-test-{}-{}",
            std::process::id(),
            DIRECTORY_ID.fetch_add(1, Ordering::Relaxed),
        ));
        fs::create_dir_all(&directory).unwrap();

        fs::write(
            directory.join("params.csv"),
            "problem,trucks,drones,working_time,truck_capacity,drone_capacity,drone_speed,truck_speed,drone_time\n\
             6.5.1,1,1,28800,900,20,0.5833,0.5,1800\n\
             other,2,3,1000,500,10,1.0,2.0,300\n",
        )
        .unwrap();
        fs::write(
            directory.join("coefficients.json"),
            "{\"truck_cost_over_time\": 10.0, \"drone_cost_over_time\": 1.0}",
        )
        .unwrap();
        fs::write(
            directory.join("6.5.1.csv"),
            "id,x,y,low,high,w\n1,100,200,10,90,25\n2,-50,75,0,40,30\n",
        )
        .unwrap();

        directory
    }

    #[test]
    fn test_load() {
        let directory = write_problem_files();
        let config = ProblemConfig::load("6.5.1", directory.to_str().unwrap()).unwrap();

        assert_eq!(config.trucks_count, 1);
        assert_eq!(config.drones_count, 1);
        assert!(isclose(config.working_time_limit, 28800.0));
        assert_eq!(config.truck.capacity, 900);
        assert_eq!(config.drone.capacity, 20);
        assert!(isclose(config.truck.cost_per_distance, 10.0 / 0.5));
        assert!(isclose(config.drone.cost_per_distance, 1.0 / 0.5833));
        assert!(config.truck.trip_time_limit.is_infinite());
        assert!(isclose(config.drone.trip_time_limit, 1800.0));

        // Depot prepended with a zeroed profile.
        assert_eq!(config.customers.len(), 3);
        assert_eq!(config.customers[0].low, 0);
        assert_eq!(config.customers[1].low, 10);
        assert_eq!(config.customers_by_profit, vec![2, 1]);

        // Symmetric, ceil-rounded distances.
        assert_eq!(config.distances[1][2], config.distances[2][1]);
        let raw = (150.0f64 * 150.0 + 125.0 * 125.0).sqrt();
        assert!(config.distances[1][2] >= raw);
        assert!(config.distances[1][2] - raw < 0.01);

        fs::remove_dir_all(&directory).unwrap();
    }

    #[test]
    fn test_unknown_problem() {
        let directory = write_problem_files();
        let error = ProblemConfig::load("missing", directory.to_str().unwrap()).unwrap_err();
        assert!(matches!(error, SolverError::UnknownProblem { .. }));
        fs::remove_dir_all(&directory).unwrap();
    }

    #[test]
    fn test_malformed_integer() {
        let directory = write_problem_files();
        fs::write(
            directory.join("params.csv"),
            "problem,trucks,drones,working_time,truck_capacity,drone_capacity,drone_speed,truck_speed,drone_time\n\
             6.5.1,1.5,1,28800,900,20,0.5833,0.5,1800\n",
        )
        .unwrap();

        let error = ProblemConfig::load("6.5.1", directory.to_str().unwrap()).unwrap_err();
        assert!(matches!(error, SolverError::Config { .. }));
        fs::remove_dir_all(&directory).unwrap();
    }
}
