use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    long_about = "Genetic algorithm for the vehicle routing problem with drones and flexible delivery",
    version
)]
pub struct Arguments {
    /// The problem name (e.g. "6.5.1", "100.20.1")
    pub problem: String,

    /// The number of generations to run
    #[arg(short, long, default_value_t = 200)]
    pub generations: usize,

    /// The population size
    #[arg(short = 's', long, default_value_t = 100)]
    pub population_size: usize,

    /// The mutation rate
    #[arg(short, long, default_value_t = 0.6)]
    pub mutation_rate: f64,

    /// The number of non-improved generations between reset events
    #[arg(long, default_value_t = 15)]
    pub reset_after: usize,

    /// Multiplier applied to every stuck penalty on reset
    #[arg(long, default_value_t = 10.0)]
    pub stuck_penalty_increase_rate: f64,

    /// The number of individuals to local-search during a reset
    #[arg(long, default_value_t = 10)]
    pub local_search_batch: usize,

    /// The maximum number of entries in each LRU cache (0 = unbounded)
    #[arg(long, default_value_t = 50_000)]
    pub cache_limit: usize,

    /// Order trips in subset order instead of solving their TSP
    #[arg(long)]
    pub fake_tsp_solver: bool,

    /// The verbose mode (progress bar)
    #[arg(short, long)]
    pub verbose: bool,

    /// Files to dump results to; *.json is supported, anything else is
    /// skipped with a warning
    #[arg(short, long)]
    pub dump: Vec<String>,

    /// Extra data to store in the output JSON
    #[arg(long, default_value_t = String::new())]
    pub extra: String,

    /// Path to the per-generation CSV log
    #[arg(long)]
    pub log: Option<String>,

    /// Directory containing params.csv, coefficients.json and the customer
    /// tables
    #[arg(long, default_value_t = String::from("problems"))]
    pub problems_dir: String,

    /// Random seed; derived from the wall clock when omitted
    #[arg(long)]
    pub seed: Option<u64>,
}
