use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

use clap::Parser;
use colored::Colorize;
use rand::Rng;
use rand::distr::Alphanumeric;

#[derive(Debug, Parser)]
#[command(
    long_about = "Hyperparameter sweep for the flexible-drone-delivery solver",
    version
)]
struct Arguments {
    /// The problem name (e.g. "6.5.1", "100.20.1")
    problem: String,

    /// The number of generations per solver run
    #[arg(short, long, default_value_t = 200)]
    generations: usize,

    /// The number of solver processes to run concurrently
    #[arg(short, long, default_value_t = 3)]
    jobs: usize,

    /// Directory containing params.csv, coefficients.json and the customer
    /// tables
    #[arg(long, default_value_t = String::from("problems"))]
    problems_dir: String,
}

const MUTATION_RATES: [f64; 4] = [0.2, 0.4, 0.6, 0.8];
const RESET_AFTER: [usize; 3] = [10, 15, 25];
const STUCK_PENALTY_INCREASE_RATES: [f64; 4] = [1.0, 10.0, 50.0, 100.0];

type Parameter = (f64, usize, f64);

/// One solver subprocess; failures are swallowed and reported as `None` so
/// the sweep keeps going.
fn run_single_test(arguments: &Arguments, parameter: Parameter) -> Option<f64> {
    let solver = std::env::current_exe().ok()?.with_file_name(
        if cfg!(windows) {
            "flexible-drone-delivery.exe"
        } else {
            "flexible-drone-delivery"
        },
    );

    let id = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>();
    let dump = std::env::temp_dir().join(format!("hyperparams-{id}.json"));

    let status = Command::new(solver)
        .arg(&arguments.problem)
        .args(["--generations", &arguments.generations.to_string()])
        .args(["--mutation-rate", &parameter.0.to_string()])
        .args(["--reset-after", &parameter.1.to_string()])
        .args(["--stuck-penalty-increase-rate", &parameter.2.to_string()])
        .args(["--problems-dir", &arguments.problems_dir])
        .args(["--dump", dump.to_str()?])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .ok()?;
    if !status.success() {
        eprintln!(
            "{}",
            format!("Return code {status} for {parameter:?}").yellow(),
        );
    }

    let data = std::fs::read_to_string(&dump).ok()?;
    let _ = std::fs::remove_file(&dump);
    let parsed = serde_json::from_str::<serde_json::Value>(&data).ok()?;
    parsed["solution"]["profit"].as_f64()
}

fn main() {
    let arguments = Arc::new(Arguments::parse());
    println!("Received {arguments:?}");

    let mut grid = vec![];
    for mutation_rate in MUTATION_RATES {
        for reset_after in RESET_AFTER {
            for rate in STUCK_PENALTY_INCREASE_RATES {
                grid.push((mutation_rate, reset_after, rate));
            }
        }
    }

    println!("Running {} configurations", grid.len());
    let queue = Arc::new(Mutex::new(grid));
    let results: Arc<Mutex<Vec<(Parameter, Option<f64>)>>> = Arc::new(Mutex::new(vec![]));

    let mut workers = vec![];
    for _ in 0..arguments.jobs.max(1) {
        let arguments = arguments.clone();
        let queue = queue.clone();
        let results = results.clone();
        workers.push(thread::spawn(move || {
            loop {
                let parameter = match queue.lock().unwrap().pop() {
                    Some(parameter) => parameter,
                    None => break,
                };

                let profit = run_single_test(&arguments, parameter);
                match profit {
                    Some(profit) => println!("{parameter:?} -> {profit:.2}"),
                    None => println!("{}", format!("{parameter:?} -> failed").yellow()),
                }

                results.lock().unwrap().push((parameter, profit));
            }
        }));
    }

    for worker in workers {
        let _ = worker.join();
    }

    let results = results.lock().unwrap();
    let mut best: Option<(Vec<Parameter>, f64)> = None;
    for &(parameter, profit) in results.iter() {
        let Some(profit) = profit else { continue };
        match &mut best {
            None => best = Some((vec![parameter], profit)),
            Some((parameters, incumbent)) => {
                if profit > *incumbent {
                    *parameters = vec![parameter];
                    *incumbent = profit;
                } else if profit == *incumbent {
                    parameters.push(parameter);
                }
            }
        }
    }

    match best {
        Some((parameters, profit)) => {
            println!(
                "{} {profit:.2} with (mutation rate, reset after, stuck penalty rate) in {parameters:?}",
                "Best profit".green().bold(),
            );
        }
        None => println!("{}", "Every configuration failed".red()),
    }
}
