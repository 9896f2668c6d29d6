use std::error::Error;
use std::fmt;

/// Fatal errors raised before or while entering the optimization loop.
///
/// Everything that happens once the loop is running is absorbed into the
/// violation model instead of being raised.
#[derive(Debug)]
pub enum SolverError {
    /// A problem file is missing, malformed, or holds a non-integer value
    /// where an integer is required.
    Config {
        path: String,
        source: Box<dyn Error>,
    },

    /// The requested problem name does not appear in `params.csv`.
    UnknownProblem { name: String },

    /// Seeding could not fill the population up to the requested size.
    Initialization { message: String },
}

impl fmt::Display for SolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { path, source } => {
                write!(f, "failed to read problem data from {path}: {source}")
            }
            Self::UnknownProblem { name } => write!(f, "unknown problem {name:?}"),
            Self::Initialization { message } => {
                write!(f, "population initialization failed: {message}")
            }
        }
    }
}

impl Error for SolverError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config { source, .. } => Some(source.as_ref()),
            Self::UnknownProblem { .. } | Self::Initialization { .. } => None,
        }
    }
}

/// Raised only by [`crate::solutions::Solution::assert_feasible`], which tests
/// and post-run verification use to get a readable list of violated
/// constraints. The optimization loop itself never raises this.
#[derive(Debug)]
pub struct InfeasibleSolution {
    pub violations: Vec<String>,
}

impl fmt::Display for InfeasibleSolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "infeasible solution: {}", self.violations.join("; "))
    }
}

impl Error for InfeasibleSolution {}
