mod agent;
mod dice_game;
mod solver;

use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use rand::prelude::*;
use tracing::{info, Level};

use agent::*;
use dice_game::*;
use solver::{Environment, SolverConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum AgentKind {
    AlwaysHold,
    Perfectionist,
    Optimal,
}

/// Solve the dice game with value iteration and play it
#[derive(Parser, Debug)]
#[command(name = "dice_mdp")]
#[command(about = "Solve the dice game with value iteration and play it", long_about = None)]
struct Args {
    /// Agent to test
    #[arg(long, value_enum, default_value_t = AgentKind::Optimal)]
    agent: AgentKind,

    /// Number of games to play
    #[arg(long, default_value_t = 10000)]
    games: usize,

    /// Random seed (entropy if not given)
    #[arg(long)]
    seed: Option<u64>,

    /// Number of dice
    #[arg(long, default_value_t = 3)]
    dice: usize,

    /// Number of sides per die
    #[arg(long, default_value_t = 6)]
    sides: usize,

    /// Comma separated face values (defaults to 1..=sides)
    #[arg(long, value_delimiter = ',')]
    values: Option<Vec<i32>>,

    /// Comma separated face probabilities (defaults to fair dice)
    #[arg(long, value_delimiter = ',')]
    bias: Option<Vec<f64>>,

    /// Points lost on every roll
    #[arg(long, default_value_t = 1)]
    penalty: i32,

    /// Play the extended rules: two three-sided dice
    #[arg(long, conflicts_with_all = ["dice", "sides", "values", "bias", "penalty"])]
    extended: bool,

    /// Discount factor
    #[arg(long, default_value_t = 0.935)]
    gamma: f64,

    /// Convergence threshold of value iteration
    #[arg(long, default_value_t = 0.1)]
    theta: f64,

    /// Give up on value iteration after this many sweeps
    #[arg(long, default_value_t = 10_000)]
    max_sweeps: usize,

    /// Precompute the whole policy instead of deciding per state
    #[arg(long)]
    eager_policy: bool,

    /// Print the value and best holds of every state
    #[arg(long)]
    print_policy: bool,

    /// Plot the converged state values
    #[arg(long)]
    plot_values: bool,

    /// More logging (-v for every game, action and sweep)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn game_config(&self) -> GameConfig {
        if self.extended {
            return GameConfig::extended();
        }
        GameConfig {
            dice: self.dice,
            sides: self.sides,
            values: self.values.clone(),
            bias: self.bias.clone(),
            penalty: self.penalty,
        }
    }

    fn solver_config(&self) -> SolverConfig {
        SolverConfig {
            discount: self.gamma,
            theta: self.theta,
            max_sweeps: self.max_sweeps,
        }
    }

    fn log_level(&self) -> Level {
        if self.quiet {
            return Level::WARN;
        }
        match self.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}

fn build_agent<'g>(
    args: &Args,
    game: &'g DiceGame,
    rng: &mut StdRng,
) -> anyhow::Result<(Box<dyn Agent + 'g>, Duration)> {
    let start = Instant::now();
    let agent: Box<dyn Agent + 'g> = match args.agent {
        AgentKind::AlwaysHold => Box::new(AlwaysHoldAgent::new(game)),
        AgentKind::Perfectionist => Box::new(PerfectionistAgent::new(game)),
        AgentKind::Optimal => {
            let agent_rng = StdRng::seed_from_u64(rng.gen());
            let mut agent = OptimalAgent::new(game, args.solver_config(), agent_rng)?;
            if args.eager_policy {
                agent = agent.with_eager_policy()?;
            }
            let construction_time = start.elapsed();
            let solver = agent.solver();
            info!(
                sweeps = solver.sweeps(),
                last_delta = ?solver.deltas().last(),
                theta = solver.config().theta,
                residual = solver.bellman_residual(),
                "solved"
            );

            if args.print_policy {
                print_policy(agent.solver())?;
            }
            if args.plot_values {
                print_state_values(agent.solver());
            }
            let agent: Box<dyn Agent + 'g> = Box::new(agent);
            return Ok((agent, construction_time));
        }
    };
    Ok((agent, start.elapsed()))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .init();

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let game = DiceGame::new(args.game_config())?;
    info!(
        dice = game.dice(),
        values = ?game.values(),
        bias = ?game.bias(),
        penalty = game.penalty(),
        states = game.states().len(),
        "testing rules"
    );

    let (mut agent, construction_time) = build_agent(&args, &game, &mut rng)?;
    let summary = run_games(agent.as_mut(), &game, args.games, construction_time, &mut rng)?;
    print_summary(&summary);

    Ok(())
}
