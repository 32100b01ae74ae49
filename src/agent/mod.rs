use std::time::{Duration, Instant};

use prettytable::{Cell, Row, Table};
use rand::prelude::*;
use thiserror::Error;
use tracing::{debug, info};

use crate::dice_game::{DiceGame, DiceGameError, DiceState, Episode, Hold};
use crate::solver::{Policy, SolverConfig, SolverError, ValueIteration};

#[derive(Debug, Error)]
pub enum PlayError {
    #[error(transparent)]
    Game(#[from] DiceGameError),
    #[error(transparent)]
    Solver(#[from] SolverError<DiceGameError>),
}

// Something that decides which dice to keep.
pub trait Agent {
    fn name(&self) -> &str;

    fn play(&mut self, state: &DiceState) -> Result<Hold, PlayError>;
}

// Stops with whatever the first roll gave.
pub struct AlwaysHoldAgent {
    hold: Hold,
}

impl AlwaysHoldAgent {
    pub fn new(game: &DiceGame) -> AlwaysHoldAgent {
        AlwaysHoldAgent {
            hold: game.hold_all(),
        }
    }
}

impl Agent for AlwaysHoldAgent {
    fn name(&self) -> &str {
        "AlwaysHoldAgent"
    }

    fn play(&mut self, _state: &DiceState) -> Result<Hold, PlayError> {
        Ok(self.hold.clone())
    }
}

// Rerolls everything until it gets one of the two best hands of the basic game.
pub struct PerfectionistAgent {
    stop: Hold,
    reroll: Hold,
}

impl PerfectionistAgent {
    pub fn new(game: &DiceGame) -> PerfectionistAgent {
        PerfectionistAgent {
            stop: game.hold_all(),
            reroll: game.reroll_all(),
        }
    }
}

impl Agent for PerfectionistAgent {
    fn name(&self) -> &str {
        "PerfectionistAgent"
    }

    fn play(&mut self, state: &DiceState) -> Result<Hold, PlayError> {
        if state.0 == [1, 1, 1] || state.0 == [1, 1, 6] {
            Ok(self.stop.clone())
        } else {
            Ok(self.reroll.clone())
        }
    }
}

// Plays the value iteration policy of the game.
pub struct OptimalAgent<'g> {
    solver: ValueIteration<'g, DiceGame>,
    // Precomputed greedy policy; actions are recomputed per query when absent.
    policy: Option<Policy<DiceState, Hold>>,
    rng: StdRng,
}

impl<'g> OptimalAgent<'g> {
    // Solves `game` up front. `rng` breaks ties between equally good actions.
    pub fn new(game: &'g DiceGame, config: SolverConfig, rng: StdRng) -> Result<OptimalAgent<'g>, PlayError> {
        Ok(OptimalAgent {
            solver: ValueIteration::new(game, config)?,
            policy: None,
            rng: rng,
        })
    }

    pub fn with_eager_policy(mut self) -> Result<OptimalAgent<'g>, PlayError> {
        self.policy = Some(self.solver.policy()?);
        Ok(self)
    }

    pub fn solver(&self) -> &ValueIteration<'g, DiceGame> {
        &self.solver
    }
}

impl<'g> Agent for OptimalAgent<'g> {
    fn name(&self) -> &str {
        "OptimalAgent"
    }

    fn play(&mut self, state: &DiceState) -> Result<Hold, PlayError> {
        match &self.policy {
            Some(policy) => policy
                .sample(state, &mut self.rng)
                .cloned()
                .ok_or_else(|| {
                    PlayError::Solver(SolverError::UnknownState(format!("{:?}", state)))
                }),
            None => Ok(self.solver.select_action(state, &mut self.rng)?.clone()),
        }
    }
}

// Plays one game to the end and returns its score.
pub fn play_game_with_agent<A, R>(agent: &mut A, game: &DiceGame, rng: &mut R) -> Result<i32, PlayError>
where
    A: Agent + ?Sized,
    R: Rng + ?Sized,
{
    let mut episode = Episode::start(game, rng);
    let mut state = episode.state();
    debug!(agent = agent.name(), dice = %state, "starting dice");

    let mut actions = 0;
    while !episode.is_over() {
        let action = agent.play(&state)?;
        actions += 1;
        debug!(action = actions, hold = %action, "playing");

        let result = episode.roll(&action, rng)?;
        state = result.state;
        if !result.over {
            debug!(dice = %state, "rolled");
        }
    }

    debug!(dice = %state, score = episode.score(), actions, "final dice");
    Ok(episode.score())
}

#[derive(Clone, Debug)]
pub struct GamesSummary {
    pub agent: String,
    pub games: usize,
    pub total_score: i64,
    // None until a game has been played.
    pub min_score: Option<i32>,
    pub max_score: Option<i32>,
    pub construction_time: Duration,
    pub play_time: Duration,
}

impl GamesSummary {
    pub fn average_score(&self) -> f64 {
        if self.games == 0 {
            return 0.0;
        }
        self.total_score as f64 / self.games as f64
    }

    pub fn average_time(&self) -> Duration {
        if self.games == 0 {
            return Duration::ZERO;
        }
        self.play_time / self.games as u32
    }
}

// Plays `games` games in a row. `construction_time` is how long building the agent took.
pub fn run_games<A, R>(
    agent: &mut A,
    game: &DiceGame,
    games: usize,
    construction_time: Duration,
    rng: &mut R,
) -> Result<GamesSummary, PlayError>
where
    A: Agent + ?Sized,
    R: Rng + ?Sized,
{
    let mut summary = GamesSummary {
        agent: agent.name().to_string(),
        games: games,
        total_score: 0,
        min_score: None,
        max_score: None,
        construction_time: construction_time,
        play_time: Duration::ZERO,
    };

    info!(agent = agent.name(), games, "testing agent");
    for i in 0..games {
        let start = Instant::now();
        let score = play_game_with_agent(agent, game, rng)?;
        summary.play_time += start.elapsed();

        debug!(game = i, score, "game finished");
        summary.total_score += score as i64;
        summary.min_score = Some(summary.min_score.map_or(score, |min| min.min(score)));
        summary.max_score = Some(summary.max_score.map_or(score, |max| max.max(score)));
    }

    info!(
        agent = agent.name(),
        average_score = summary.average_score(),
        "games finished"
    );
    Ok(summary)
}

fn score_or_dash(score: Option<i32>) -> String {
    match score {
        Some(score) => score.to_string(),
        None => "-".to_string(),
    }
}

fn summary_rows(summary: &GamesSummary) -> Vec<(&'static str, String)> {
    vec![
        ("Agent", summary.agent.clone()),
        ("Games", format!("{}", summary.games)),
        ("Average score", format!("{:.4}", summary.average_score())),
        (
            "Min / max score",
            format!(
                "{} / {}",
                score_or_dash(summary.min_score),
                score_or_dash(summary.max_score)
            ),
        ),
        (
            "Construction time",
            format!("{:.4} seconds", summary.construction_time.as_secs_f64()),
        ),
        (
            "Average time",
            format!("{:.5} seconds", summary.average_time().as_secs_f64()),
        ),
    ]
}

pub fn print_summary(summary: &GamesSummary) {
    let mut table = Table::new();
    for (name, value) in summary_rows(summary) {
        table.add_row(Row::new(vec![Cell::new(name), Cell::new(&value)]));
    }
    table.printstd();
}
