use std::collections::{HashMap, HashSet};
use std::fmt;

use factorial::Factorial;
use itertools::Itertools;
use plotlib::{
    page::Page,
    repr::Plot,
    style::{PointMarker, PointStyle},
    view::ContinuousView,
};
use prettytable::{Cell, Row, Table};
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use thiserror::Error;
use tracing::warn;

use crate::solver::{Environment, Outcomes, SolverError, ValueIteration, PROBABILITY_TOLERANCE};

#[derive(Clone, Debug, PartialEq)]
pub struct GameConfig {
    pub dice: usize,
    pub sides: usize,
    // Face values, 1..=sides if not given.
    pub values: Option<Vec<i32>>,
    // Face probabilities, uniform if not given.
    pub bias: Option<Vec<f64>>,
    // Points lost on every roll.
    pub penalty: i32,
}

impl Default for GameConfig {
    fn default() -> GameConfig {
        GameConfig {
            dice: 3,
            sides: 6,
            values: None,
            bias: None,
            penalty: 1,
        }
    }
}

impl GameConfig {
    // Two three-sided dice.
    pub fn extended() -> GameConfig {
        GameConfig {
            dice: 2,
            sides: 3,
            ..GameConfig::default()
        }
    }
}

// Face values of the dice, sorted ascending.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiceState(pub Vec<i32>);

// Positions of the dice to keep; every other die is rolled again.
// Keeping all of them ends the game.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hold(pub Vec<usize>);

fn write_tuple<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    write!(f, "({})", items.iter().join(", "))
}

impl fmt::Display for DiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_tuple(f, &self.0)
    }
}

impl fmt::Display for Hold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_tuple(f, &self.0)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum DiceGameError {
    #[error("invalid game configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid action {0}")]
    InvalidAction(Hold),
    #[error("unknown dice state {0}")]
    UnknownState(DiceState),
    #[error("the game is already over")]
    GameOver,
}

// Rules of the dice game: how many dice, their faces and biases, and the cost of a roll.
// The game itself is immutable; a single play-through is an `Episode`.
#[derive(Clone, Debug)]
pub struct DiceGame {
    dice: usize,
    values: Vec<i32>,
    bias: Vec<f64>,
    penalty: i32,
    // Value shown after turning a die upside down.
    flip: HashMap<i32, i32>,
    actions: Vec<Hold>,
    states: Vec<DiceState>,
    final_scores: HashMap<DiceState, i32>,
    faces: WeightedIndex<f64>,
}

impl DiceGame {
    pub fn new(config: GameConfig) -> Result<DiceGame, DiceGameError> {
        let invalid = |reason: String| DiceGameError::InvalidConfig(reason);

        if config.dice == 0 || config.sides == 0 {
            return Err(invalid(format!(
                "need at least one die and one side, got {} dice with {} sides",
                config.dice, config.sides
            )));
        }

        let values = config
            .values
            .unwrap_or_else(|| (1..=config.sides as i32).collect());
        if values.len() != config.sides {
            return Err(invalid(format!(
                "{} values for {} sides",
                values.len(),
                config.sides
            )));
        }
        if values.iter().collect::<HashSet<_>>().len() != values.len() {
            return Err(invalid(format!("values {:?} are not distinct", values)));
        }

        let bias = config
            .bias
            .unwrap_or_else(|| vec![1.0 / config.sides as f64; config.sides]);
        if bias.len() != values.len() {
            return Err(invalid(format!(
                "{} biases for {} values",
                bias.len(),
                values.len()
            )));
        }
        if bias.iter().any(|b| !b.is_finite() || *b < 0.0) {
            return Err(invalid(format!("invalid biases {:?}", bias)));
        }
        let total_bias: f64 = bias.iter().sum();
        if (total_bias - 1.0).abs() > PROBABILITY_TOLERANCE {
            return Err(invalid(format!("biases sum to {}", total_bias)));
        }
        let faces = WeightedIndex::new(&bias).map_err(|e| invalid(e.to_string()))?;

        let flip = values
            .iter()
            .copied()
            .zip(values.iter().rev().copied())
            .collect();

        let mut actions = vec![Hold(Vec::new())];
        for held in 1..=config.dice {
            actions.extend((0..config.dice).combinations(held).map(Hold));
        }

        let sorted_values: Vec<i32> = values.iter().copied().sorted().collect();
        let states: Vec<DiceState> = sorted_values
            .into_iter()
            .combinations_with_replacement(config.dice)
            .map(DiceState)
            .collect();

        let mut game = DiceGame {
            dice: config.dice,
            values: values,
            bias: bias,
            penalty: config.penalty,
            flip: flip,
            actions: actions,
            states: Vec::new(),
            final_scores: HashMap::new(),
            faces: faces,
        };
        game.final_scores = states
            .iter()
            .map(|state| (state.clone(), game.compute_final_score(state)))
            .collect();
        game.states = states;

        Ok(game)
    }

    pub fn dice(&self) -> usize {
        self.dice
    }

    pub fn values(&self) -> &[i32] {
        &self.values
    }

    pub fn bias(&self) -> &[f64] {
        &self.bias
    }

    pub fn penalty(&self) -> i32 {
        self.penalty
    }

    // Keeps every die, i.e. stops.
    pub fn hold_all(&self) -> Hold {
        Hold((0..self.dice).collect())
    }

    pub fn reroll_all(&self) -> Hold {
        Hold(Vec::new())
    }

    pub fn final_score(&self, state: &DiceState) -> Result<i32, DiceGameError> {
        self.final_scores
            .get(state)
            .copied()
            .ok_or_else(|| DiceGameError::UnknownState(state.clone()))
    }

    // Dice showing the same value are turned upside down; every die then counts its face.
    fn compute_final_score(&self, state: &DiceState) -> i32 {
        let counts = state.0.iter().counts();
        counts
            .into_iter()
            .map(|(value, count)| {
                if count > 1 {
                    self.flip[value] * count as i32
                } else {
                    *value
                }
            })
            .sum()
    }

    fn check_action(&self, hold: &Hold) -> Result<(), DiceGameError> {
        if self.actions.contains(hold) {
            Ok(())
        } else {
            Err(DiceGameError::InvalidAction(hold.clone()))
        }
    }

    // Probability of a sorted combination of face indices coming up on `combination.len()` dice.
    fn combination_probability(&self, combination: &[usize]) -> f64 {
        let counts = combination.iter().counts();
        let arrangements = (combination.len() as u128).factorial()
            / counts
                .values()
                .map(|count| (*count as u128).factorial())
                .product::<u128>();

        counts
            .iter()
            .map(|(face, count)| self.bias[**face].powi(*count as i32))
            .product::<f64>()
            * arrangements as f64
    }
}

impl Environment for DiceGame {
    type State = DiceState;
    type Action = Hold;
    type Error = DiceGameError;

    fn states(&self) -> &[DiceState] {
        &self.states
    }

    fn actions(&self) -> &[Hold] {
        &self.actions
    }

    fn next_outcomes(&self, hold: &Hold, state: &DiceState) -> Result<Outcomes<DiceState>, DiceGameError> {
        self.check_action(hold)?;
        let final_score = self.final_score(state)?;

        if hold.0.len() == self.dice {
            return Ok(Outcomes::terminal(final_score as f64));
        }

        let held: Vec<i32> = hold.0.iter().map(|&position| state.0[position]).collect();
        let rolled = self.dice - held.len();

        let mut successors = Vec::new();
        let mut probabilities = Vec::new();
        for combination in (0..self.values.len()).combinations_with_replacement(rolled) {
            let mut dice = held.clone();
            dice.extend(combination.iter().map(|&face| self.values[face]));
            dice.sort();

            successors.push(Some(DiceState(dice)));
            probabilities.push(self.combination_probability(&combination));
        }

        Ok(Outcomes {
            successors: successors,
            probabilities: probabilities,
            reward: -self.penalty as f64,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RollResult {
    // Points the dice would score if the game stopped now.
    pub points: i32,
    pub state: DiceState,
    pub over: bool,
}

// One play-through of a `DiceGame`.
#[derive(Clone, Debug)]
pub struct Episode<'g> {
    game: &'g DiceGame,
    dice: Vec<i32>,
    score: i32,
    over: bool,
}

impl<'g> Episode<'g> {
    // Starts a game with a first roll of all dice.
    pub fn start<R: Rng + ?Sized>(game: &'g DiceGame, rng: &mut R) -> Episode<'g> {
        let mut episode = Episode {
            game: game,
            dice: vec![0; game.dice],
            score: 0,
            over: false,
        };
        episode.reset(rng);
        episode
    }

    // Restarts the game; the first roll is free.
    pub fn reset<R: Rng + ?Sized>(&mut self, rng: &mut R) -> DiceState {
        self.over = false;
        self.score = self.game.penalty;
        self.roll_dice(&[], rng);
        self.state()
    }

    pub fn roll<R: Rng + ?Sized>(&mut self, hold: &Hold, rng: &mut R) -> Result<RollResult, DiceGameError> {
        self.game.check_action(hold)?;
        if self.over {
            return Err(DiceGameError::GameOver);
        }

        if hold.0.len() == self.game.dice {
            let points = self.game.final_score(&self.state())?;
            self.over = true;
            self.score += points;
            return Ok(RollResult {
                points: points,
                state: self.state(),
                over: true,
            });
        }

        self.roll_dice(&hold.0, rng);
        Ok(RollResult {
            points: self.game.final_score(&self.state())?,
            state: self.state(),
            over: false,
        })
    }

    fn roll_dice<R: Rng + ?Sized>(&mut self, held: &[usize], rng: &mut R) {
        for (position, die) in self.dice.iter_mut().enumerate() {
            if !held.contains(&position) {
                *die = self.game.values[self.game.faces.sample(rng)];
            }
        }
        self.dice.sort();
        self.score -= self.game.penalty;
    }

    pub fn state(&self) -> DiceState {
        DiceState(self.dice.clone())
    }

    // Roll penalties plus the final score once stopped.
    pub fn score(&self) -> i32 {
        self.score
    }

    pub fn is_over(&self) -> bool {
        self.over
    }
}

pub fn print_policy(solver: &ValueIteration<DiceGame>) -> Result<(), SolverError<DiceGameError>> {
    let game = solver.env();
    let mut table = Table::new();
    table.add_row(Row::new(vec![
        Cell::new("Dice"),
        Cell::new("Score"),
        Cell::new("Value"),
        Cell::new("Stop"),
        Cell::new("Best roll"),
        Cell::new("Hold"),
    ]));

    for state in game.states() {
        let holds = solver
            .greedy_actions(state)?
            .iter()
            .map(|hold| hold.to_string())
            .join(" ");

        let mut stop = f64::NEG_INFINITY;
        let mut roll = f64::NEG_INFINITY;
        for (hold, q) in solver.q_values(state)? {
            let outcomes = game.next_outcomes(hold, state).map_err(SolverError::Environment)?;
            if outcomes.is_terminal() {
                stop = stop.max(q);
            } else {
                roll = roll.max(q);
            }
        }

        table.add_row(Row::new(vec![
            Cell::new(&state.to_string()),
            Cell::new(&format!("{}", game.final_score(state).map_err(SolverError::Environment)?)),
            Cell::new(&format!("{:.2}", solver.value(state)?)),
            Cell::new(&format!("{:.2}", stop)),
            Cell::new(&format!("{:.2}", roll)),
            Cell::new(&holds),
        ]));
    }
    table.printstd();
    Ok(())
}

pub fn print_state_values(solver: &ValueIteration<DiceGame>) {
    let values: Vec<(f64, f64)> = solver
        .values()
        .iter()
        .enumerate()
        .map(|(state, value)| (state as f64, *value))
        .collect();

    let s1 = Plot::new(values).point_style(PointStyle::new().marker(PointMarker::Circle));
    let v = ContinuousView::new()
        .add(s1)
        .x_range(0.0, solver.values().len() as f64)
        .x_label("State")
        .y_label("Value");
    match Page::single(&v).dimensions(100, 50).to_text() {
        Ok(text) => println!("{}", text),
        Err(e) => warn!(error = %e, "can't plot state values"),
    }
}
