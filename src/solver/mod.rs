use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use rand::Rng;
use thiserror::Error;

pub mod value_iteration;

pub use value_iteration::{SolverConfig, ValueIteration};

// How far the probabilities of a single (state, action) pair may drift from 1.
pub const PROBABILITY_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Outcomes<S> {
    // Possible successors of the action, `None` meaning the episode ends.
    // A terminal successor continues with the value of the state the action was taken from.
    pub successors: Vec<Option<S>>,
    // One entry per successor. Must sum to 1.
    pub probabilities: Vec<f64>,
    // Reward shared by every successor.
    pub reward: f64,
}

impl<S> Outcomes<S> {
    pub fn terminal(reward: f64) -> Outcomes<S> {
        Outcomes {
            successors: vec![None],
            probabilities: vec![1.0],
            reward: reward,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.successors.iter().all(Option::is_none)
    }
}

// Fully known model of a finite decision process. The order of `states()` and
// `actions()` is fixed; solvers index their tables by it.
pub trait Environment {
    type State: Clone + Eq + Hash + Debug;
    type Action: Clone + Eq + Hash + Debug;
    type Error: std::error::Error + 'static;

    fn states(&self) -> &[Self::State];

    fn actions(&self) -> &[Self::Action];

    // Must be pure.
    fn next_outcomes(
        &self,
        action: &Self::Action,
        state: &Self::State,
    ) -> Result<Outcomes<Self::State>, Self::Error>;
}

#[derive(Debug, Error)]
pub enum SolverError<E: std::error::Error + 'static> {
    #[error("invalid solver configuration: {0}")]
    InvalidConfig(String),
    #[error("malformed model: {0}")]
    MalformedModel(String),
    #[error("value iteration did not converge after {sweeps} sweeps (last delta {delta})")]
    NonConvergent { sweeps: usize, delta: f64 },
    #[error("unknown state {0}")]
    UnknownState(String),
    // Faults of the environment itself are passed through as they are.
    #[error(transparent)]
    Environment(E),
}

#[derive(Debug, Default, Clone)]
pub struct PolicyState<A> {
    // Possible actions and their probabilities, in the environment's action order.
    // All probabilities must sum to 1.
    pub actions: Vec<(A, f64)>,
}

#[derive(Debug, Default, Clone)]
pub struct Policy<S: Eq + Hash, A> {
    pub states: HashMap<S, PolicyState<A>>,
}

impl<S: Eq + Hash, A> Policy<S, A> {
    // None if the policy doesn't cover `state`.
    pub fn sample<R: Rng + ?Sized>(&self, state: &S, rng: &mut R) -> Option<&A> {
        self.states
            .get(state)
            .and_then(|policy_state| choose_weighted(&policy_state.actions, rng))
    }
}

// Picks an item with probability proportional to its weight.
// Items are walked in slice order so the same generator state always yields the same pick.
pub(crate) fn choose_weighted<'w, T, R>(weighted: &'w [(T, f64)], rng: &mut R) -> Option<&'w T>
where
    R: Rng + ?Sized,
{
    let total_probability: f64 = weighted.iter().map(|(_, p)| p).sum();

    let mut remaining_probability = rng.gen::<f64>() * total_probability;
    for (item, probability) in weighted {
        if remaining_probability < *probability {
            return Some(item);
        }

        remaining_probability -= probability;
    }

    // Rounding can leave a sliver past the last weight.
    weighted.last().map(|(item, _)| item)
}
