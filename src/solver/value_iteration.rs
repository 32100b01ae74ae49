use std::collections::HashMap;

use rand::Rng;
use tracing::{debug, info};

use crate::solver::*;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolverConfig {
    // γ, weight of the continuation value. Must be in (0, 1).
    pub discount: f64,
    // Largest per-sweep change in state values at which iteration stops.
    pub theta: f64,
    // Sweeps allowed before giving up.
    pub max_sweeps: usize,
}

impl Default for SolverConfig {
    fn default() -> SolverConfig {
        SolverConfig {
            discount: 0.935,
            theta: 0.1,
            max_sweeps: 10_000,
        }
    }
}

impl SolverConfig {
    fn validate<E: std::error::Error + 'static>(&self) -> Result<(), SolverError<E>> {
        if !(self.discount > 0.0 && self.discount < 1.0) {
            return Err(SolverError::InvalidConfig(format!(
                "discount must be in (0, 1), got {}",
                self.discount
            )));
        }
        if !(self.theta > 0.0 && self.theta.is_finite()) {
            return Err(SolverError::InvalidConfig(format!(
                "theta must be positive, got {}",
                self.theta
            )));
        }
        if self.max_sweeps == 0 {
            return Err(SolverError::InvalidConfig(
                "max_sweeps must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// Outcomes of one (state, action) pair with successors resolved to state indices.
#[derive(Debug, Clone)]
struct Transition {
    // `None` stands for the terminal outcome.
    dests: Vec<(Option<usize>, f64)>,
    reward: f64,
}

// Returns the action value given the transition and state value function.
// Terminal outcomes bootstrap from the value of `state` itself.
fn get_action_value(
    transition: &Transition,
    state: usize,
    state_values: &[f64],
    discount: f64,
) -> f64 {
    transition
        .dests
        .iter()
        .map(|(dest, probability)| {
            let continuation = state_values[dest.unwrap_or(state)];
            probability * (transition.reward + discount * continuation)
        })
        .sum()
}

// Performs a single synchronous sweep: every new value is computed from `prev_state_values` only.
// Returns the maximum change in state values.
fn iterate_state_value(
    transitions: &[Vec<Transition>],
    prev_state_values: &[f64],
    new_state_values: &mut [f64],
    discount: f64,
) -> f64 {
    let mut max_delta: f64 = 0.0;

    for (state, state_transitions) in transitions.iter().enumerate() {
        let best_action_value = state_transitions
            .iter()
            .map(|transition| get_action_value(transition, state, prev_state_values, discount))
            .fold(f64::NEG_INFINITY, f64::max);
        new_state_values[state] = best_action_value;

        let delta = (prev_state_values[state] - best_action_value).abs();
        // `f64::max` would drop a NaN.
        if delta.is_nan() || delta > max_delta {
            max_delta = delta;
        }
    }

    max_delta
}

// The whole computation happens in `new`; afterwards the value table is read-only.
#[derive(Debug)]
pub struct ValueIteration<'a, E: Environment> {
    env: &'a E,
    config: SolverConfig,
    index: HashMap<E::State, usize>,
    // Indexed by [state][action] in the environment's order.
    transitions: Vec<Vec<Transition>>,
    state_values: Vec<f64>,
    deltas: Vec<f64>,
}

impl<'a, E: Environment> ValueIteration<'a, E> {
    pub fn new(env: &'a E, config: SolverConfig) -> Result<Self, SolverError<E::Error>> {
        config.validate::<E::Error>()?;

        let index = index_states(env)?;
        let transitions = compile_transitions(env, &index)?;

        let mut solver = ValueIteration {
            env: env,
            config: config,
            index: index,
            transitions: transitions,
            state_values: vec![0.0; env.states().len()],
            deltas: Vec::new(),
        };
        solver.solve()?;
        Ok(solver)
    }

    fn solve(&mut self) -> Result<(), SolverError<E::Error>> {
        let mut next_state_values = vec![0.0; self.state_values.len()];

        loop {
            let delta = iterate_state_value(
                &self.transitions,
                &self.state_values,
                &mut next_state_values,
                self.config.discount,
            );
            std::mem::swap(&mut self.state_values, &mut next_state_values);
            self.deltas.push(delta);
            debug!(sweep = self.deltas.len(), delta, "value iteration sweep");

            if delta <= self.config.theta {
                info!(
                    sweeps = self.deltas.len(),
                    delta,
                    states = self.state_values.len(),
                    "value iteration converged"
                );
                return Ok(());
            }

            if self.deltas.len() >= self.config.max_sweeps {
                return Err(SolverError::NonConvergent {
                    sweeps: self.deltas.len(),
                    delta: delta,
                });
            }
        }
    }

    pub fn env(&self) -> &'a E {
        self.env
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn sweeps(&self) -> usize {
        self.deltas.len()
    }

    // Maximum change in state values of every sweep, in order.
    pub fn deltas(&self) -> &[f64] {
        &self.deltas
    }

    pub fn values(&self) -> &[f64] {
        &self.state_values
    }

    pub fn value(&self, state: &E::State) -> Result<f64, SolverError<E::Error>> {
        let state = self.state_index(state)?;
        Ok(self.state_values[state])
    }

    // In the environment's action order.
    pub fn q_values(&self, state: &E::State) -> Result<Vec<(&'a E::Action, f64)>, SolverError<E::Error>> {
        let state = self.state_index(state)?;
        Ok(self
            .env
            .actions()
            .iter()
            .zip(self.action_values(state))
            .collect())
    }

    // All actions of `state` whose value equals the best one exactly.
    pub fn greedy_actions(&self, state: &E::State) -> Result<Vec<&'a E::Action>, SolverError<E::Error>> {
        let state_index = self.state_index(state)?;
        let actions = self.env.actions();
        let greedy: Vec<&'a E::Action> = self
            .greedy_action_indices(state_index)
            .into_iter()
            .map(|action| &actions[action])
            .collect();

        if greedy.is_empty() {
            return Err(SolverError::MalformedModel(format!(
                "no comparable action value in state {:?}",
                state
            )));
        }
        Ok(greedy)
    }

    // Uniformly at random among ties.
    pub fn select_action<R: Rng + ?Sized>(
        &self,
        state: &E::State,
        rng: &mut R,
    ) -> Result<&'a E::Action, SolverError<E::Error>> {
        let greedy = uniform(self.greedy_actions(state)?);
        choose_weighted(&greedy, rng).copied().ok_or_else(|| {
            SolverError::MalformedModel(format!("no action to choose in state {:?}", state))
        })
    }

    // Sampling the result consumes the generator exactly like `select_action`.
    pub fn policy(&self) -> Result<Policy<E::State, E::Action>, SolverError<E::Error>> {
        let mut policy_states = HashMap::new();

        for state in self.env.states() {
            let actions = uniform(self.greedy_actions(state)?)
                .into_iter()
                .map(|(action, probability)| (action.clone(), probability))
                .collect();
            policy_states.insert(state.clone(), PolicyState { actions: actions });
        }

        Ok(Policy {
            states: policy_states,
        })
    }

    // Largest gap between a state's value and its best action value.
    pub fn bellman_residual(&self) -> f64 {
        (0..self.state_values.len())
            .map(|state| {
                let best = self
                    .action_values(state)
                    .fold(f64::NEG_INFINITY, f64::max);
                (self.state_values[state] - best).abs()
            })
            .fold(0.0, f64::max)
    }

    fn state_index(&self, state: &E::State) -> Result<usize, SolverError<E::Error>> {
        self.index
            .get(state)
            .copied()
            .ok_or_else(|| SolverError::UnknownState(format!("{:?}", state)))
    }

    fn action_values(&self, state: usize) -> impl Iterator<Item = f64> + '_ {
        self.transitions[state].iter().map(move |transition| {
            get_action_value(transition, state, &self.state_values, self.config.discount)
        })
    }

    fn greedy_action_indices(&self, state: usize) -> Vec<usize> {
        let action_values: Vec<f64> = self.action_values(state).collect();
        let max_action_value = action_values
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);

        // Exact equality: equivalent actions produce bit-identical values.
        action_values
            .iter()
            .enumerate()
            .filter(|(_, value)| **value == max_action_value)
            .map(|(action, _)| action)
            .collect()
    }
}

fn uniform<T>(items: Vec<T>) -> Vec<(T, f64)> {
    let probability = 1.0 / items.len() as f64;
    items.into_iter().map(|item| (item, probability)).collect()
}

fn index_states<E: Environment>(env: &E) -> Result<HashMap<E::State, usize>, SolverError<E::Error>> {
    let mut index = HashMap::with_capacity(env.states().len());
    for (i, state) in env.states().iter().enumerate() {
        if index.insert(state.clone(), i).is_some() {
            return Err(SolverError::MalformedModel(format!(
                "state {:?} is listed more than once",
                state
            )));
        }
    }
    Ok(index)
}

// Queries the environment once for every (state, action) pair and checks what comes back.
fn compile_transitions<E: Environment>(
    env: &E,
    index: &HashMap<E::State, usize>,
) -> Result<Vec<Vec<Transition>>, SolverError<E::Error>> {
    if env.actions().is_empty() {
        return Err(SolverError::MalformedModel(
            "environment has no actions".to_string(),
        ));
    }

    let mut transitions = Vec::with_capacity(env.states().len());
    for state in env.states() {
        let mut state_transitions = Vec::with_capacity(env.actions().len());
        for action in env.actions() {
            let outcomes = env
                .next_outcomes(action, state)
                .map_err(SolverError::Environment)?;
            state_transitions.push(compile_outcomes::<E>(outcomes, state, action, index)?);
        }
        transitions.push(state_transitions);
    }
    Ok(transitions)
}

fn compile_outcomes<E: Environment>(
    outcomes: Outcomes<E::State>,
    state: &E::State,
    action: &E::Action,
    index: &HashMap<E::State, usize>,
) -> Result<Transition, SolverError<E::Error>> {
    let malformed = |reason: String| {
        SolverError::MalformedModel(format!("{:?} from {:?}: {}", action, state, reason))
    };

    if outcomes.successors.len() != outcomes.probabilities.len() {
        return Err(malformed(format!(
            "{} successors but {} probabilities",
            outcomes.successors.len(),
            outcomes.probabilities.len()
        )));
    }
    if !outcomes.reward.is_finite() {
        return Err(malformed(format!("reward {}", outcomes.reward)));
    }
    if outcomes
        .probabilities
        .iter()
        .any(|p| !p.is_finite() || *p < 0.0)
    {
        return Err(malformed(format!(
            "invalid probabilities {:?}",
            outcomes.probabilities
        )));
    }
    let total_probability: f64 = outcomes.probabilities.iter().sum();
    if (total_probability - 1.0).abs() > PROBABILITY_TOLERANCE {
        return Err(malformed(format!(
            "probabilities sum to {}",
            total_probability
        )));
    }

    let mut dests = Vec::with_capacity(outcomes.successors.len());
    for (successor, probability) in outcomes.successors.iter().zip(outcomes.probabilities) {
        let dest = match successor {
            Some(successor) => Some(
                *index
                    .get(successor)
                    .ok_or_else(|| malformed(format!("unknown successor {:?}", successor)))?,
            ),
            None => None,
        };
        dests.push((dest, probability));
    }

    Ok(Transition {
        dests: dests,
        reward: outcomes.reward,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::*;
    use rand::prelude::*;
    use rstest::rstest;
    use thiserror::Error;

    #[derive(Debug, Error, PartialEq)]
    #[error("no outcomes for {1:?} in state {0}")]
    struct MissingOutcomes(u32, char);

    // Environment given as an explicit table of outcomes.
    #[derive(Debug, Default)]
    struct TableEnv {
        states: Vec<u32>,
        actions: Vec<char>,
        outcomes: HashMap<(u32, char), Outcomes<u32>>,
    }

    impl TableEnv {
        fn new(states: Vec<u32>, actions: Vec<char>) -> TableEnv {
            TableEnv {
                states: states,
                actions: actions,
                outcomes: HashMap::new(),
            }
        }

        fn with(mut self, state: u32, action: char, dests: &[(Option<u32>, f64)], reward: f64) -> TableEnv {
            self.outcomes.insert(
                (state, action),
                Outcomes {
                    successors: dests.iter().map(|(s, _)| *s).collect(),
                    probabilities: dests.iter().map(|(_, p)| *p).collect(),
                    reward: reward,
                },
            );
            self
        }
    }

    impl Environment for TableEnv {
        type State = u32;
        type Action = char;
        type Error = MissingOutcomes;

        fn states(&self) -> &[u32] {
            &self.states
        }

        fn actions(&self) -> &[char] {
            &self.actions
        }

        fn next_outcomes(&self, action: &char, state: &u32) -> Result<Outcomes<u32>, MissingOutcomes> {
            self.outcomes
                .get(&(*state, *action))
                .cloned()
                .ok_or(MissingOutcomes(*state, *action))
        }
    }

    fn tight() -> SolverConfig {
        SolverConfig {
            theta: 1e-9,
            ..SolverConfig::default()
        }
    }

    // Three states in a row; 's' stops with the state number as reward, 'm' moves
    // right at a cost with a chance of staying.
    fn chain_env() -> TableEnv {
        TableEnv::new(vec![0, 1, 2], vec!['s', 'm'])
            .with(0, 's', &[(None, 1.0)], 0.0)
            .with(0, 'm', &[(Some(1), 0.8), (Some(0), 0.2)], -1.0)
            .with(1, 's', &[(None, 1.0)], 1.0)
            .with(1, 'm', &[(Some(2), 0.8), (Some(1), 0.2)], -1.0)
            .with(2, 's', &[(None, 1.0)], 2.0)
            .with(2, 'm', &[(Some(2), 1.0)], -1.0)
    }

    #[test]
    fn single_terminal_action_is_geometric_series() {
        let reward = 10.0;
        let env = TableEnv::new(vec![0], vec!['a']).with(0, 'a', &[(None, 1.0)], reward);
        let solver = ValueIteration::new(&env, tight()).unwrap();

        let discount = solver.config().discount;
        assert_float_eq!(solver.value(&0).unwrap(), reward / (1.0 - discount), abs <= 1e-6);

        for seed in 0..100 {
            let rng = &mut StdRng::seed_from_u64(seed);
            assert_eq!(*solver.select_action(&0, rng).unwrap(), 'a');
        }
    }

    #[test]
    fn repeated_constructions_agree() {
        let env = chain_env();
        let first = ValueIteration::new(&env, SolverConfig::default()).unwrap();
        let second = ValueIteration::new(&env, SolverConfig::default()).unwrap();

        assert_eq!(first.values(), second.values());
        assert_eq!(first.deltas(), second.deltas());
    }

    #[rstest]
    #[case(0.1)]
    #[case(1e-3)]
    #[case(1e-8)]
    fn bellman_residual_within_theta(#[case] theta: f64) {
        let env = chain_env();
        let config = SolverConfig {
            theta: theta,
            ..SolverConfig::default()
        };
        let solver = ValueIteration::new(&env, config).unwrap();

        assert!(solver.bellman_residual() <= theta);
    }

    #[test]
    fn sweep_deltas_contract() {
        let env = chain_env();
        let solver = ValueIteration::new(&env, tight()).unwrap();
        let discount = solver.config().discount;

        assert!(solver.sweeps() > 1);
        for pair in solver.deltas().windows(2) {
            assert!(pair[1] <= discount * pair[0] + 1e-12, "{:?}", pair);
        }
    }

    #[test]
    fn chain_prefers_moving_right() {
        let env = chain_env();
        let solver = ValueIteration::new(&env, tight()).unwrap();
        let rng = &mut StdRng::seed_from_u64(7);

        assert_eq!(*solver.select_action(&0, rng).unwrap(), 'm');
        assert_eq!(*solver.select_action(&2, rng).unwrap(), 's');
        assert!(solver.value(&2).unwrap() > solver.value(&0).unwrap());
    }

    #[test]
    fn sweeps_read_previous_values_only() {
        // State 1 is listed first so an in-place sweep would already see its new value.
        let env = TableEnv::new(vec![1, 0], vec!['a'])
            .with(1, 'a', &[(None, 1.0)], 1.0)
            .with(0, 'a', &[(Some(1), 1.0)], 0.0);
        let config = SolverConfig {
            theta: 10.0,
            ..SolverConfig::default()
        };
        let solver = ValueIteration::new(&env, config).unwrap();

        assert_eq!(solver.sweeps(), 1);
        assert_eq!(solver.value(&1).unwrap(), 1.0);
        assert_eq!(solver.value(&0).unwrap(), 0.0);
    }

    #[test]
    fn ties_are_broken_uniformly() {
        let env = TableEnv::new(vec![0], vec!['a', 'b'])
            .with(0, 'a', &[(None, 1.0)], 1.0)
            .with(0, 'b', &[(None, 1.0)], 1.0);
        let solver = ValueIteration::new(&env, SolverConfig::default()).unwrap();

        assert_eq!(solver.greedy_actions(&0).unwrap(), vec![&'a', &'b']);

        let n = 2000;
        let a_count = (0..n)
            .filter(|seed| {
                let rng = &mut StdRng::seed_from_u64(*seed);
                *solver.select_action(&0, rng).unwrap() == 'a'
            })
            .count();

        let fraction = a_count as f64 / n as f64;
        assert!((fraction - 0.5).abs() < 0.05, "{}", fraction);
    }

    #[test]
    fn unknown_state_is_rejected_every_time() {
        let env = chain_env();
        let solver = ValueIteration::new(&env, SolverConfig::default()).unwrap();

        for seed in 0..10 {
            let rng = &mut StdRng::seed_from_u64(seed);
            assert!(matches!(
                solver.select_action(&42, rng),
                Err(SolverError::UnknownState(_))
            ));
        }
        assert!(matches!(solver.value(&42), Err(SolverError::UnknownState(_))));
        assert!(matches!(solver.q_values(&42), Err(SolverError::UnknownState(_))));
    }

    #[test]
    fn eager_policy_matches_queries() {
        let env = TableEnv::new(vec![0, 1], vec!['a', 'b', 'c'])
            .with(0, 'a', &[(None, 1.0)], 1.0)
            .with(0, 'b', &[(None, 1.0)], 1.0)
            .with(0, 'c', &[(Some(1), 1.0)], -5.0)
            .with(1, 'a', &[(Some(0), 1.0)], 0.0)
            .with(1, 'b', &[(Some(0), 1.0)], 0.0)
            .with(1, 'c', &[(None, 1.0)], 0.0);
        let solver = ValueIteration::new(&env, SolverConfig::default()).unwrap();
        let policy = solver.policy().unwrap();

        for seed in 0..200 {
            for state in &[0, 1] {
                let lazy = solver.select_action(state, &mut StdRng::seed_from_u64(seed)).unwrap();
                let eager = policy.sample(state, &mut StdRng::seed_from_u64(seed)).unwrap();
                assert_eq!(lazy, eager);
            }
        }

        let state_policy = &policy.states[&0];
        assert_eq!(state_policy.actions, vec![('a', 0.5), ('b', 0.5)]);
    }

    #[test]
    fn q_values_follow_action_order() {
        let env = chain_env();
        let solver = ValueIteration::new(&env, tight()).unwrap();
        let q = solver.q_values(&2).unwrap();

        assert_eq!(q.len(), 2);
        assert_eq!(*q[0].0, 's');
        assert_eq!(*q[1].0, 'm');
        assert_float_eq!(q[0].1, solver.value(&2).unwrap(), abs <= 1e-6);
    }

    #[test]
    fn hitting_sweep_cap_is_an_error() {
        let env = chain_env();
        let config = SolverConfig {
            max_sweeps: 3,
            ..tight()
        };

        match ValueIteration::new(&env, config) {
            Err(SolverError::NonConvergent { sweeps, delta }) => {
                assert_eq!(sweeps, 3);
                assert!(delta > 1e-9);
            }
            other => panic!("unexpected result {:?}", other.map(|s| s.sweeps())),
        }
    }

    #[rstest]
    #[case::mismatched_lengths(vec![None], vec![0.5, 0.5])]
    #[case::short_probabilities(vec![Some(0), None], vec![0.5, 0.4])]
    #[case::unknown_successor(vec![Some(9)], vec![1.0])]
    #[case::negative_probability(vec![Some(0), None], vec![1.5, -0.5])]
    fn malformed_outcomes_are_rejected(
        #[case] successors: Vec<Option<u32>>,
        #[case] probabilities: Vec<f64>,
    ) {
        let mut env = TableEnv::new(vec![0], vec!['a']);
        env.outcomes.insert(
            (0, 'a'),
            Outcomes {
                successors: successors,
                probabilities: probabilities,
                reward: 1.0,
            },
        );

        assert!(matches!(
            ValueIteration::new(&env, SolverConfig::default()),
            Err(SolverError::MalformedModel(_))
        ));
    }

    #[test]
    fn duplicate_states_are_rejected() {
        let env = TableEnv::new(vec![0, 0], vec!['a']).with(0, 'a', &[(None, 1.0)], 1.0);
        assert!(matches!(
            ValueIteration::new(&env, SolverConfig::default()),
            Err(SolverError::MalformedModel(_))
        ));
    }

    #[test]
    fn environment_errors_pass_through() {
        let env = TableEnv::new(vec![0, 1], vec!['a']).with(0, 'a', &[(None, 1.0)], 1.0);

        match ValueIteration::new(&env, SolverConfig::default()) {
            Err(err @ SolverError::Environment(_)) => {
                assert_eq!(err.to_string(), MissingOutcomes(1, 'a').to_string());
                if let SolverError::Environment(inner) = err {
                    assert_eq!(inner, MissingOutcomes(1, 'a'));
                }
            }
            other => panic!("unexpected result {:?}", other.map(|s| s.sweeps())),
        }
    }

    #[rstest]
    #[case(0.0, 0.1, 10)]
    #[case(1.0, 0.1, 10)]
    #[case(-0.5, 0.1, 10)]
    #[case(0.9, 0.0, 10)]
    #[case(0.9, f64::NAN, 10)]
    #[case(0.9, 0.1, 0)]
    fn invalid_config_is_rejected(#[case] discount: f64, #[case] theta: f64, #[case] max_sweeps: usize) {
        let env = chain_env();
        let config = SolverConfig {
            discount: discount,
            theta: theta,
            max_sweeps: max_sweeps,
        };

        assert!(matches!(
            ValueIteration::new(&env, config),
            Err(SolverError::InvalidConfig(_))
        ));
    }
}
