use std::sync::Arc;

use crate::env::{ActionId, ActionKind, ObservationId, Pomdp, StateId, next_model_id};
use crate::infra::{Direction, ModelError, Position};
use crate::state::GridMap;

/// A ranging beacon. Pinging it reports a noisy distance that is never
/// shorter than the true Manhattan distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beacon {
    pub position: Position,
    pub range: i32,
}

impl Beacon {
    pub fn new(position: Position, range: i32) -> Self {
        Self { position, range }
    }

    pub fn distance_to(&self, pos: &Position) -> i32 {
        self.position.distance(pos)
    }
}

/// Model parameters shared by every agent of a scenario.
#[derive(Debug, Clone)]
pub struct GridParams {
    /// Probability mass moved to the two perpendicular directions, split evenly.
    pub slip: f64,
    /// Reward for reaching the absorbing done state.
    pub success_reward: f64,
    /// Reward for every other transition.
    pub step_reward: f64,
    pub discount: f64,
}

impl Default for GridParams {
    fn default() -> Self {
        Self {
            slip: 0.2,
            success_reward: 10.0,
            step_reward: -0.04,
            discount: 0.99,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridAction {
    Move(Direction),
    Stay,
    Ping(usize),
    Done,
}

/// Single-agent grid with slipping moves and beacon-distance sensing.
///
/// States are the free cells of the map (row-major) plus one absorbing
/// `DONE` state. Actions are `n, e, s, w, noop`, one ping per beacon and a
/// final `done` which only has an effect on the goal cell.
#[derive(Debug, Clone)]
pub struct BeaconGrid {
    id: u64,
    map: Arc<GridMap>,
    beacons: Vec<Beacon>,
    starts: Vec<StateId>,
    goal: StateId,
    params: GridParams,
    max_range: i32,
}

impl BeaconGrid {
    pub fn new(
        map: Arc<GridMap>,
        beacons: Vec<Beacon>,
        start: Position,
        goal: Position,
        params: GridParams,
    ) -> Result<Self, ModelError> {
        Self::with_start_cells(map, beacons, &[start], goal, params)
    }

    /// Initial belief is uniform over `starts`.
    pub fn with_start_cells(
        map: Arc<GridMap>,
        beacons: Vec<Beacon>,
        starts: &[Position],
        goal: Position,
        params: GridParams,
    ) -> Result<Self, ModelError> {
        let goal = map.cell_index(&goal).ok_or(ModelError::NotFree(goal))?;
        let starts = starts
            .iter()
            .map(|pos| map.cell_index(pos).ok_or(ModelError::NotFree(*pos)))
            .collect::<Result<Vec<_>, _>>()?;
        if starts.is_empty() {
            return Err(ModelError::InvalidScenario("no start cell".to_string()));
        }
        let max_range = beacons.iter().map(|b| b.range.max(0)).max().unwrap_or(0);
        Ok(Self {
            id: next_model_id(),
            map,
            beacons,
            starts,
            goal,
            params,
            max_range,
        })
    }

    pub fn map(&self) -> &Arc<GridMap> {
        &self.map
    }

    pub fn beacons(&self) -> &[Beacon] {
        &self.beacons
    }

    pub fn params(&self) -> &GridParams {
        &self.params
    }

    pub fn goal(&self) -> StateId {
        self.goal
    }

    pub fn goal_position(&self) -> Position {
        // goal is validated in the constructor
        self.map.position(self.goal).unwrap_or(Position::new(0, 0))
    }

    pub fn done_state(&self) -> StateId {
        self.map.len()
    }

    pub fn position_of(&self, state: StateId) -> Option<Position> {
        self.map.position(state)
    }

    pub fn state_of(&self, pos: &Position) -> Option<StateId> {
        self.map.cell_index(pos)
    }

    pub fn infinity_observation(&self) -> ObservationId {
        (self.max_range + 1) as ObservationId
    }

    pub fn done_observation(&self) -> ObservationId {
        (self.max_range + 2) as ObservationId
    }

    pub fn action_id(&self, action: GridAction) -> ActionId {
        match action {
            GridAction::Move(Direction::North) => 0,
            GridAction::Move(Direction::East) => 1,
            GridAction::Move(Direction::South) => 2,
            GridAction::Move(Direction::West) => 3,
            GridAction::Stay => 4,
            GridAction::Ping(b) => 5 + b,
            GridAction::Done => 5 + self.beacons.len(),
        }
    }

    pub fn grid_action(&self, action: ActionId) -> GridAction {
        match action {
            0..=3 => GridAction::Move(Direction::ALL[action]),
            4 => GridAction::Stay,
            a if a < 5 + self.beacons.len() => GridAction::Ping(a - 5),
            _ => GridAction::Done,
        }
    }

    pub fn sensing_actions(&self) -> Vec<ActionId> {
        (0..self.beacons.len())
            .map(|b| self.action_id(GridAction::Ping(b)))
            .collect()
    }

    /// Cell reached by moving `direction` from `state`; blocked moves stay.
    fn target(&self, state: StateId, direction: Direction) -> StateId {
        self.map
            .position(state)
            .map(|pos| pos.step(direction))
            .and_then(|next| self.map.cell_index(&next))
            .unwrap_or(state)
    }

    /// Distribution of a ping reading at true distance `distance`.
    fn ping_distribution(&self, distance: i32, range: i32) -> Vec<(ObservationId, f64)> {
        if distance > range {
            return vec![(self.infinity_observation(), 1.0)];
        }
        let norm = 2f64.powi(range + 1) - 2f64.powi(distance);
        (distance..=range)
            .map(|o| {
                (
                    o as ObservationId,
                    2f64.powi(distance + range - o) / norm,
                )
            })
            .collect()
    }
}

impl Pomdp for BeaconGrid {
    fn model_id(&self) -> u64 {
        self.id
    }

    fn state_count(&self) -> usize {
        self.map.len() + 1
    }

    fn action_count(&self) -> usize {
        6 + self.beacons.len()
    }

    fn observation_count(&self) -> usize {
        (self.max_range + 3) as usize
    }

    fn discount(&self) -> f64 {
        self.params.discount
    }

    fn transitions(&self, state: StateId, action: ActionId) -> Vec<(StateId, f64)> {
        let done = self.done_state();
        if state == done {
            return vec![(done, 1.0)];
        }
        match self.grid_action(action) {
            GridAction::Move(direction) => {
                let slip = self.params.slip.clamp(0.0, 1.0);
                let mut outcomes: Vec<(StateId, f64)> =
                    vec![(self.target(state, direction), 1.0 - slip)];
                if slip > 0.0 {
                    for side in direction.perpendicular() {
                        let next = self.target(state, side);
                        match outcomes.iter_mut().find(|(s, _)| *s == next) {
                            Some(entry) => entry.1 += slip / 2.0,
                            None => outcomes.push((next, slip / 2.0)),
                        }
                    }
                }
                outcomes.retain(|(_, p)| *p > 0.0);
                outcomes
            }
            GridAction::Done if state == self.goal => vec![(done, 1.0)],
            GridAction::Stay | GridAction::Ping(_) | GridAction::Done => vec![(state, 1.0)],
        }
    }

    fn observations(&self, action: ActionId, next_state: StateId) -> Vec<(ObservationId, f64)> {
        if next_state == self.done_state() {
            return vec![(self.done_observation(), 1.0)];
        }
        match (self.grid_action(action), self.map.position(next_state)) {
            (GridAction::Ping(b), Some(pos)) => {
                let beacon = &self.beacons[b];
                self.ping_distribution(beacon.distance_to(&pos), beacon.range)
            }
            _ => vec![(self.infinity_observation(), 1.0)],
        }
    }

    fn reward(&self, state: StateId, _action: ActionId, next_state: StateId) -> f64 {
        let done = self.done_state();
        if state == done {
            0.0
        } else if next_state == done {
            self.params.success_reward
        } else {
            self.params.step_reward
        }
    }

    fn is_terminal(&self, state: StateId) -> bool {
        state == self.done_state()
    }

    fn action_kind(&self, action: ActionId) -> ActionKind {
        match self.grid_action(action) {
            GridAction::Move(_) => ActionKind::Move,
            GridAction::Stay => ActionKind::Stay,
            GridAction::Ping(_) => ActionKind::Sense,
            GridAction::Done => ActionKind::Done,
        }
    }

    fn initial_belief(&self) -> Vec<(StateId, f64)> {
        let p = 1.0 / self.starts.len() as f64;
        self.starts.iter().map(|&s| (s, p)).collect()
    }

    fn state_label(&self, state: StateId) -> String {
        match self.map.position(state) {
            Some(pos) => pos.to_string(),
            None => "DONE".to_string(),
        }
    }

    fn action_label(&self, action: ActionId) -> String {
        match self.grid_action(action) {
            GridAction::Move(Direction::North) => "n".to_string(),
            GridAction::Move(Direction::East) => "e".to_string(),
            GridAction::Move(Direction::South) => "s".to_string(),
            GridAction::Move(Direction::West) => "w".to_string(),
            GridAction::Stay => "noop".to_string(),
            GridAction::Ping(b) => format!("ping{}", b),
            GridAction::Done => "done".to_string(),
        }
    }
}
