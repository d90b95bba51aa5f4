use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::env::{ActionId, ActionKind, BeaconGrid, ObservationId, Pomdp, StateId, next_model_id};
use crate::infra::{Bounds, CartesianProduct, JointError, MixedRadix, Position};
use crate::planners::Policy;
use crate::state::BeliefState;

/// Limits on joint model construction.
#[derive(Debug, Clone)]
pub struct JointGridConfig {
    /// Cells added around the anchor positions on every side.
    pub margin: i32,
    pub max_members: usize,
    pub max_states: usize,
}

impl Default for JointGridConfig {
    fn default() -> Self {
        Self {
            margin: 1,
            max_members: 3,
            max_states: 5_000,
        }
    }
}

/// One agent's view inside a joint model: its own grid model and the value
/// function used to score it once it leaves the joint problem.
#[derive(Clone)]
pub struct JointMember {
    pub model: Arc<BeaconGrid>,
    pub value: Arc<dyn Policy>,
}

/// Combined model for a small group of agents on a rectangular sub-grid.
///
/// Member local states are the free sub-grid cells plus `SINGLE_DONE`.
/// Joint states, actions and observations are mixed-radix tuples of the
/// member ones.
pub struct JointGrid {
    id: u64,
    members: Vec<JointMember>,
    bounds: Bounds,
    cells: Vec<Position>,
    local_index: HashMap<Position, usize>,
    exit_border: Vec<bool>,
    can_finish: Vec<bool>,
    states: MixedRadix,
    actions: MixedRadix,
    observations: MixedRadix,
    discount: f64,
}

impl JointGrid {
    /// Build a joint model on the box around `anchors` (belief supports and
    /// collision cells), grown by the configured margin and clipped to the
    /// map.
    pub fn new(
        members: Vec<JointMember>,
        anchors: &[Position],
        config: &JointGridConfig,
    ) -> Result<Self, JointError> {
        let n = members.len();
        if n < 2 {
            return Err(JointError::TooFewMembers(n));
        }
        let map = members[0].model.map().clone();
        let bounds = Bounds::enclosing(anchors)
            .unwrap_or(map.bounds())
            .expand(config.margin)
            .clip(map.width, map.height);

        let cells: Vec<Position> = bounds.positions().filter(|p| map.is_free(p)).collect();
        if cells.is_empty() {
            return Err(JointError::NoCells(bounds));
        }

        let states = MixedRadix::uniform(cells.len() + 1, n);
        let total = states.capacity().unwrap_or(usize::MAX);
        if n > config.max_members || total > config.max_states {
            return Err(JointError::TooLarge {
                members: n,
                states: total,
                limit: config.max_states,
            });
        }

        let local_index = cells.iter().enumerate().map(|(i, p)| (*p, i)).collect();
        let exit_border = cells
            .iter()
            .map(|p| {
                bounds.is_on_edge(p)
                    && p
                        .neighbors()
                        .iter()
                        .any(|q| map.is_free(q) && !bounds.contains(q))
            })
            .collect();
        let can_finish = members
            .iter()
            .map(|m| bounds.contains(&m.model.goal_position()))
            .collect();
        let actions = MixedRadix::new(members.iter().map(|m| m.model.action_count()).collect());
        let observations =
            MixedRadix::new(members.iter().map(|m| m.model.observation_count()).collect());
        let discount = members[0].model.discount();

        tracing::debug!(
            "Joint grid: {} members on {} ({} cells, {} states, {} actions)",
            n,
            bounds,
            cells.len(),
            total,
            actions.capacity().unwrap_or(usize::MAX)
        );

        Ok(Self {
            id: next_model_id(),
            members,
            bounds,
            cells,
            local_index,
            exit_border,
            can_finish,
            states,
            actions,
            observations,
            discount,
        })
    }

    pub fn members(&self) -> &[JointMember] {
        &self.members
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn single_done(&self) -> usize {
        self.cells.len()
    }

    pub fn encode_state(&self, locals: &[usize]) -> StateId {
        self.states.encode(locals)
    }

    pub fn decode_state(&self, state: StateId) -> Vec<usize> {
        self.states.decode(state)
    }

    pub fn encode_action(&self, actions: &[ActionId]) -> ActionId {
        self.actions.encode(actions)
    }

    pub fn decode_action(&self, action: ActionId) -> Vec<ActionId> {
        self.actions.decode(action)
    }

    /// Member-local index of a state of the member's own model. Done states
    /// and cells outside the sub-grid map to `SINGLE_DONE`.
    pub fn to_local(&self, member: usize, state: StateId) -> usize {
        self.members[member]
            .model
            .position_of(state)
            .and_then(|pos| self.local_index.get(&pos).copied())
            .unwrap_or(self.single_done())
    }

    pub fn to_member_state(&self, member: usize, local: usize) -> StateId {
        let model = &self.members[member].model;
        self.cells
            .get(local)
            .and_then(|pos| model.state_of(pos))
            .unwrap_or(model.done_state())
    }

    /// Member sits on an exit of the sub-grid and cannot finish inside it.
    pub fn is_absorbed(&self, member: usize, local: usize) -> bool {
        local < self.cells.len() && !self.can_finish[member] && self.exit_border[local]
    }

    fn is_finished(&self, member: usize, local: usize) -> bool {
        local == self.single_done() || self.is_absorbed(member, local)
    }

    fn finished_count(&self, locals: &[usize]) -> usize {
        locals
            .iter()
            .enumerate()
            .filter(|&(i, &l)| self.is_finished(i, l))
            .count()
    }

    /// Two members in the same cell.
    pub fn is_collision(&self, locals: &[usize]) -> bool {
        let done = self.single_done();
        locals
            .iter()
            .enumerate()
            .any(|(i, &a)| a != done && locals[i + 1..].contains(&a))
    }

    fn member_outcomes(&self, member: usize, local: usize, action: ActionId) -> Vec<(usize, f64)> {
        let done = self.single_done();
        if local == done || self.is_absorbed(member, local) {
            return vec![(done, 1.0)];
        }
        let model = &self.members[member].model;
        let mut merged: BTreeMap<usize, f64> = BTreeMap::new();
        for (next, p) in model.transitions(self.to_member_state(member, local), action) {
            let next_local = if model.is_terminal(next) {
                done
            } else {
                match model.position_of(next).and_then(|pos| self.local_index.get(&pos)) {
                    Some(&l) => l,
                    // leaving the sub-grid bounces back
                    None => local,
                }
            };
            *merged.entry(next_local).or_insert(0.0) += p;
        }
        merged.into_iter().collect()
    }

    fn member_reward(
        &self,
        member: usize,
        local: usize,
        action: ActionId,
        next_local: usize,
        continuation: bool,
    ) -> f64 {
        let done = self.single_done();
        if local == done {
            return 0.0;
        }
        let m = &self.members[member];
        let state = self.to_member_state(member, local);
        if self.is_absorbed(member, local) {
            return m.value.value(state);
        }
        let next = self.to_member_state(member, next_local);
        let reward = m.model.reward(state, action, next);
        if continuation && next_local != done {
            reward + self.discount * m.value.value(next)
        } else {
            reward
        }
    }

    /// Product of the members' beliefs over the sub-grid.
    pub fn joint_belief_entries(&self, beliefs: &[BeliefState]) -> Vec<(StateId, f64)> {
        let lists: Vec<Vec<(usize, f64)>> = beliefs
            .iter()
            .enumerate()
            .map(|(i, belief)| {
                let mut merged: BTreeMap<usize, f64> = BTreeMap::new();
                for &(s, p) in belief.non_zero_entries() {
                    *merged.entry(self.to_local(i, s)).or_insert(0.0) += p;
                }
                merged.into_iter().collect()
            })
            .collect();
        CartesianProduct::new(&lists)
            .map(|(locals, p)| (self.encode_state(&locals), p))
            .collect()
    }
}

impl Pomdp for JointGrid {
    fn model_id(&self) -> u64 {
        self.id
    }

    fn state_count(&self) -> usize {
        self.states.capacity().unwrap_or(usize::MAX)
    }

    fn action_count(&self) -> usize {
        self.actions.capacity().unwrap_or(usize::MAX)
    }

    fn observation_count(&self) -> usize {
        self.observations.capacity().unwrap_or(usize::MAX)
    }

    fn discount(&self) -> f64 {
        self.discount
    }

    fn transitions(&self, state: StateId, action: ActionId) -> Vec<(StateId, f64)> {
        let locals = self.decode_state(state);
        if self.finished_count(&locals) + 1 >= self.members.len() {
            return vec![(state, 1.0)];
        }
        let actions = self.decode_action(action);
        let lists: Vec<Vec<(usize, f64)>> = locals
            .iter()
            .zip(&actions)
            .enumerate()
            .map(|(i, (&l, &a))| self.member_outcomes(i, l, a))
            .collect();
        let mut merged: BTreeMap<StateId, f64> = BTreeMap::new();
        for (next, p) in CartesianProduct::new(&lists) {
            *merged.entry(self.encode_state(&next)).or_insert(0.0) += p;
        }
        merged.into_iter().collect()
    }

    fn observations(&self, action: ActionId, next_state: StateId) -> Vec<(ObservationId, f64)> {
        let locals = self.decode_state(next_state);
        let actions = self.decode_action(action);
        let lists: Vec<Vec<(usize, f64)>> = locals
            .iter()
            .zip(&actions)
            .enumerate()
            .map(|(i, (&l, &a))| {
                self.members[i]
                    .model
                    .observations(a, self.to_member_state(i, l))
            })
            .collect();
        CartesianProduct::new(&lists)
            .map(|(obs, p)| (self.observations.encode(&obs), p))
            .collect()
    }

    fn reward(&self, state: StateId, action: ActionId, next_state: StateId) -> f64 {
        let locals = self.decode_state(state);
        let n = self.members.len();
        if self.finished_count(&locals) + 1 >= n {
            return 0.0;
        }
        let actions = self.decode_action(action);
        let next = self.decode_state(next_state);
        let continuation = self.finished_count(&next) + 1 >= n;
        (0..n)
            .map(|i| self.member_reward(i, locals[i], actions[i], next[i], continuation))
            .sum()
    }

    fn is_terminal(&self, state: StateId) -> bool {
        self.finished_count(&self.decode_state(state)) + 1 >= self.members.len()
    }

    fn is_blocked(&self, state: StateId) -> bool {
        self.is_collision(&self.decode_state(state))
    }

    fn action_kind(&self, action: ActionId) -> ActionKind {
        let kinds: Vec<ActionKind> = self
            .decode_action(action)
            .iter()
            .enumerate()
            .map(|(i, &a)| self.members[i].model.action_kind(a))
            .collect();
        if kinds.contains(&ActionKind::Move) {
            ActionKind::Move
        } else if kinds.contains(&ActionKind::Sense) {
            ActionKind::Sense
        } else if kinds.iter().all(|k| *k == ActionKind::Done) {
            ActionKind::Done
        } else {
            ActionKind::Stay
        }
    }

    fn initial_belief(&self) -> Vec<(StateId, f64)> {
        let beliefs: Vec<BeliefState> = self
            .members
            .iter()
            .filter_map(|m| BeliefState::initial(m.model.as_ref(), None).ok())
            .collect();
        self.joint_belief_entries(&beliefs)
    }

    fn state_label(&self, state: StateId) -> String {
        let parts: Vec<String> = self
            .decode_state(state)
            .iter()
            .map(|&l| match self.cells.get(l) {
                Some(pos) => pos.to_string(),
                None => "DONE".to_string(),
            })
            .collect();
        format!("({})", parts.join(", "))
    }

    fn action_label(&self, action: ActionId) -> String {
        let parts: Vec<String> = self
            .decode_action(action)
            .iter()
            .enumerate()
            .map(|(i, &a)| self.members[i].model.action_label(a))
            .collect();
        format!("({})", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{GridAction, GridParams};
    use crate::infra::Direction;
    use crate::planners::NullPolicy;
    use crate::state::GridMap;

    fn member(map: &Arc<GridMap>, start: Position, goal: Position, slip: f64) -> JointMember {
        let params = GridParams {
            slip,
            ..GridParams::default()
        };
        let model = Arc::new(BeaconGrid::new(map.clone(), Vec::new(), start, goal, params).unwrap());
        let done = model.action_id(GridAction::Done);
        JointMember {
            model,
            value: Arc::new(NullPolicy::new(done)),
        }
    }

    fn crossing(slip: f64) -> JointGrid {
        let map = Arc::new(GridMap::open(5, 5));
        let members = vec![
            member(&map, Position::new(0, 2), Position::new(4, 2), slip),
            member(&map, Position::new(2, 0), Position::new(2, 4), slip),
        ];
        let anchors = [Position::new(0, 2), Position::new(2, 0), Position::new(2, 2)];
        JointGrid::new(members, &anchors, &JointGridConfig::default()).unwrap()
    }

    #[test]
    fn test_joint_encode_decode_round_trip() {
        let joint = crossing(0.0);
        // box 0..=3 x 0..=3 gives 16 cells plus SINGLE_DONE
        assert_eq!(joint.single_done(), 16);
        assert_eq!(joint.state_count(), 17 * 17);
        for state in 0..joint.state_count() {
            let locals = joint.decode_state(state);
            assert!(locals.iter().all(|&l| l <= joint.single_done()));
            assert_eq!(joint.encode_state(&locals), state);
        }
        assert_eq!(joint.action_count(), 36);
        for action in 0..joint.action_count() {
            assert_eq!(joint.encode_action(&joint.decode_action(action)), action);
        }
        let per_member: Vec<usize> = joint.members().iter().map(|m| m.model.observation_count()).collect();
        assert_eq!(joint.observation_count(), per_member.iter().product::<usize>());
        for observation in 0..joint.observation_count() {
            let parts = joint.observations.decode(observation);
            assert!(parts.iter().zip(&per_member).all(|(o, n)| o < n));
            assert_eq!(joint.observations.encode(&parts), observation);
        }
    }

    #[test]
    fn test_joint_transitions_sum_to_one() {
        let joint = crossing(0.2);
        let east = joint.members()[0].model.action_id(GridAction::Move(Direction::East));
        let south = joint.members()[1].model.action_id(GridAction::Move(Direction::South));
        let action = joint.encode_action(&[east, south]);
        let start = joint.encode_state(&[
            joint.to_local(0, joint.members()[0].model.state_of(&Position::new(1, 1)).unwrap()),
            joint.to_local(1, joint.members()[1].model.state_of(&Position::new(2, 1)).unwrap()),
        ]);
        let outcomes = joint.transitions(start, action);
        assert_eq!(outcomes.len(), 9);
        let total: f64 = outcomes.iter().map(|(_, p)| p).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_joint_collision_states_blocked() {
        let joint = crossing(0.0);
        let cell = joint.to_local(0, joint.members()[0].model.state_of(&Position::new(2, 2)).unwrap());
        assert!(joint.is_blocked(joint.encode_state(&[cell, cell])));
        let done = joint.single_done();
        assert!(!joint.is_blocked(joint.encode_state(&[done, done])));
        assert!(!joint.is_blocked(joint.encode_state(&[cell, done])));
    }

    #[test]
    fn test_joint_border_absorption() {
        let joint = crossing(0.0);
        // agent 0's goal (4,2) lies outside the box, column 3 is an exit
        let exit = joint.to_local(0, joint.members()[0].model.state_of(&Position::new(3, 2)).unwrap());
        let inner = joint.to_local(1, joint.members()[1].model.state_of(&Position::new(1, 1)).unwrap());
        assert!(joint.is_absorbed(0, exit));
        let state = joint.encode_state(&[exit, inner]);
        assert!(joint.is_terminal(state));

        let origin = joint.to_local(0, joint.members()[0].model.state_of(&Position::new(0, 0)).unwrap());
        // left map edge is not an exit
        assert!(!joint.is_absorbed(0, origin));
    }

    #[test]
    fn test_joint_single_done_outcomes_merged() {
        let map = Arc::new(GridMap::open(5, 5));
        let members = vec![
            member(&map, Position::new(1, 1), Position::new(1, 1), 0.0),
            member(&map, Position::new(2, 2), Position::new(2, 2), 0.0),
            member(&map, Position::new(0, 0), Position::new(3, 3), 0.0),
        ];
        let anchors = [Position::new(0, 0), Position::new(3, 3)];
        let config = JointGridConfig {
            margin: 0,
            ..JointGridConfig::default()
        };
        let joint = JointGrid::new(members, &anchors, &config).unwrap();
        let locals: Vec<usize> = (0..3)
            .map(|i| {
                let model = &joint.members()[i].model;
                joint.to_local(i, model.goal())
            })
            .collect();
        let start = joint.encode_state(&locals);
        let done_actions: Vec<ActionId> = joint
            .members()
            .iter()
            .map(|m| m.model.action_id(GridAction::Done))
            .collect();
        let action = joint.encode_action(&done_actions);
        let outcomes = joint.transitions(start, action);
        // every member declares done on its goal in the same step
        assert_eq!(outcomes.len(), 1);
        assert!((outcomes[0].1 - 1.0).abs() < 1e-12);
        assert!(joint.is_terminal(outcomes[0].0));
        assert!((joint.reward(start, action, outcomes[0].0) - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_joint_too_large_rejected() {
        let map = Arc::new(GridMap::open(5, 5));
        let members = vec![
            member(&map, Position::new(0, 0), Position::new(4, 4), 0.0),
            member(&map, Position::new(4, 4), Position::new(0, 0), 0.0),
            member(&map, Position::new(0, 4), Position::new(4, 0), 0.0),
        ];
        let anchors = [Position::new(0, 0), Position::new(4, 4)];
        let config = JointGridConfig {
            max_states: 1000,
            ..JointGridConfig::default()
        };
        assert!(matches!(
            JointGrid::new(members, &anchors, &config),
            Err(JointError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_joint_belief_product() {
        let joint = crossing(0.0);
        let beliefs: Vec<BeliefState> = joint
            .members()
            .iter()
            .map(|m| BeliefState::initial(m.model.as_ref(), None).unwrap())
            .collect();
        let entries = joint.joint_belief_entries(&beliefs);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, 1.0);
        assert_eq!(joint.state_label(entries[0].0), "(<0,2>, <2,0>)");
    }
}
