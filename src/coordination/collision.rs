use std::collections::BTreeSet;
use std::fmt;

use crate::env::StateId;
use crate::infra::{SubsetOrder, subsets};

use super::agent::Agent;
use super::dominance::{DominanceKey, DominancePolicy};
use super::expansion::Lookahead;

/// An overlap of possible states between agents at some lookahead step.
#[derive(Debug, Clone, Default)]
pub struct PotentialCollisionData {
    /// Agent indices, most dominant first once ordered.
    members: Vec<usize>,
    states: BTreeSet<StateId>,
    step: usize,
    yielded: usize,
}

impl PotentialCollisionData {
    pub fn new(mut members: Vec<usize>, states: BTreeSet<StateId>, step: usize) -> Self {
        members.sort_unstable();
        Self {
            members,
            states,
            step,
            yielded: 0,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[usize] {
        &self.members
    }

    pub fn states(&self) -> &BTreeSet<StateId> {
        &self.states
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Sort members by dominance and rewind the cursor.
    pub fn order_by(&mut self, agents: &[Agent], policy: &dyn DominancePolicy) {
        let mut keys: Vec<DominanceKey> = self
            .members
            .iter()
            .map(|&i| DominanceKey::of(i, &agents[i]))
            .collect();
        policy.order(&mut keys);
        self.members = keys.iter().map(|k| k.agent).collect();
        self.reset();
    }

    /// Move `pinned` members ahead of the others, keeping relative order,
    /// and rewind the cursor. Pinned members are never asked to yield unless
    /// every member is pinned.
    pub fn promote(&mut self, pinned: &[usize]) {
        let (mut front, back): (Vec<usize>, Vec<usize>) =
            self.members.iter().partition(|i| pinned.contains(i));
        front.extend(back);
        self.members = front;
        self.reset();
    }

    /// The most dominant member never yields.
    pub fn has_next_non_dominant(&self) -> bool {
        self.yielded + 1 < self.members.len()
    }

    /// Next member asked to yield, least dominant first.
    pub fn next_non_dominant(&mut self) -> Option<usize> {
        if !self.has_next_non_dominant() {
            return None;
        }
        let member = self.members[self.members.len() - 1 - self.yielded];
        self.yielded += 1;
        Some(member)
    }

    pub fn reset(&mut self) {
        self.yielded = 0;
    }
}

impl fmt::Display for PotentialCollisionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let states: Vec<String> = self.states.iter().map(|s| s.to_string()).collect();
        write!(f, "agents {:?} at step {} in {{{}}}", self.members, self.step, states.join(", "))
    }
}

/// An agent taking part in a detection pass.
pub struct Participant<'a> {
    pub agent: usize,
    pub lookahead: &'a Lookahead,
    pub distance_threshold: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectionMode {
    Pairwise,
    #[default]
    Subsets,
}

#[derive(Debug, Clone, Default)]
pub struct CollisionDetector {
    pub mode: DetectionMode,
    pub order: SubsetOrder,
}

impl CollisionDetector {
    pub fn new(mode: DetectionMode, order: SubsetOrder) -> Self {
        Self { mode, order }
    }

    /// First potential collision among `participants`, or an empty result.
    pub fn detect(&self, participants: &[Participant<'_>]) -> PotentialCollisionData {
        self.detect_skipping(participants, |_| false)
    }

    /// Like [`detect`](Self::detect), but groups for which `skip` returns
    /// true are not checked. `skip` gets the sorted agent indices.
    pub fn detect_skipping(
        &self,
        participants: &[Participant<'_>],
        skip: impl Fn(&[usize]) -> bool,
    ) -> PotentialCollisionData {
        let n = participants.len();
        if n < 2 {
            return PotentialCollisionData::empty();
        }
        let check = |subset: Vec<usize>| {
            let mut agents: Vec<usize> = subset.iter().map(|&i| participants[i].agent).collect();
            agents.sort_unstable();
            if skip(&agents) {
                None
            } else {
                self.check(participants, &subset)
            }
        };
        let found = match self.mode {
            DetectionMode::Pairwise => (0..n)
                .flat_map(|i| (i + 1..n).map(move |j| vec![i, j]))
                .find_map(check),
            DetectionMode::Subsets => subsets(n, self.order).find_map(check),
        };
        match found {
            Some(collision) => {
                tracing::debug!("Potential collision: {}", collision);
                collision
            }
            None => PotentialCollisionData::empty(),
        }
    }

    /// Step every member's lookahead in lockstep and report the first depth
    /// where all of them may occupy a common state.
    fn check(&self, participants: &[Participant<'_>], subset: &[usize]) -> Option<PotentialCollisionData> {
        let members: Vec<&Participant<'_>> = subset.iter().map(|&i| &participants[i]).collect();
        let threshold = members.iter().map(|m| m.distance_threshold).min()?;
        let (first, rest) = members.split_first()?;

        for depth in 1..=2 * threshold {
            let mut common = first.lookahead.states_at(depth).clone();
            for member in rest {
                if common.is_empty() {
                    break;
                }
                let states = member.lookahead.states_at(depth);
                common.retain(|s| states.contains(s));
            }
            if !common.is_empty() {
                let agents = members.iter().map(|m| m.agent).collect();
                return Some(PotentialCollisionData::new(agents, common, depth));
            }

            let moves = members.iter().map(|m| m.lookahead.moves_at(depth));
            let min = moves.clone().min().unwrap_or(0);
            let max = moves.max().unwrap_or(0);
            if min > threshold || max > 2 * threshold {
                break;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::coordination::agent::AgentConfig;
    use crate::coordination::dominance::ClosestToGoal;
    use crate::coordination::expansion::ExpansionConfig;
    use crate::env::{BeaconGrid, GridParams, Pomdp};
    use crate::infra::Position;
    use crate::planners::{Policy, QmdpPlanner};
    use crate::state::{BeliefState, GridMap};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn lookahead(map: &Arc<GridMap>, start: Position, goal: Position) -> Lookahead {
        let params = GridParams {
            slip: 0.0,
            ..GridParams::default()
        };
        let env = BeaconGrid::new(map.clone(), Vec::new(), start, goal, params).unwrap();
        let (policy, _) = QmdpPlanner::default().solve(&env, &vec![false; env.state_count()]).unwrap();
        let belief = BeliefState::initial(&env, None).unwrap();
        Lookahead::compute(&env, &policy as &dyn Policy, &belief, 4, &ExpansionConfig::default())
    }

    fn participants(lookaheads: &[Lookahead]) -> Vec<Participant<'_>> {
        lookaheads
            .iter()
            .enumerate()
            .map(|(agent, lookahead)| Participant {
                agent,
                lookahead,
                distance_threshold: 2,
            })
            .collect()
    }

    #[test]
    fn test_crossing_paths_detected() {
        let map = Arc::new(GridMap::open(5, 5));
        let lookaheads = vec![
            lookahead(&map, Position::new(0, 2), Position::new(4, 2)),
            lookahead(&map, Position::new(2, 0), Position::new(2, 4)),
        ];
        for mode in [DetectionMode::Pairwise, DetectionMode::Subsets] {
            let detector = CollisionDetector::new(mode, SubsetOrder::default());
            let collision = detector.detect(&participants(&lookaheads));
            assert_eq!(collision.members(), &[0, 1]);
            assert_eq!(collision.step(), 2);
            let centre = map.cell_index(&Position::new(2, 2)).unwrap();
            assert_eq!(collision.states(), &BTreeSet::from([centre]));
        }
    }

    #[test]
    fn test_skipped_groups_not_reported() {
        let map = Arc::new(GridMap::open(5, 5));
        let lookaheads = vec![
            lookahead(&map, Position::new(0, 2), Position::new(4, 2)),
            lookahead(&map, Position::new(2, 0), Position::new(2, 4)),
            lookahead(&map, Position::new(4, 2), Position::new(0, 2)),
        ];
        let detector = CollisionDetector::new(DetectionMode::Subsets, SubsetOrder::LargestFirst);
        let parts = participants(&lookaheads);
        let collision = detector.detect_skipping(&parts, |agents| agents == [0, 1, 2]);
        assert_eq!(collision.members(), &[0, 1]);

        let collision = detector.detect_skipping(&parts, |agents| agents.len() == 3 || agents.contains(&0));
        assert_eq!(collision.members(), &[1, 2]);
        assert!(detector.detect_skipping(&parts, |_| true).is_empty());
    }

    #[test]
    fn test_disjoint_supports_never_collide() {
        let map = Arc::new(GridMap::open(5, 5));
        let lookaheads = vec![
            lookahead(&map, Position::new(0, 0), Position::new(4, 0)),
            lookahead(&map, Position::new(0, 4), Position::new(4, 4)),
            lookahead(&map, Position::new(0, 2), Position::new(4, 2)),
        ];
        let detector = CollisionDetector::default();
        assert!(detector.detect(&participants(&lookaheads)).is_empty());
    }

    #[test]
    fn test_subset_finds_three_way_overlap_first() {
        let map = Arc::new(GridMap::open(5, 5));
        // all three converge on the centre at step 2
        let lookaheads = vec![
            lookahead(&map, Position::new(0, 2), Position::new(4, 2)),
            lookahead(&map, Position::new(2, 0), Position::new(2, 4)),
            lookahead(&map, Position::new(4, 2), Position::new(0, 2)),
        ];
        let detector = CollisionDetector::new(DetectionMode::Subsets, SubsetOrder::LargestFirst);
        let collision = detector.detect(&participants(&lookaheads));
        assert_eq!(collision.members(), &[0, 1, 2]);

        let detector = CollisionDetector::new(DetectionMode::Subsets, SubsetOrder::SmallestFirst);
        assert_eq!(detector.detect(&participants(&lookaheads)).members().len(), 2);
    }

    #[test]
    fn test_far_overlap_beyond_threshold_ignored() {
        let map = Arc::new(GridMap::open(9, 1));
        // paths only meet after both have moved more than the threshold
        let lookaheads = vec![
            lookahead(&map, Position::new(0, 0), Position::new(8, 0)),
            lookahead(&map, Position::new(8, 0), Position::new(0, 0)),
        ];
        let detector = CollisionDetector::default();
        let parts: Vec<Participant<'_>> = lookaheads
            .iter()
            .enumerate()
            .map(|(agent, lookahead)| Participant {
                agent,
                lookahead,
                distance_threshold: 1,
            })
            .collect();
        assert!(detector.detect(&parts).is_empty());
    }

    #[test]
    fn test_cursor_yields_least_dominant_first() {
        let mut rng = StdRng::seed_from_u64(9);
        let map = Arc::new(GridMap::open(5, 5));
        let params = GridParams::default();
        let starts = [Position::new(0, 0), Position::new(3, 4), Position::new(1, 4)];
        let agents: Vec<Agent> = starts
            .iter()
            .enumerate()
            .map(|(i, &start)| {
                let model = BeaconGrid::new(map.clone(), Vec::new(), start, Position::new(4, 4), params.clone()).unwrap();
                Agent::new(i, 'a', Arc::new(model), AgentConfig::default(), None, &mut rng).unwrap()
            })
            .collect();

        let mut collision = PotentialCollisionData::new(vec![2, 0, 1], BTreeSet::from([5]), 1);
        collision.order_by(&agents, &ClosestToGoal);
        assert_eq!(collision.members(), &[1, 2, 0]);
        assert!(collision.has_next_non_dominant());
        assert_eq!(collision.next_non_dominant(), Some(0));
        assert_eq!(collision.next_non_dominant(), Some(2));
        assert!(!collision.has_next_non_dominant());
        assert_eq!(collision.next_non_dominant(), None);
        collision.reset();
        assert_eq!(collision.next_non_dominant(), Some(0));

        // the least dominant member is pinned, so the middle one yields
        collision.promote(&[0]);
        assert_eq!(collision.members(), &[0, 1, 2]);
        assert_eq!(collision.next_non_dominant(), Some(2));
        assert_eq!(collision.next_non_dominant(), Some(1));
        assert_eq!(collision.next_non_dominant(), None);
    }
}
