use std::cmp::Ordering;

use super::agent::Agent;

/// What a dominance policy knows about a conflict member.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DominanceKey {
    /// Index of the agent in the coordinated slice.
    pub agent: usize,
    pub distance_to_goal: f64,
    pub escaping: bool,
}

impl DominanceKey {
    pub fn of(index: usize, agent: &Agent) -> Self {
        Self {
            agent: index,
            distance_to_goal: agent.distance_to_goal(),
            escaping: agent.is_escaping(),
        }
    }
}

/// Total order over conflict members. `Ordering::Less` means `a` dominates
/// `b` and keeps its plan; the least dominant member yields first.
pub trait DominancePolicy: Send + Sync {
    fn compare(&self, a: &DominanceKey, b: &DominanceKey) -> Ordering;

    /// Sort most dominant first.
    fn order(&self, keys: &mut [DominanceKey]) {
        keys.sort_by(|a, b| self.compare(a, b));
    }
}

/// Closer to the goal wins. An agent already escaping wins a tie so it is
/// not asked to yield twice, then the lower index wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClosestToGoal;

impl DominancePolicy for ClosestToGoal {
    fn compare(&self, a: &DominanceKey, b: &DominanceKey) -> Ordering {
        a.distance_to_goal
            .total_cmp(&b.distance_to_goal)
            .then(b.escaping.cmp(&a.escaping))
            .then(a.agent.cmp(&b.agent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(agent: usize, distance_to_goal: f64, escaping: bool) -> DominanceKey {
        DominanceKey {
            agent,
            distance_to_goal,
            escaping,
        }
    }

    #[test]
    fn test_closest_to_goal_wins() {
        let mut keys = vec![key(0, 4.0, false), key(1, 2.0, false), key(2, 3.0, false)];
        ClosestToGoal.order(&mut keys);
        let order: Vec<usize> = keys.iter().map(|k| k.agent).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_escaping_agent_wins_tie() {
        let mut keys = vec![key(0, 3.0, false), key(1, 3.0, true)];
        ClosestToGoal.order(&mut keys);
        assert_eq!(keys[0].agent, 1);
    }

    #[test]
    fn test_dominance_is_deterministic() {
        let keys = vec![
            key(3, 2.0, false),
            key(1, 2.0, false),
            key(2, 2.0, false),
            key(0, 5.0, true),
        ];
        let mut forward = keys.clone();
        let mut backward: Vec<DominanceKey> = keys.into_iter().rev().collect();
        ClosestToGoal.order(&mut forward);
        ClosestToGoal.order(&mut backward);
        assert_eq!(forward, backward);
        let order: Vec<usize> = forward.iter().map(|k| k.agent).collect();
        assert_eq!(order, vec![1, 2, 3, 0]);
    }
}
