use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::infra::Position;
use crate::state::GridMap;

#[derive(Clone, Eq, PartialEq)]
struct Node {
    pos: Position,
    f_score: i32,
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .f_score
            .cmp(&self.f_score)
            .then_with(|| other.pos.cmp(&self.pos))
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct AStar;

impl AStar {
    /// Shortest 4-connected path over the free cells of `map`, including both
    /// endpoints. `is_walkable` can veto cells (the goal is always allowed).
    pub fn find_path<F>(
        map: &GridMap,
        start: Position,
        goal: Position,
        is_walkable: F,
    ) -> Option<Vec<Position>>
    where
        F: Fn(&Position) -> bool,
    {
        if start == goal {
            return Some(vec![goal]);
        }

        let mut open_set = BinaryHeap::new();
        let mut came_from: HashMap<Position, Position> = HashMap::new();
        let mut g_score: HashMap<Position, i32> = HashMap::new();
        let mut closed_set: HashSet<Position> = HashSet::new();

        g_score.insert(start, 0);
        open_set.push(Node {
            pos: start,
            f_score: heuristic(start, goal),
        });

        const MAX_EXPANSIONS: usize = 5000;
        let mut expansions = 0;

        while let Some(Node { pos: current, .. }) = open_set.pop() {
            if current == goal {
                return Some(reconstruct_path(&came_from, current));
            }

            if !closed_set.insert(current) {
                continue;
            }

            expansions += 1;
            if expansions > MAX_EXPANSIONS {
                tracing::warn!(
                    "A*: exceeded MAX_EXPANSIONS ({}) from {} to {}",
                    MAX_EXPANSIONS,
                    start,
                    goal
                );
                return None;
            }

            let current_g_score = *g_score.get(&current).unwrap_or(&0);

            for neighbor in current.neighbors() {
                if closed_set.contains(&neighbor) || !map.is_free(&neighbor) {
                    continue;
                }
                if neighbor != goal && !is_walkable(&neighbor) {
                    continue;
                }

                let tentative_g = current_g_score + 1;
                if tentative_g < *g_score.get(&neighbor).unwrap_or(&i32::MAX) {
                    came_from.insert(neighbor, current);
                    g_score.insert(neighbor, tentative_g);
                    open_set.push(Node {
                        pos: neighbor,
                        f_score: tentative_g + heuristic(neighbor, goal),
                    });
                }
            }
        }

        None
    }

    /// Number of moves on the shortest path, ignoring other agents.
    pub fn distance(map: &GridMap, start: Position, goal: Position) -> Option<i32> {
        Self::find_path(map, start, goal, |_| true).map(|path| path.len() as i32 - 1)
    }
}

fn heuristic(a: Position, b: Position) -> i32 {
    a.distance(&b)
}

fn reconstruct_path(
    came_from: &HashMap<Position, Position>,
    mut current: Position,
) -> Vec<Position> {
    let mut path = vec![current];
    while let Some(&prev) = came_from.get(&current) {
        path.push(prev);
        current = prev;
    }
    path.reverse();
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_astar_open_grid_distance() {
        let map = GridMap::open(5, 5);
        assert_eq!(
            AStar::distance(&map, Position::new(0, 2), Position::new(4, 2)),
            Some(4)
        );
        assert_eq!(
            AStar::distance(&map, Position::new(1, 1), Position::new(1, 1)),
            Some(0)
        );
    }

    #[test]
    fn test_astar_detours_around_wall() {
        let mut holes = Vec::new();
        for y in 0..4 {
            holes.push(Position::new(2, y));
        }
        let map = GridMap::new(5, 5, holes);
        let path = AStar::find_path(&map, Position::new(0, 0), Position::new(4, 0), |_| true)
            .expect("path around the wall");
        assert_eq!(path.len() - 1, 12);
        assert!(path.iter().all(|p| map.is_free(p)));
    }

    #[test]
    fn test_astar_unreachable() {
        let holes = (0..5).map(|y| Position::new(2, y));
        let map = GridMap::new(5, 5, holes);
        assert_eq!(
            AStar::distance(&map, Position::new(0, 0), Position::new(4, 0)),
            None
        );
    }
}
