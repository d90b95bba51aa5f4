use std::collections::HashMap;

use crate::infra::{Bounds, Position};

/// Static layout shared by every agent: a `width` x `height` rectangle with
/// holes. Free cells are numbered in row-major order; that number is the
/// cell's state index in a single-agent model.
#[derive(Clone, Debug)]
pub struct GridMap {
    pub width: i32,
    pub height: i32,
    cells: Vec<Position>,
    index: HashMap<Position, usize>,
}

impl GridMap {
    pub fn new(width: i32, height: i32, holes: impl IntoIterator<Item = Position>) -> Self {
        let holes: Vec<Position> = holes.into_iter().collect();
        let cells: Vec<Position> = Bounds::new(0, width - 1, 0, height - 1)
            .positions()
            .filter(|pos| !holes.contains(pos))
            .collect();
        let index = cells.iter().enumerate().map(|(i, pos)| (*pos, i)).collect();
        Self {
            width,
            height,
            cells,
            index,
        }
    }

    pub fn open(width: i32, height: i32) -> Self {
        Self::new(width, height, std::iter::empty())
    }

    pub fn bounds(&self) -> Bounds {
        Bounds::new(0, self.width - 1, 0, self.height - 1)
    }

    pub fn is_free(&self, pos: &Position) -> bool {
        self.index.contains_key(pos)
    }

    pub fn cell_index(&self, pos: &Position) -> Option<usize> {
        self.index.get(pos).copied()
    }

    pub fn position(&self, cell: usize) -> Option<Position> {
        self.cells.get(cell).copied()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Position)> {
        self.cells.iter().enumerate()
    }

    /// ASCII rendering, `#` for holes and `.` for free cells, with `marks`
    /// drawn on top.
    pub fn draw_ascii(&self, marks: &[(Position, char)]) -> String {
        let mut out = String::new();
        for y in 0..self.height {
            for x in 0..self.width {
                let pos = Position::new(x, y);
                let ch = marks
                    .iter()
                    .rev()
                    .find(|(p, _)| *p == pos)
                    .map(|(_, c)| *c)
                    .unwrap_or(if self.is_free(&pos) { '.' } else { '#' });
                out.push(ch);
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_row_major_numbering() {
        let map = GridMap::new(3, 2, [Position::new(1, 0)]);
        assert_eq!(map.len(), 5);
        assert_eq!(map.cell_index(&Position::new(0, 0)), Some(0));
        assert_eq!(map.cell_index(&Position::new(2, 0)), Some(1));
        assert_eq!(map.cell_index(&Position::new(0, 1)), Some(2));
        assert_eq!(map.cell_index(&Position::new(1, 0)), None);
        assert_eq!(map.position(4), Some(Position::new(2, 1)));
    }

    #[test]
    fn test_map_draw_ascii() {
        let map = GridMap::new(3, 2, [Position::new(1, 0)]);
        let drawn = map.draw_ascii(&[(Position::new(0, 1), 'a')]);
        assert_eq!(drawn, ".#.\na..\n");
    }
}
