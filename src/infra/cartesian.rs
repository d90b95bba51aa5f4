/// Cartesian product over per-member weighted outcome lists.
///
/// Each item is a fresh tuple of chosen values (one per member) with the
/// product of their weights. Odometer order: member 0 varies fastest.
#[derive(Debug, Clone)]
pub struct CartesianProduct<'a> {
    lists: &'a [Vec<(usize, f64)>],
    cursor: Vec<usize>,
    exhausted: bool,
}

impl<'a> CartesianProduct<'a> {
    pub fn new(lists: &'a [Vec<(usize, f64)>]) -> Self {
        Self {
            lists,
            cursor: vec![0; lists.len()],
            exhausted: lists.is_empty() || lists.iter().any(|l| l.is_empty()),
        }
    }
}

impl Iterator for CartesianProduct<'_> {
    type Item = (Vec<usize>, f64);

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        let mut values = Vec::with_capacity(self.lists.len());
        let mut weight = 1.0;
        for (list, &i) in self.lists.iter().zip(&self.cursor) {
            let (value, w) = list[i];
            values.push(value);
            weight *= w;
        }

        let mut member = 0;
        loop {
            if member == self.cursor.len() {
                self.exhausted = true;
                break;
            }
            self.cursor[member] += 1;
            if self.cursor[member] < self.lists[member].len() {
                break;
            }
            self.cursor[member] = 0;
            member += 1;
        }

        Some((values, weight))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cartesian_product_weights() {
        let lists = vec![vec![(0, 0.5), (1, 0.5)], vec![(7, 0.2), (8, 0.8)]];
        let items: Vec<(Vec<usize>, f64)> = CartesianProduct::new(&lists).collect();
        assert_eq!(items.len(), 4);
        assert_eq!(items[0].0, vec![0, 7]);
        assert_eq!(items[1].0, vec![1, 7]);
        assert_eq!(items[3].0, vec![1, 8]);
        let total: f64 = items.iter().map(|(_, w)| w).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cartesian_product_fresh_tuples() {
        let lists = vec![vec![(1, 1.0), (2, 1.0)]];
        let mut iter = CartesianProduct::new(&lists);
        let first = iter.next().unwrap();
        let second = iter.next().unwrap();
        assert_eq!(first.0, vec![1]);
        assert_eq!(second.0, vec![2]);
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_cartesian_product_empty_member() {
        let lists = vec![vec![(1, 1.0)], vec![]];
        assert_eq!(CartesianProduct::new(&lists).count(), 0);
    }
}
