/// Order in which agent subsets are visited by the collision detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubsetOrder {
    /// All `n` agents first, pairs last.
    #[default]
    LargestFirst,
    /// Pairs first.
    SmallestFirst,
}

impl SubsetOrder {
    /// Subset sizes to visit for `n` agents. Sizes below 2 are never produced.
    pub fn sizes(&self, n: usize) -> Vec<usize> {
        if n < 2 {
            return Vec::new();
        }
        match self {
            SubsetOrder::LargestFirst => (2..=n).rev().collect(),
            SubsetOrder::SmallestFirst => (2..=n).collect(),
        }
    }
}

/// Lexicographic k-combinations of `0..n`, produced iteratively from an
/// index array.
#[derive(Debug, Clone)]
pub struct Combinations {
    n: usize,
    indices: Vec<usize>,
    first: bool,
    exhausted: bool,
}

impl Combinations {
    pub fn new(n: usize, k: usize) -> Self {
        Self {
            n,
            indices: (0..k).collect(),
            first: true,
            exhausted: k > n,
        }
    }

    fn advance(&mut self) -> bool {
        let k = self.indices.len();
        // rightmost index that can still move
        let mut i = k;
        while i > 0 {
            i -= 1;
            if self.indices[i] < self.n - k + i {
                self.indices[i] += 1;
                for j in i + 1..k {
                    self.indices[j] = self.indices[j - 1] + 1;
                }
                return true;
            }
        }
        false
    }
}

impl Iterator for Combinations {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        if self.first {
            self.first = false;
        } else if !self.advance() {
            self.exhausted = true;
            return None;
        }
        Some(self.indices.clone())
    }
}

/// Every subset of `0..n` with at least two members, in the given order.
pub fn subsets(n: usize, order: SubsetOrder) -> impl Iterator<Item = Vec<usize>> {
    order
        .sizes(n)
        .into_iter()
        .flat_map(move |k| Combinations::new(n, k))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combinations_count() {
        assert_eq!(Combinations::new(5, 2).count(), 10);
        assert_eq!(Combinations::new(5, 3).count(), 10);
        assert_eq!(Combinations::new(4, 4).count(), 1);
        assert_eq!(Combinations::new(3, 4).count(), 0);
    }

    #[test]
    fn test_combinations_lexicographic() {
        let all: Vec<Vec<usize>> = Combinations::new(4, 2).collect();
        assert_eq!(
            all,
            vec![
                vec![0, 1],
                vec![0, 2],
                vec![0, 3],
                vec![1, 2],
                vec![1, 3],
                vec![2, 3]
            ]
        );
    }

    #[test]
    fn test_subsets_largest_first() {
        let all: Vec<Vec<usize>> = subsets(3, SubsetOrder::LargestFirst).collect();
        assert_eq!(all[0], vec![0, 1, 2]);
        assert_eq!(all.len(), 4);
        assert!(all[1..].iter().all(|s| s.len() == 2));

        let small: Vec<Vec<usize>> = subsets(3, SubsetOrder::SmallestFirst).collect();
        assert_eq!(small.last().unwrap(), &vec![0, 1, 2]);
    }

    #[test]
    fn test_subsets_single_agent() {
        assert_eq!(subsets(1, SubsetOrder::LargestFirst).count(), 0);
    }
}
