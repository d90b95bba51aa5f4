/// Mixed-radix number system used to pack per-member indices into a single
/// joint index. Digit 0 is the least significant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixedRadix {
    radices: Vec<usize>,
}

impl MixedRadix {
    pub fn new(radices: Vec<usize>) -> Self {
        Self { radices }
    }

    pub fn uniform(radix: usize, digits: usize) -> Self {
        Self::new(vec![radix; digits])
    }

    pub fn digits(&self) -> usize {
        self.radices.len()
    }

    pub fn radices(&self) -> &[usize] {
        &self.radices
    }

    /// Number of distinct encodings, `None` if it does not fit in a `usize`.
    pub fn capacity(&self) -> Option<usize> {
        self.radices
            .iter()
            .try_fold(1usize, |acc, &radix| acc.checked_mul(radix))
    }

    pub fn encode(&self, digits: &[usize]) -> usize {
        debug_assert_eq!(digits.len(), self.radices.len());
        let mut index = 0;
        for (digit, radix) in digits.iter().zip(&self.radices).rev() {
            debug_assert!(digit < radix, "digit {} out of radix {}", digit, radix);
            index = index * radix + digit;
        }
        index
    }

    pub fn decode(&self, mut index: usize) -> Vec<usize> {
        let mut digits = Vec::with_capacity(self.radices.len());
        for &radix in &self.radices {
            digits.push(index % radix);
            index /= radix;
        }
        digits
    }
}
