//! Fixed-shape value containers with partial availability.
//!
//! A [`Tuple`] holds one slot per mapped column of an entity type. Slots that
//! have not been fetched yet (lazy fields, or columns of a subtype that a
//! polymorphic query did not project) are tracked by a [`FieldMask`] and read
//! back as `None` rather than as NULL.

use crate::value::Value;

/// A growable bitset over column slots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FieldMask {
    words: Vec<u64>,
}

impl FieldMask {
    /// An empty mask.
    pub fn new() -> Self {
        Self::default()
    }

    /// A mask with slots `0..width` set.
    pub fn full(width: usize) -> Self {
        let mut mask = Self::new();
        for i in 0..width {
            mask.set(i);
        }
        mask
    }

    pub fn set(&mut self, index: usize) {
        let word = index / 64;
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (index % 64);
    }

    pub fn clear(&mut self, index: usize) {
        if let Some(word) = self.words.get_mut(index / 64) {
            *word &= !(1u64 << (index % 64));
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .is_some_and(|word| (*word >> (index % 64)) & 1 == 1)
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Set every slot present in `other`.
    pub fn union_with(&mut self, other: &FieldMask) {
        if self.words.len() < other.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (mine, theirs) in self.words.iter_mut().zip(&other.words) {
            *mine |= *theirs;
        }
    }

    /// Iterate set slot indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(w, word)| {
            (0..64usize).filter_map(move |bit| ((*word >> bit) & 1 == 1).then_some(w * 64 + bit))
        })
    }

    /// Drop all bits.
    pub fn reset(&mut self) {
        self.words.clear();
    }
}

/// Column values of one entity (or projection) with availability tracking.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple {
    values: Vec<Value>,
    available: FieldMask,
}

impl Tuple {
    /// A tuple of `width` slots, none available.
    pub fn new(width: usize) -> Self {
        Self {
            values: vec![Value::Null; width],
            available: FieldMask::new(),
        }
    }

    /// A fully available tuple.
    pub fn from_values(values: Vec<Value>) -> Self {
        let available = FieldMask::full(values.len());
        Self { values, available }
    }

    pub fn width(&self) -> usize {
        self.values.len()
    }

    /// Value of a slot, or `None` when the slot has not been fetched.
    pub fn get(&self, index: usize) -> Option<&Value> {
        if self.available.contains(index) {
            self.values.get(index)
        } else {
            None
        }
    }

    pub fn is_available(&self, index: usize) -> bool {
        self.available.contains(index)
    }

    /// Write a slot and mark it available.
    ///
    /// Writes past the end are ignored; callers size tuples from the model.
    pub fn set(&mut self, index: usize, value: Value) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = value;
            self.available.set(index);
        }
    }

    /// Fill only the slots of `other` that are unavailable here.
    ///
    /// Returns how many slots were filled.
    pub fn merge_missing(&mut self, other: &Tuple) -> usize {
        let mut filled = 0;
        for index in other.available.iter() {
            if !self.available.contains(index) {
                if let Some(value) = other.values.get(index) {
                    self.set(index, value.clone());
                    filled += 1;
                }
            }
        }
        filled
    }

    /// Slots that have not been fetched yet.
    pub fn missing(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.values.len()).filter(|i| !self.available.contains(*i))
    }

    pub fn availability(&self) -> &FieldMask {
        &self.available
    }

    /// Raw slot values; unavailable slots read as NULL.
    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_set_clear_iter() {
        let mut mask = FieldMask::new();
        mask.set(3);
        mask.set(70);
        assert!(mask.contains(3));
        assert!(mask.contains(70));
        assert!(!mask.contains(4));
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![3, 70]);
        assert_eq!(mask.count(), 2);

        mask.clear(3);
        assert!(!mask.contains(3));
        assert!(!mask.is_empty());
        mask.reset();
        assert!(mask.is_empty());
    }

    #[test]
    fn mask_union() {
        let mut a = FieldMask::new();
        a.set(1);
        let mut b = FieldMask::new();
        b.set(65);
        a.union_with(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![1, 65]);
    }

    #[test]
    fn unavailable_slots_read_as_none() {
        let mut tuple = Tuple::new(3);
        assert_eq!(tuple.get(0), None);
        tuple.set(0, Value::Int(1));
        tuple.set(2, Value::Null);
        assert_eq!(tuple.get(0), Some(&Value::Int(1)));
        assert_eq!(tuple.get(1), None);
        assert_eq!(tuple.get(2), Some(&Value::Null));
        assert_eq!(tuple.missing().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn merge_missing_never_overwrites() {
        let mut current = Tuple::new(3);
        current.set(0, Value::Int(1));
        current.set(1, Value::Text("edited".into()));

        let fetched = Tuple::from_values(vec![
            Value::Int(1),
            Value::Text("stored".into()),
            Value::Text("lazy body".into()),
        ]);
        assert_eq!(current.merge_missing(&fetched), 1);
        assert_eq!(current.get(1), Some(&Value::Text("edited".into())));
        assert_eq!(current.get(2), Some(&Value::Text("lazy body".into())));
    }
}
