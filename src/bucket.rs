//! Ordered start-key index.

/// Maps `i64` start keys onto buckets: [`BucketMapper::get`] returns the
/// bucket whose start is the greatest start less than or equal to the key.
/// Built once at startup, then shared read-only across workers.
pub struct BucketMapper<T> {
    buckets: Vec<(i64, T)>,
}

impl<T> BucketMapper<T> {
    pub fn new(entries: impl IntoIterator<Item = (i64, T)>) -> Self {
        let mut buckets: Vec<(i64, T)> = entries.into_iter().collect();
        buckets.sort_by_key(|(start, _)| *start);
        Self { buckets }
    }

    pub fn get(&self, key: i64) -> Option<&T> {
        self.position(key).map(|index| &self.buckets[index].1)
    }

    /// Index of the bucket whose start is the greatest start ≤ `key`.
    pub fn position(&self, key: i64) -> Option<usize> {
        match self.buckets.partition_point(|(start, _)| *start <= key) {
            0 => None,
            index => Some(index - 1),
        }
    }

    pub fn bucket(&self, index: usize) -> Option<&(i64, T)> {
        self.buckets.get(index)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_returns_greatest_start_not_exceeding_the_key() {
        let mapper = BucketMapper::new([(200, "b"), (100, "a"), (300, "c")]);
        assert_eq!(mapper.get(99), None);
        assert_eq!(mapper.get(100), Some(&"a"));
        assert_eq!(mapper.get(150), Some(&"a"));
        assert_eq!(mapper.get(200), Some(&"b"));
        assert_eq!(mapper.get(1000), Some(&"c"));
    }

    #[test]
    fn empty_mapper_finds_nothing() {
        let mapper = BucketMapper::<()>::new([]);
        assert_eq!(mapper.get(0), None);
    }
}
