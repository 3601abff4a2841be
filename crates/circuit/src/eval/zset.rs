use crate::eval::{EvalResult, Value};
use std::{
    collections::{btree_map::Entry, BTreeMap},
    fmt::{self, Display},
};

/// A collection of values with signed weights, entries of indexed
/// collections are `(key, value)` pairs
///
/// Zero-weight entries are never stored so two Z-sets are equal exactly
/// when they agree on every weight
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ZSet {
    entries: BTreeMap<Value, i64>,
}

impl ZSet {
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn weight(&self, value: &Value) -> i64 {
        self.entries.get(value).copied().unwrap_or(0)
    }

    pub fn insert(&mut self, value: Value, weight: i64) {
        if weight == 0 {
            return;
        }

        match self.entries.entry(value) {
            Entry::Vacant(entry) => {
                entry.insert(weight);
            }
            Entry::Occupied(mut entry) => {
                *entry.get_mut() += weight;
                if *entry.get() == 0 {
                    entry.remove();
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, i64)> + '_ {
        self.entries.iter().map(|(value, &weight)| (value, weight))
    }

    pub fn plus(&self, other: &Self) -> Self {
        let mut sum = self.clone();
        sum.add_assign(other);
        sum
    }

    pub fn add_assign(&mut self, other: &Self) {
        for (value, weight) in other.iter() {
            self.insert(value.clone(), weight);
        }
    }

    pub fn negate(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .map(|(value, &weight)| (value.clone(), -weight))
                .collect(),
        }
    }

    pub fn minus(&self, other: &Self) -> Self {
        self.plus(&other.negate())
    }

    /// Every positively weighted entry with a weight of one
    pub fn distinct(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|(_, &weight)| weight > 0)
                .map(|(value, _)| (value.clone(), 1))
                .collect(),
        }
    }

    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&Value) -> bool,
    {
        self.entries.retain(|value, _| keep(value));
    }

    pub fn try_filter<F>(&self, mut keep: F) -> EvalResult<Self>
    where
        F: FnMut(&Value) -> EvalResult<bool>,
    {
        let mut filtered = Self::new();
        for (value, weight) in self.iter() {
            if keep(value)? {
                filtered.insert(value.clone(), weight);
            }
        }
        Ok(filtered)
    }

    pub fn try_map<F>(&self, mut map: F) -> EvalResult<Self>
    where
        F: FnMut(&Value) -> EvalResult<Value>,
    {
        let mut mapped = Self::new();
        for (value, weight) in self.iter() {
            mapped.insert(map(value)?, weight);
        }
        Ok(mapped)
    }

    /// Groups the entries of an indexed collection by key
    pub fn groups(&self) -> BTreeMap<&Value, Vec<(&Value, i64)>> {
        let mut groups: BTreeMap<&Value, Vec<(&Value, i64)>> = BTreeMap::new();
        for (entry, weight) in self.iter() {
            if let Some((key, value)) = entry.as_pair() {
                groups.entry(key).or_default().push((value, weight));
            }
        }
        groups
    }

    /// The entries of an indexed collection with the given key
    pub fn group(&self, key: &Value) -> Vec<(&Value, i64)> {
        self.iter()
            .filter_map(|(entry, weight)| {
                entry
                    .as_pair()
                    .filter(|(entry_key, _)| *entry_key == key)
                    .map(|(_, value)| (value, weight))
            })
            .collect()
    }
}

impl FromIterator<(Value, i64)> for ZSet {
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = (Value, i64)>,
    {
        let mut zset = Self::new();
        for (value, weight) in iter {
            zset.insert(value, weight);
        }
        zset
    }
}

impl Display for ZSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (idx, (value, weight)) in self.iter().enumerate() {
            if idx != 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value} => {weight}")?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::ZSet;
    use crate::eval::Value;

    #[test]
    fn zero_weights_are_dropped() {
        let mut zset = ZSet::new();
        zset.insert(Value::Int(1), 2);
        zset.insert(Value::Int(1), -2);
        assert!(zset.is_empty());
        assert_eq!(zset, ZSet::new());
    }

    #[test]
    fn grouping() {
        let zset: ZSet = [
            (Value::pair(Value::Int(1), Value::Int(10)), 1),
            (Value::pair(Value::Int(1), Value::Int(11)), 2),
            (Value::pair(Value::Int(2), Value::Int(20)), -1),
        ]
        .into_iter()
        .collect();

        let groups = zset.groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&Value::Int(1)].len(), 2);
        assert_eq!(zset.group(&Value::Int(2)), vec![(&Value::Int(20), -1)]);
        assert_eq!(zset.distinct().len(), 2);
    }
}
