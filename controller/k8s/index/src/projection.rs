use std::collections::BTreeMap;

/// An object whose identity and content can be compared across passes.
pub trait Projected: Clone {
    /// Uniquely names the object among everything in one projection.
    fn uniq_name(&self) -> String;

    fn same_content(&self, other: &Self) -> bool;
}

/// The set of objects a reconciler wrote on its previous pass.
///
/// Each pass computes the full desired set; diffing it against this baseline
/// yields the writes and deletes that converge the cluster.
#[derive(Clone, Debug)]
pub struct Projection<T> {
    baseline: BTreeMap<String, T>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Diff<T> {
    /// Desired objects identical to the baseline.
    pub unchanged: Vec<T>,
    /// Desired objects that are new or changed.
    pub apply: Vec<T>,
    /// Baseline objects that are no longer desired.
    pub delete: Vec<T>,
}

// === impl Projection ===

impl<T> Default for Projection<T> {
    fn default() -> Self {
        Self {
            baseline: BTreeMap::new(),
        }
    }
}

impl<T: Projected> Projection<T> {
    pub fn diff(&self, desired: impl IntoIterator<Item = T>) -> Diff<T> {
        let desired = desired
            .into_iter()
            .map(|obj| (obj.uniq_name(), obj))
            .collect::<BTreeMap<_, _>>();

        let mut diff = Diff {
            unchanged: Vec::new(),
            apply: Vec::new(),
            delete: Vec::new(),
        };
        for (name, obj) in self.baseline.iter() {
            if !desired.contains_key(name) {
                diff.delete.push(obj.clone());
            }
        }
        for (name, obj) in desired {
            match self.baseline.get(&name) {
                Some(prior) if prior.same_content(&obj) => diff.unchanged.push(obj),
                _ => diff.apply.push(obj),
            }
        }
        diff
    }

    /// Replaces the baseline with the objects known to be in the cluster.
    pub fn commit(&mut self, written: impl IntoIterator<Item = T>) {
        self.baseline = written
            .into_iter()
            .map(|obj| (obj.uniq_name(), obj))
            .collect();
    }

    pub fn get(&self, uniq_name: &str) -> Option<&T> {
        self.baseline.get(uniq_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.baseline.values()
    }

    pub fn len(&self) -> usize {
        self.baseline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baseline.is_empty()
    }
}

impl<T> Diff<T> {
    pub fn is_empty(&self) -> bool {
        self.apply.is_empty() && self.delete.is_empty()
    }
}
