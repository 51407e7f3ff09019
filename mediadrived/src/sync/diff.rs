use std::collections::HashSet;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheDiff {
    /// Remote ids missing from the cache, in remote listing order.
    pub added: Vec<String>,
    /// Cached ids missing from the remote listing, sorted.
    pub removed: Vec<String>,
}

impl CacheDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub fn diff<'a, I>(remote: I, cached: &HashSet<String>) -> CacheDiff
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    let mut added = Vec::new();
    for id in remote {
        if !seen.insert(id) {
            continue;
        }
        if !cached.contains(id) {
            added.push(id.to_string());
        }
    }

    let mut removed: Vec<String> = cached
        .iter()
        .filter(|id| !seen.contains(id.as_str()))
        .cloned()
        .collect();
    removed.sort();

    CacheDiff { added, removed }
}
