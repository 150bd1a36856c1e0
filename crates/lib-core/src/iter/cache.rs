use knotd_store::LocalId;

/// Geometric growth ceiling; past it the buffer grows in flat chunks.
const GROWTH_CEILING: usize = 64 * 1024;

/// Shared memo buffer: the confirmed prefix of some iterator's output,
/// with the cumulative cost of producing it. An `and` iterator and its
/// clones hang off one cache so statistics sampling is paid for once.
///
/// Two caches are equivalent iff both have reached EOF with the same id
/// sequence; a still-growing cache is equivalent only to itself.
#[derive(Debug, Default)]
pub struct IterCache {
    ids: Vec<LocalId>,
    eof: bool,
    cost: u64,
    sorted: bool,
    uses: u64,
}

impl IterCache {
    pub fn new() -> IterCache {
        IterCache {
            sorted: true,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn cost(&self) -> u64 {
        self.cost
    }

    pub fn note_use(&mut self) {
        self.uses += 1;
    }

    pub fn uses(&self) -> u64 {
        self.uses
    }

    pub fn last(&self) -> Option<LocalId> {
        self.ids.last().copied()
    }

    fn reserve_one(&mut self) {
        if self.ids.len() < self.ids.capacity() {
            return;
        }
        let grown = match self.ids.capacity() {
            0 => 8,
            cap if cap < GROWTH_CEILING => cap * 2,
            cap => cap + GROWTH_CEILING,
        };
        self.ids.reserve_exact(grown - self.ids.len());
    }

    /// Append an id and account its production cost. Re-adding the
    /// most-recent id is a no-op (resumed producers re-deliver it).
    pub fn add(&mut self, id: LocalId, cost: u64) {
        if self.eof {
            return;
        }
        if self.ids.last() == Some(&id) {
            return;
        }
        if self.ids.last().is_some_and(|&prev| prev > id) {
            self.sorted = false;
        }
        self.reserve_one();
        self.ids.push(id);
        self.cost += cost;
    }

    pub fn set_eof(&mut self) {
        self.eof = true;
    }

    /// Offset and value of the first id `>= id`. Binary search when the
    /// contents are sorted, linear otherwise.
    pub fn search(&self, id: LocalId) -> Option<(usize, LocalId)> {
        if self.sorted {
            let off = self.ids.partition_point(|&have| have < id);
            self.ids.get(off).map(|&found| (off, found))
        } else {
            self.ids
                .iter()
                .enumerate()
                .filter(|&(_, &have)| have >= id)
                .min_by_key(|&(_, &have)| have)
                .map(|(off, &found)| (off, found))
        }
    }

    /// `Some(true)` if present, `Some(false)` if provably absent (EOF
    /// reached), `None` while the answer is still unknown.
    pub fn check(&self, id: LocalId) -> Option<bool> {
        let present = if self.sorted {
            self.ids.binary_search(&id).is_ok()
        } else {
            self.ids.contains(&id)
        };
        match (present, self.eof) {
            (true, _) => Some(true),
            (false, true) => Some(false),
            (false, false) => None,
        }
    }

    pub fn index(&self, off: usize) -> Option<LocalId> {
        self.ids.get(off).copied()
    }

    pub fn freeze(&self, out: &mut String) {
        use std::fmt::Write;
        for (i, id) in self.ids.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            let _ = write!(out, "{id}");
        }
        if self.eof {
            out.push('$');
        }
    }

    pub fn thaw(text: &str) -> Option<IterCache> {
        let mut cache = IterCache::new();
        let (body, eof) = match text.strip_suffix('$') {
            Some(body) => (body, true),
            None => (text, false),
        };
        if !body.is_empty() {
            for part in body.split(',') {
                let id: u64 = part.parse().ok()?;
                cache.add(LocalId::new(id), 0);
            }
        }
        if eof {
            cache.set_eof();
        }
        Some(cache)
    }

    /// Merge a stored cache into this one, keeping whichever knows more.
    pub fn rethaw(&mut self, stored: IterCache) {
        let stored_knows_more =
            (stored.eof && !self.eof) || (stored.eof == self.eof && stored.len() > self.len());
        if stored_knows_more {
            *self = stored;
        }
    }
}

impl PartialEq for IterCache {
    fn eq(&self, other: &Self) -> bool {
        self.eof && other.eof && self.ids == other.ids
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn id(raw: u64) -> LocalId {
        LocalId::new(raw)
    }

    #[test]
    fn add_is_idempotent_on_last() {
        let mut cache = IterCache::new();
        cache.add(id(3), 5);
        cache.add(id(3), 5);
        cache.add(id(7), 5);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.cost(), 10);
    }

    #[test]
    fn search_finds_lower_bound() {
        let mut cache = IterCache::new();
        for raw in [2, 4, 8] {
            cache.add(id(raw), 1);
        }
        assert_eq!(cache.search(id(1)), Some((0, id(2))));
        assert_eq!(cache.search(id(4)), Some((1, id(4))));
        assert_eq!(cache.search(id(5)), Some((2, id(8))));
        assert_eq!(cache.search(id(9)), None);
        // The last-added id is found at offset n-1.
        assert_eq!(cache.search(id(8)), Some((cache.len() - 1, id(8))));
    }

    #[test]
    fn unsorted_search_still_answers() {
        let mut cache = IterCache::new();
        for raw in [8, 2, 4] {
            cache.add(id(raw), 1);
        }
        assert_eq!(cache.search(id(3)), Some((2, id(4))));
        assert_eq!(cache.check(id(2)), None);
        cache.set_eof();
        assert_eq!(cache.check(id(2)), Some(true));
        assert_eq!(cache.check(id(3)), Some(false));
    }

    #[test]
    fn check_distinguishes_unknown_from_absent() {
        let mut cache = IterCache::new();
        cache.add(id(2), 1);
        assert_eq!(cache.check(id(2)), Some(true));
        assert_eq!(cache.check(id(5)), None);
        cache.set_eof();
        assert_eq!(cache.check(id(5)), Some(false));
    }

    #[test]
    fn equivalence_requires_eof() {
        let mut a = IterCache::new();
        let mut b = IterCache::new();
        a.add(id(1), 0);
        b.add(id(1), 0);
        assert_ne!(a, b);
        a.set_eof();
        b.set_eof();
        assert_eq!(a, b);
        b.add(id(2), 0); // ignored after eof
        assert_eq!(a, b);
    }

    #[test]
    fn freeze_thaw_round_trip() {
        let mut cache = IterCache::new();
        for raw in [1, 5, 9] {
            cache.add(id(raw), 2);
        }
        cache.set_eof();
        let mut text = String::new();
        cache.freeze(&mut text);
        assert_eq!(text, "1,5,9$");
        let thawed = IterCache::thaw(&text).unwrap();
        assert_eq!(thawed, cache);
    }

    #[test]
    fn rethaw_prefers_the_bigger_half() {
        let mut live = IterCache::new();
        live.add(id(1), 0);
        let mut stored = IterCache::new();
        stored.add(id(1), 0);
        stored.add(id(2), 0);
        stored.set_eof();
        live.rethaw(stored);
        assert!(live.is_eof());
        assert_eq!(live.len(), 2);

        let mut shorter = IterCache::new();
        shorter.add(id(1), 0);
        live.rethaw(shorter);
        assert_eq!(live.len(), 2);
    }
}
