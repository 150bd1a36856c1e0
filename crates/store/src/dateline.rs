use std::fmt;
use std::str::FromStr;

use knotd_helpers::IndexMap;

use crate::guid::LocalId;

/// A point in append history: for each instance that has contributed
/// primitives, the highest local id present. Requests carry datelines to
/// pin reads to a snapshot and to tell clients how far a write advanced.
///
/// Text form: `instance.id` terms joined by commas, e.g. `7f.120,80.3`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dateline {
    entries: IndexMap<u32, LocalId>,
}

impl Dateline {
    pub fn new() -> Dateline {
        Dateline::default()
    }

    pub fn single(instance: u32, max: LocalId) -> Dateline {
        let mut dl = Dateline::new();
        dl.set(instance, max);
        dl
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, instance: u32) -> Option<LocalId> {
        self.entries.get(&instance).copied()
    }

    pub fn set(&mut self, instance: u32, max: LocalId) {
        self.entries.insert(instance, max);
    }

    /// Raise each entry to at least the other dateline's value.
    pub fn merge_max(&mut self, other: &Dateline) {
        for (&instance, &max) in &other.entries {
            let slot = self.entries.entry(instance).or_insert(LocalId::ZERO);
            if *slot < max {
                *slot = max;
            }
        }
    }

    /// Lower entries so none exceeds the cap's value for its instance.
    /// Instances the cap does not mention are left alone.
    pub fn cap_to(&mut self, cap: &Dateline) {
        for (instance, max) in self.entries.iter_mut() {
            if let Some(lid) = cap.get(*instance)
                && lid < *max
            {
                *max = lid;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, LocalId)> + '_ {
        self.entries.iter().map(|(&i, &m)| (i, m))
    }
}

impl fmt::Display for Dateline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (&instance, &max) in &self.entries {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{:x}.{}", instance, max.raw())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatelineParseError;

impl fmt::Display for DatelineParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dateline terms must look like `instance.id`")
    }
}

impl std::error::Error for DatelineParseError {}

impl FromStr for Dateline {
    type Err = DatelineParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut dl = Dateline::new();
        if s.is_empty() {
            return Ok(dl);
        }
        for term in s.split(',') {
            let (instance, id) = term.split_once('.').ok_or(DatelineParseError)?;
            let instance = u32::from_str_radix(instance, 16).map_err(|_| DatelineParseError)?;
            let id: u64 = id.parse().map_err(|_| DatelineParseError)?;
            dl.set(instance, LocalId::new(id));
        }
        Ok(dl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_round_trip() {
        let mut dl = Dateline::new();
        dl.set(0x7f, LocalId::new(120));
        dl.set(0x80, LocalId::new(3));
        let text = dl.to_string();
        assert_eq!(text, "7f.120,80.3");
        assert_eq!(text.parse::<Dateline>().unwrap(), dl);
        assert_eq!("".parse::<Dateline>().unwrap(), Dateline::new());
        assert!("7f".parse::<Dateline>().is_err());
    }

    #[test]
    fn merge_and_cap() {
        let mut a = Dateline::single(1, LocalId::new(10));
        a.merge_max(&Dateline::single(1, LocalId::new(20)));
        a.merge_max(&Dateline::single(2, LocalId::new(5)));
        assert_eq!(a.get(1), Some(LocalId::new(20)));
        assert_eq!(a.get(2), Some(LocalId::new(5)));

        a.cap_to(&Dateline::single(1, LocalId::new(15)));
        assert_eq!(a.get(1), Some(LocalId::new(15)));
        assert_eq!(a.get(2), Some(LocalId::new(5)));
    }
}
