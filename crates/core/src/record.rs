//! Stored records and the engine-owned operation flags attached to them.

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use smallvec::SmallVec;

/// Operation flag set while a request touching the record is in flight.
/// Never sent to the backing service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OpFlag {
    Updating,
    Deleting,
    /// Kind-specific sub-resource fetch, e.g. `Aux("logs")`.
    Aux(&'static str),
}

impl fmt::Display for OpFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpFlag::Updating => f.write_str("updating"),
            OpFlag::Deleting => f.write_str("deleting"),
            OpFlag::Aux(topic) => write!(f, "fetching_{}", topic),
        }
    }
}

/// Small set of independent flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OpFlags(SmallVec<[OpFlag; 2]>);

impl OpFlags {
    /// Returns true if the flag was not already set.
    pub fn set(&mut self, flag: OpFlag) -> bool {
        if self.contains(flag) { return false; }
        self.0.push(flag);
        true
    }

    /// Returns true if the flag was set.
    pub fn clear(&mut self, flag: OpFlag) -> bool {
        let before = self.0.len();
        self.0.retain(|f| *f != flag);
        before != self.0.len()
    }

    pub fn contains(&self, flag: OpFlag) -> bool { self.0.contains(&flag) }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = OpFlag> + '_ { self.0.iter().copied() }
}

/// A transformed payload plus the flags and auxiliary payloads the engine keeps beside it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub data: Value,
    pub flags: OpFlags,
    /// Last auxiliary payload per topic (e.g. machine logs).
    pub extras: SmallVec<[(&'static str, Value); 1]>,
}

impl Record {
    pub fn new(data: Value) -> Self { Self { data, flags: OpFlags::default(), extras: SmallVec::new() } }

    pub fn updating(&self) -> bool { self.flags.contains(OpFlag::Updating) }
    pub fn deleting(&self) -> bool { self.flags.contains(OpFlag::Deleting) }

    pub fn extra(&self, topic: &str) -> Option<&Value> {
        self.extras.iter().find(|(t, _)| *t == topic).map(|(_, v)| v)
    }

    pub fn set_extra(&mut self, topic: &'static str, value: Value) {
        match self.extras.iter_mut().find(|(t, _)| *t == topic) {
            Some(slot) => slot.1 = value,
            None => self.extras.push((topic, value)),
        }
    }

    /// Swap in fresh data fields, keeping flags and extras.
    pub fn carry_over(prev: Option<Record>, data: Value) -> Record {
        match prev {
            Some(mut r) => { r.data = data; r }
            None => Record::new(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flags_are_independent() {
        let mut f = OpFlags::default();
        assert!(f.set(OpFlag::Updating));
        assert!(!f.set(OpFlag::Updating));
        assert!(f.set(OpFlag::Aux("logs")));
        assert!(f.contains(OpFlag::Updating) && f.contains(OpFlag::Aux("logs")));
        assert!(f.clear(OpFlag::Updating));
        assert!(!f.clear(OpFlag::Updating));
        assert!(f.contains(OpFlag::Aux("logs")));
    }

    #[test]
    fn aux_flag_display_names_the_topic() {
        assert_eq!(OpFlag::Aux("logs").to_string(), "fetching_logs");
        assert_eq!(OpFlag::Deleting.to_string(), "deleting");
    }

    #[test]
    fn carry_over_keeps_flags_and_extras() {
        let mut r = Record::new(json!({"id": "a", "v": 1}));
        r.flags.set(OpFlag::Updating);
        r.set_extra("logs", json!(["boot"]));
        let next = Record::carry_over(Some(r), json!({"id": "a", "v": 2}));
        assert!(next.updating());
        assert_eq!(next.data["v"], 2);
        assert_eq!(next.extra("logs"), Some(&json!(["boot"])));
    }
}
