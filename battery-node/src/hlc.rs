//! Hybrid logical clock.
//!
//! Timestamps combine wall-clock milliseconds with a logical counter and the
//! node id as the final tiebreaker. `(ts, counter, node_id)` forms a total
//! order, and the serialized form is built so plain string comparison agrees
//! with it: base36 with fixed-width zero padding.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Width of the base36 milliseconds field in the string form.
const TS_WIDTH: usize = 11;
/// Width of the base36 counter field in the string form.
const COUNTER_WIDTH: usize = 5;

/// One clock reading, carried inside every replicated operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hlc {
    /// Wall-clock milliseconds at generation time.
    pub ts: u64,
    /// Logical counter disambiguating readings within one millisecond.
    pub counter: u32,
    /// Stable id of the generating node; final comparison tiebreaker.
    #[serde(rename = "nodeId")]
    pub node_id: String,
}

impl Ord for Hlc {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ts
            .cmp(&other.ts)
            .then_with(|| self.counter.cmp(&other.counter))
            .then_with(|| self.node_id.cmp(&other.node_id))
    }
}

impl PartialOrd for Hlc {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Hlc {
    /// `base36(ts) '-' base36(counter) '-' node_id`, zero padded so that
    /// lexicographic order over the strings equals [`Ord`] over the values.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{ts:0>tw$}-{counter:0>cw$}-{node}",
            ts = base36(self.ts),
            tw = TS_WIDTH,
            counter = base36(u64::from(self.counter)),
            cw = COUNTER_WIDTH,
            node = self.node_id
        )
    }
}

impl Hlc {
    /// Parse the string form produced by [`fmt::Display`].
    ///
    /// The node id may itself contain `-`; everything after the second
    /// separator belongs to it.
    pub fn parse(s: &str) -> Result<Hlc> {
        let bad = || Error::MalformedTimestamp(s.to_owned());
        let (ts_part, rest) = s.split_once('-').ok_or_else(bad)?;
        let (counter_part, node_id) = rest.split_once('-').ok_or_else(bad)?;
        if node_id.is_empty() {
            return Err(bad());
        }
        let ts = u64::from_str_radix(ts_part, 36).map_err(|_| bad())?;
        let counter = u32::from_str_radix(counter_part, 36).map_err(|_| bad())?;
        Ok(Hlc {
            ts,
            counter,
            node_id: node_id.to_owned(),
        })
    }
}

fn base36(mut v: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if v == 0 {
        return "0".to_owned();
    }
    let mut out = Vec::new();
    while v > 0 {
        out.push(DIGITS[(v % 36) as usize]);
        v /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}

/// The node's clock. One instance per node, advanced on every local
/// mutation and on every observed remote timestamp.
#[derive(Debug)]
pub struct HlcClock {
    node_id: String,
    ts: u64,
    counter: u32,
}

impl HlcClock {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ts: 0,
            counter: 0,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// A fresh reading for a local event. Strictly greater than every
    /// earlier reading from this clock; wall-clock regressions are absorbed
    /// by the counter.
    pub fn now(&mut self) -> Hlc {
        let physical = wall_clock_ms();
        if physical > self.ts {
            self.ts = physical;
            self.counter = 0;
        } else {
            self.counter += 1;
        }
        self.reading()
    }

    /// Merge an observed remote timestamp. The returned reading is strictly
    /// greater than both the remote value and every earlier local reading.
    pub fn receive(&mut self, remote: &Hlc) -> Hlc {
        let physical = wall_clock_ms();
        let merged = self.ts.max(remote.ts).max(physical);
        if merged == self.ts && merged == remote.ts {
            self.counter = self.counter.max(remote.counter) + 1;
        } else if merged == self.ts {
            self.counter += 1;
        } else if merged == remote.ts {
            self.ts = remote.ts;
            self.counter = remote.counter + 1;
        } else {
            self.ts = physical;
            self.counter = 0;
        }
        self.reading()
    }

    fn reading(&self) -> Hlc {
        Hlc {
            ts: self.ts,
            counter: self.counter,
            node_id: self.node_id.clone(),
        }
    }
}

fn wall_clock_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_strictly_monotone() {
        let mut clock = HlcClock::new("n1");
        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(prev < next);
            prev = next;
        }
    }

    #[test]
    fn receive_is_greater_than_remote() {
        let mut clock = HlcClock::new("n1");
        // A remote timestamp far in the future; the counter path must win.
        let remote = Hlc {
            ts: wall_clock_ms() + 60_000,
            counter: 7,
            node_id: "n2".into(),
        };
        let merged = clock.receive(&remote);
        assert!(remote < merged);
        // And the clock keeps moving after the merge.
        assert!(merged < clock.now());
    }

    #[test]
    fn receive_with_stale_remote_still_advances() {
        let mut clock = HlcClock::new("n1");
        let before = clock.now();
        let remote = Hlc {
            ts: 1,
            counter: 0,
            node_id: "n2".into(),
        };
        let merged = clock.receive(&remote);
        assert!(before < merged);
        assert!(remote < merged);
    }

    #[test]
    fn string_round_trip() {
        let h = Hlc {
            ts: 1_700_000_000_123,
            counter: 42,
            node_id: "ab-cd-ef".into(),
        };
        let s = h.to_string();
        assert_eq!(Hlc::parse(&s).unwrap(), h);
    }

    #[test]
    fn string_order_matches_value_order() {
        let samples = [
            Hlc { ts: 0, counter: 0, node_id: "a".into() },
            Hlc { ts: 0, counter: 1, node_id: "a".into() },
            Hlc { ts: 1, counter: 0, node_id: "a".into() },
            Hlc { ts: 35, counter: 0, node_id: "a".into() },
            Hlc { ts: 36, counter: 0, node_id: "a".into() },
            Hlc { ts: 1_700_000_000_123, counter: 0, node_id: "a".into() },
            Hlc { ts: 1_700_000_000_123, counter: 35, node_id: "a".into() },
            Hlc { ts: 1_700_000_000_123, counter: 36, node_id: "a".into() },
            Hlc { ts: 1_700_000_000_123, counter: 36, node_id: "b".into() },
        ];
        for a in &samples {
            for b in &samples {
                assert_eq!(
                    a.cmp(b),
                    a.to_string().cmp(&b.to_string()),
                    "string order diverged for {a} vs {b}"
                );
            }
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Hlc::parse("").is_err());
        assert!(Hlc::parse("nodashes").is_err());
        assert!(Hlc::parse("00000000000-00000-").is_err());
        assert!(Hlc::parse("zz!zz-00000-n").is_err());
    }
}
