//! Sensor Frame Assembly
//!
//! Turns raw sensor lines into frames of `KEY -> raw value`. Two policies
//! exist, picked per deployment:
//!
//! ```text
//! line-atomic:   speed=50,temp=36.2,gear=3     -> one frame per line
//! accumulating:  SPEED=50 / TEMP=36.2 / GEAR=3 -> one frame once all required keys arrived
//! ```
//!
//! Keys are normalized (trimmed, uppercased) before any set check, so
//! `temp`, `Temp` and ` TEMP ` are the same key.

use std::collections::BTreeSet;

/// Normalize a raw sensor key for set membership. Idempotent.
pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// How lines are grouped into frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePolicy {
    /// Every line is a complete comma-separated frame
    LineAtomic {
        /// Keys to keep; empty means every key is kept
        accepted_keys: BTreeSet<String>,
    },
    /// One pair per line, merged until `required_keys` are all present
    Accumulating {
        required_keys: BTreeSet<String>,
        /// Extra keys kept alongside the required ones
        accepted_keys: BTreeSet<String>,
    },
}

impl Default for FramePolicy {
    fn default() -> Self {
        Self::line_atomic()
    }
}

impl FramePolicy {
    /// Line-atomic policy accepting every key
    pub fn line_atomic() -> Self {
        Self::LineAtomic {
            accepted_keys: BTreeSet::new(),
        }
    }

    /// Accumulating policy that completes once `required` keys are seen
    pub fn accumulating<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::Accumulating {
            required_keys: normalize_set(required),
            accepted_keys: BTreeSet::new(),
        }
    }

    /// Restrict (line-atomic) or extend (accumulating) the keys that are kept
    pub fn with_accepted_keys<I, S>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let accepted_keys = normalize_set(keys);
        match self {
            Self::LineAtomic { .. } => Self::LineAtomic { accepted_keys },
            Self::Accumulating { required_keys, .. } => Self::Accumulating {
                required_keys,
                accepted_keys,
            },
        }
    }

    /// Whether a normalized key may enter a frame
    fn accepts(&self, key: &str) -> bool {
        match self {
            Self::LineAtomic { accepted_keys } => {
                accepted_keys.is_empty() || accepted_keys.contains(key)
            }
            Self::Accumulating {
                required_keys,
                accepted_keys,
            } => required_keys.contains(key) || accepted_keys.contains(key),
        }
    }
}

fn normalize_set<I, S>(keys: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    keys.into_iter()
        .map(|k| normalize_key(k.as_ref()))
        .filter(|k| !k.is_empty())
        .collect()
}

/// Raw key/value pairs of one frame, in order of first arrival
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensorFrame {
    entries: Vec<(String, String)>,
}

impl SensorFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pair; a repeated key keeps its position and takes the new value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A pair dropped while reading a line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoredPair {
    /// No `=` separator, or more than one pair on an accumulating line
    Malformed(String),
    /// Nothing before the `=`
    EmptyKey(String),
    /// Nothing after the `=`
    EmptyValue(String),
    /// Key outside the policy's key set
    UnknownKey(String),
}

impl std::fmt::Display for IgnoredPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IgnoredPair::Malformed(s) => write!(f, "malformed pair '{}'", s),
            IgnoredPair::EmptyKey(s) => write!(f, "empty key in '{}'", s),
            IgnoredPair::EmptyValue(k) => write!(f, "empty value for {}", k),
            IgnoredPair::UnknownKey(k) => write!(f, "unknown key {}", k),
        }
    }
}

/// What a line did to the frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A frame is ready to encode; the assembler has been cleared
    Complete(SensorFrame),
    /// Accumulating policy is still waiting for these keys
    Pending { missing: Vec<String> },
    /// Line-atomic line produced no usable pair
    Discarded,
}

/// Outcome of one line plus every pair it dropped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineReport {
    pub outcome: FrameOutcome,
    pub ignored: Vec<IgnoredPair>,
}

/// Builds frames from sensor lines according to a `FramePolicy`
#[derive(Debug, Clone)]
pub struct FrameAssembler {
    policy: FramePolicy,
    /// Partial frame, only ever populated by the accumulating policy
    pending: SensorFrame,
}

impl FrameAssembler {
    pub fn new(policy: FramePolicy) -> Self {
        Self {
            policy,
            pending: SensorFrame::new(),
        }
    }

    pub fn policy(&self) -> &FramePolicy {
        &self.policy
    }

    /// Keys collected since the last dispatch
    pub fn pending(&self) -> &SensorFrame {
        &self.pending
    }

    /// Feed one trimmed input line
    pub fn push_line(&mut self, line: &str) -> LineReport {
        match &self.policy {
            FramePolicy::LineAtomic { .. } => self.push_atomic(line),
            FramePolicy::Accumulating { .. } => self.push_accumulating(line),
        }
    }

    fn push_atomic(&self, line: &str) -> LineReport {
        let mut frame = SensorFrame::new();
        let mut ignored = Vec::new();

        for segment in line.split(',') {
            if segment.trim().is_empty() {
                continue;
            }
            match self.parse_pair(segment) {
                Ok((key, value)) => frame.insert(key, value),
                Err(reason) => ignored.push(reason),
            }
        }

        let outcome = if frame.is_empty() {
            FrameOutcome::Discarded
        } else {
            FrameOutcome::Complete(frame)
        };
        LineReport { outcome, ignored }
    }

    fn push_accumulating(&mut self, line: &str) -> LineReport {
        let mut ignored = Vec::new();
        match self.parse_pair(line) {
            // One pair per line under this policy
            Ok((_, value)) if value.contains(',') => {
                ignored.push(IgnoredPair::Malformed(line.trim().to_string()))
            }
            Ok((key, value)) => self.pending.insert(key, value),
            Err(reason) => ignored.push(reason),
        }

        let missing = self.missing_keys();
        let outcome = if missing.is_empty() {
            FrameOutcome::Complete(std::mem::take(&mut self.pending))
        } else {
            FrameOutcome::Pending { missing }
        };
        LineReport { outcome, ignored }
    }

    /// Required keys not yet seen since the last dispatch
    fn missing_keys(&self) -> Vec<String> {
        match &self.policy {
            FramePolicy::Accumulating { required_keys, .. } => required_keys
                .iter()
                .filter(|k| !self.pending.contains_key(k))
                .cloned()
                .collect(),
            FramePolicy::LineAtomic { .. } => Vec::new(),
        }
    }

    /// Split `key=value`, normalize the key and apply the policy's key filter
    fn parse_pair(&self, segment: &str) -> Result<(String, String), IgnoredPair> {
        let (raw_key, raw_value) = segment
            .split_once('=')
            .ok_or_else(|| IgnoredPair::Malformed(segment.trim().to_string()))?;

        let key = normalize_key(raw_key);
        if key.is_empty() {
            return Err(IgnoredPair::EmptyKey(segment.trim().to_string()));
        }
        let value = raw_value.trim();
        if value.is_empty() {
            return Err(IgnoredPair::EmptyValue(key));
        }
        if !self.policy.accepts(&key) {
            return Err(IgnoredPair::UnknownKey(key));
        }
        Ok((key, value.to_string()))
    }
}
