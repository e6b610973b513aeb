//! Per-node state as reported by nodes, wanted by operators and published by the controller.

use super::node::NodeType;
use crate::error::{ControllerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Init progress at or below this value means the node is still listing buckets
/// and cannot serve anything yet.
pub const LISTING_BUCKETS_INIT_PROGRESS_LIMIT: f64 = 0.01;

/// Distribution bit count assumed when nothing else is known.
pub const DEFAULT_DISTRIBUTION_BITS: u16 = 16;

/// Node state enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Up,
    Down,
    Initializing,
    Stopping,
    Retired,
    Maintenance,
}

impl State {
    /// Single-letter wire abbreviation.
    pub fn abbrev(&self) -> &'static str {
        match self {
            State::Up => "u",
            State::Down => "d",
            State::Initializing => "i",
            State::Stopping => "s",
            State::Retired => "r",
            State::Maintenance => "m",
        }
    }

    pub fn from_abbrev(s: &str) -> Option<State> {
        match s {
            "u" => Some(State::Up),
            "d" => Some(State::Down),
            "i" => Some(State::Initializing),
            "s" => Some(State::Stopping),
            "r" => Some(State::Retired),
            "m" => Some(State::Maintenance),
            _ => None,
        }
    }

    /// Position in the "worseness" order:
    /// Up < Initializing < Stopping < Retired < Maintenance < Down.
    pub fn severity(&self) -> u8 {
        match self {
            State::Up => 0,
            State::Initializing => 1,
            State::Stopping => 2,
            State::Retired => 3,
            State::Maintenance => 4,
            State::Down => 5,
        }
    }

    pub fn is_worse_than(&self, other: State) -> bool {
        self.severity() > other.severity()
    }

    /// Whether the node counts towards cluster-wide minimum availability.
    pub fn is_available(&self) -> bool {
        matches!(
            self,
            State::Up | State::Initializing | State::Retired | State::Maintenance
        )
    }

    /// Whether the node is reachable and holds (or is getting) data.
    pub fn is_up_ish(&self) -> bool {
        matches!(self, State::Up | State::Initializing | State::Retired)
    }

    pub fn is_down_or_stopping(&self) -> bool {
        matches!(self, State::Down | State::Stopping)
    }

    /// Whether an operator may set this as a node's wanted state.
    pub fn valid_as_wanted_for(&self, node_type: NodeType) -> bool {
        match node_type {
            NodeType::Storage => matches!(
                self,
                State::Up | State::Down | State::Maintenance | State::Retired
            ),
            NodeType::Distributor => matches!(self, State::Up | State::Down),
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Up => "Up",
            State::Down => "Down",
            State::Initializing => "Initializing",
            State::Stopping => "Stopping",
            State::Retired => "Retired",
            State::Maintenance => "Maintenance",
        };
        f.write_str(name)
    }
}

/// The state of a single node plus its auxiliary fields.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    pub state: State,
    pub description: String,
    /// 0..=1, only meaningful while initializing.
    pub init_progress: f64,
    /// Process start time in seconds; 0 when unknown.
    pub start_timestamp: u64,
    pub min_used_bits: u16,
}

impl NodeState {
    pub fn new(state: State) -> Self {
        Self {
            state,
            description: String::new(),
            init_progress: 0.0,
            start_timestamp: 0,
            min_used_bits: DEFAULT_DISTRIBUTION_BITS,
        }
    }

    pub fn up() -> Self {
        Self::new(State::Up)
    }

    pub fn down() -> Self {
        Self::new(State::Down)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_init_progress(mut self, progress: f64) -> Self {
        self.init_progress = progress;
        self
    }

    pub fn with_start_timestamp(mut self, timestamp: u64) -> Self {
        self.start_timestamp = timestamp;
        self
    }

    pub fn with_min_used_bits(mut self, bits: u16) -> Self {
        self.min_used_bits = bits;
        self
    }

    /// Plain Up with nothing extra attached; such nodes are left implicit in a cluster state.
    pub fn is_default_up(&self) -> bool {
        *self == NodeState::up()
    }

    /// Structural similarity: only the state enum is compared.
    pub fn similar_to(&self, other: &NodeState) -> bool {
        self.state == other.state
    }

    /// Append this state's `key:value` tokens, each prefixed by `prefix`.
    pub(crate) fn write_tokens(&self, prefix: &str, out: &mut Vec<String>) {
        if self.state != State::Up {
            out.push(format!("{}s:{}", prefix, self.state.abbrev()));
        }
        if self.state == State::Initializing && self.init_progress != 0.0 {
            out.push(format!("{}i:{}", prefix, self.init_progress));
        }
        if self.start_timestamp != 0 {
            out.push(format!("{}t:{}", prefix, self.start_timestamp));
        }
        if self.min_used_bits != DEFAULT_DISTRIBUTION_BITS {
            out.push(format!("{}b:{}", prefix, self.min_used_bits));
        }
        if !self.description.is_empty() {
            out.push(format!("{}m:{}", prefix, escape_description(&self.description)));
        }
    }

    /// Apply a single `key:value` pair.
    pub(crate) fn set_field(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "s" => {
                self.state = State::from_abbrev(value).ok_or_else(|| {
                    ControllerError::Parse(format!("unknown node state '{}'", value))
                })?;
            }
            "i" => self.init_progress = parse_value(key, value)?,
            "t" => self.start_timestamp = parse_value(key, value)?,
            "b" => self.min_used_bits = parse_value(key, value)?,
            "m" => self.description = unescape_description(value)?,
            other => {
                return Err(ControllerError::Parse(format!(
                    "unknown node state key '{}'",
                    other
                )))
            }
        }
        Ok(())
    }

    /// Reject field combinations the wire format never produces.
    pub(crate) fn check_parsed(&self) -> Result<()> {
        if self.init_progress != 0.0 && self.state != State::Initializing {
            return Err(ControllerError::Parse(format!(
                "init progress {} given for a node in state {}",
                self.init_progress, self.state
            )));
        }
        Ok(())
    }
}

impl Default for NodeState {
    fn default() -> Self {
        Self::up()
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tokens = Vec::new();
        self.write_tokens("", &mut tokens);
        if tokens.is_empty() {
            // Up is implicit on the wire, spell it out for humans.
            return f.write_str("s:u");
        }
        f.write_str(&tokens.join(" "))
    }
}

impl FromStr for NodeState {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self> {
        let mut state = NodeState::up();
        for token in s.split_whitespace() {
            let (key, value) = token
                .split_once(':')
                .ok_or_else(|| ControllerError::Parse(format!("token '{}' lacks ':'", token)))?;
            state.set_field(key, value)?;
        }
        state.check_parsed()?;
        Ok(state)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| ControllerError::Parse(format!("bad value '{}' for key '{}': {}", value, key, e)))
}

/// Escape a description so it survives whitespace tokenization.
pub fn escape_description(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            ' ' => out.push_str("\\x20"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c.is_ascii_graphic() => out.push(c),
            c => {
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("\\x{:02x}", byte));
                }
            }
        }
    }
    out
}

/// Inverse of [`escape_description`].
pub fn unescape_description(s: &str) -> Result<String> {
    let mut bytes = Vec::with_capacity(s.len());
    let mut iter = s.bytes();
    while let Some(b) = iter.next() {
        if b != b'\\' {
            bytes.push(b);
            continue;
        }
        match iter.next() {
            Some(b'\\') => bytes.push(b'\\'),
            Some(b'n') => bytes.push(b'\n'),
            Some(b't') => bytes.push(b'\t'),
            Some(b'r') => bytes.push(b'\r'),
            Some(b'x') => {
                let hi = iter.next();
                let lo = iter.next();
                let hex = match (hi, lo) {
                    (Some(h), Some(l)) => [h, l],
                    _ => return Err(ControllerError::Parse(format!("truncated escape in '{}'", s))),
                };
                let hex = std::str::from_utf8(&hex)
                    .map_err(|_| ControllerError::Parse(format!("bad escape in '{}'", s)))?;
                let byte = u8::from_str_radix(hex, 16)
                    .map_err(|_| ControllerError::Parse(format!("bad escape in '{}'", s)))?;
                bytes.push(byte);
            }
            _ => return Err(ControllerError::Parse(format!("bad escape in '{}'", s))),
        }
    }
    String::from_utf8(bytes).map_err(|e| ControllerError::Parse(e.to_string()))
}
