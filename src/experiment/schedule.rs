//! Schedule expansion.
//!
//! Acquisition plans describe device configuration as nested tables whose keys may be
//! dotted paths (`"light.intensity" = 40` is the same as `light = { intensity = 40 }`).
//! This module expands those paths, merges per-step overrides over the default state
//! and flattens the `times` and `channels` tables into ordered steps.
//!
//! A `times` entry may carry two reserved keys that are not device configuration:
//!
//! - `wait`: how long to sleep after applying the entry, either a number of seconds or
//!   a duration string such as `"1m 30s"`. Negative numbers mean no wait.
//! - `acquire`: whether frames are captured at this entry. Entries without it are
//!   settle-only: they are applied and waited on but never stored, and they do not
//!   count toward the stored `time` axis.

use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

/// A device configuration tree, keyed by device name.
pub type ConfigTree = Map<String, Value>;

const WAIT_KEY: &str = "wait";
const ACQUIRE_KEY: &str = "acquire";

/// Label of the implicit time entry used when a plan has no `times` table.
pub const IMPLICIT_TIME_LABEL: &str = "0";

/// Label of the implicit channel used when a plan has no `channels` table.
pub const IMPLICIT_CHANNEL_LABEL: &str = "default";

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("{axis} entry '{label}' must be a table of device settings")]
    NotATable { axis: &'static str, label: String },

    #[error("Invalid wait for time entry '{label}': {reason}")]
    InvalidWait { label: String, reason: String },

    #[error("'acquire' for time entry '{label}' must be true or false")]
    InvalidAcquire { label: String },

    #[error("No time entry is marked for acquisition")]
    NothingToAcquire,
}

/// Expand dotted keys into nested tables, recursively.
///
/// Later keys win over earlier ones; sibling paths that share a prefix merge.
pub fn expand_dotted(tree: &ConfigTree) -> ConfigTree {
    let mut expanded = ConfigTree::new();
    for (key, value) in tree {
        let value = match value {
            Value::Object(nested) => Value::Object(expand_dotted(nested)),
            other => other.clone(),
        };
        let mut parts = key.rsplit('.');
        let leaf = parts.next().unwrap_or_default();

        let mut path = ConfigTree::new();
        path.insert(leaf.to_string(), value);
        for part in parts {
            let mut outer = ConfigTree::new();
            outer.insert(part.to_string(), Value::Object(path));
            path = outer;
        }
        expanded = merge_configs(&path, &expanded);
    }
    expanded
}

/// Merge `overrides` over `defaults`, recursively.
///
/// Leaves present in both come from `overrides`; tables present in both merge; keys
/// present in only one side are kept. Default keys keep their order, new override
/// keys follow.
pub fn merge_configs(overrides: &ConfigTree, defaults: &ConfigTree) -> ConfigTree {
    let mut merged = defaults.clone();
    for (key, value) in overrides {
        let combined = match (value, defaults.get(key)) {
            (Value::Object(over), Some(Value::Object(base))) => {
                Value::Object(merge_configs(over, base))
            }
            (over, _) => over.clone(),
        };
        merged.insert(key.clone(), combined);
    }
    merged
}

/// One entry of the `times` axis.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeStep {
    /// Entry label
    pub label: String,
    /// Sleep after the configuration is applied
    pub wait: Option<Duration>,
    /// Whether frames are captured at this entry
    pub acquire: bool,
    /// Device overrides, dotted keys expanded
    pub overrides: ConfigTree,
}

/// One entry of the `channels` axis.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStep {
    /// Channel label
    pub label: String,
    /// Device overrides, dotted keys expanded
    pub overrides: ConfigTree,
}

/// The flattened, ordered schedule of an acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    /// Time entries in declared order, settle-only entries included
    pub times: Vec<TimeStep>,
    /// Channels in declared order
    pub channels: Vec<ChannelStep>,
    /// Baseline configuration restored between steps
    pub default_state: ConfigTree,
}

impl Schedule {
    /// Expand the plan's `times`, `channels` and `default_state` tables.
    ///
    /// An empty `times` table becomes a single acquired entry; an empty `channels`
    /// table becomes a single channel without overrides.
    pub fn expand(
        times: &ConfigTree,
        channels: &ConfigTree,
        default_state: &ConfigTree,
    ) -> Result<Self, ScheduleError> {
        let times = if times.is_empty() {
            vec![TimeStep {
                label: IMPLICIT_TIME_LABEL.to_string(),
                wait: None,
                acquire: true,
                overrides: ConfigTree::new(),
            }]
        } else {
            times
                .iter()
                .map(|(label, entry)| time_step(label, entry))
                .collect::<Result<Vec<_>, _>>()?
        };

        if !times.iter().any(|t| t.acquire) {
            return Err(ScheduleError::NothingToAcquire);
        }

        let channels = if channels.is_empty() {
            vec![ChannelStep {
                label: IMPLICIT_CHANNEL_LABEL.to_string(),
                overrides: ConfigTree::new(),
            }]
        } else {
            channels
                .iter()
                .map(|(label, entry)| {
                    Ok(ChannelStep {
                        label: label.clone(),
                        overrides: table("channel", label, entry)?,
                    })
                })
                .collect::<Result<Vec<_>, ScheduleError>>()?
        };

        Ok(Self {
            times,
            channels,
            default_state: expand_dotted(default_state),
        })
    }

    /// Labels of the acquired time entries, the stored `time` coordinate.
    pub fn acquired_labels(&self) -> Vec<&str> {
        self.times
            .iter()
            .filter(|t| t.acquire)
            .map(|t| t.label.as_str())
            .collect()
    }

    /// Channel labels, the stored `channel` coordinate.
    pub fn channel_labels(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.label.as_str()).collect()
    }

    /// Configuration of a time entry: its overrides merged over the default state.
    pub fn time_state(&self, step: &TimeStep) -> ConfigTree {
        merge_configs(&step.overrides, &self.default_state)
    }

    /// Configuration of a channel at a time entry whose state is `time_state`.
    pub fn channel_state(&self, channel: &ChannelStep, time_state: &ConfigTree) -> ConfigTree {
        merge_configs(&channel.overrides, time_state)
    }
}

fn table(axis: &'static str, label: &str, entry: &Value) -> Result<ConfigTree, ScheduleError> {
    match entry {
        Value::Object(map) => Ok(expand_dotted(map)),
        Value::Null => Ok(ConfigTree::new()),
        _ => Err(ScheduleError::NotATable {
            axis,
            label: label.to_string(),
        }),
    }
}

fn time_step(label: &str, entry: &Value) -> Result<TimeStep, ScheduleError> {
    let mut overrides = match entry {
        Value::Object(map) => map.clone(),
        Value::Null => ConfigTree::new(),
        _ => {
            return Err(ScheduleError::NotATable {
                axis: "time",
                label: label.to_string(),
            })
        }
    };

    let wait = match overrides.remove(WAIT_KEY) {
        None | Some(Value::Null) => None,
        Some(value) => parse_wait(label, &value)?,
    };

    let acquire = match overrides.remove(ACQUIRE_KEY) {
        None => false,
        Some(Value::Bool(acquire)) => acquire,
        Some(_) => {
            return Err(ScheduleError::InvalidAcquire {
                label: label.to_string(),
            })
        }
    };

    Ok(TimeStep {
        label: label.to_string(),
        wait,
        acquire,
        overrides: expand_dotted(&overrides),
    })
}

fn parse_wait(label: &str, value: &Value) -> Result<Option<Duration>, ScheduleError> {
    let invalid = |reason: String| ScheduleError::InvalidWait {
        label: label.to_string(),
        reason,
    };
    match value {
        Value::Number(n) => {
            let seconds = n.as_f64().ok_or_else(|| invalid(format!("{n} is not a number")))?;
            if seconds < 0.0 {
                Ok(None)
            } else {
                Duration::try_from_secs_f64(seconds)
                    .map(Some)
                    .map_err(|e| invalid(e.to_string()))
            }
        }
        Value::String(s) => humantime::parse_duration(s.trim())
            .map(Some)
            .map_err(|e| invalid(format!("'{s}': {e}"))),
        other => Err(invalid(format!("{other} is neither seconds nor a duration"))),
    }
}
