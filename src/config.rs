//! Runtime configuration.
//!
//! Defaults work out of the box; a TOML document or `STRATUM_*` environment
//! variables override individual knobs.
//!
//! ```toml
//! logical_user_timeout = 32
//! field_state_rebuild_timeout = 16
//! enable_close_elision = true
//! collect_garbage_eagerly = false
//! shard_count = 1
//! ```

use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;

const ENV_PREFIX: &str = "STRATUM_";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Traversals a logical user may be skipped by before it is tested
    /// against the commit set.
    pub logical_user_timeout: u32,
    /// Merges a field state absorbs before the node's field-state list is
    /// coalesced.
    pub field_state_rebuild_timeout: u32,
    /// Let successive projection accesses skip the close between them when
    /// they provably do not interfere.
    pub enable_close_elision: bool,
    /// Run deferred version-state collection after every mapping is applied.
    pub collect_garbage_eagerly: bool,
    /// Shards of the context; more than one marks it control-replicated.
    pub shard_count: u32,
}

impl Default for Config {
    fn default() -> Config {
        return Config {
            logical_user_timeout: 32,
            field_state_rebuild_timeout: 16,
            enable_close_elision: true,
            collect_garbage_eagerly: false,
            shard_count: 1,
        };
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Config> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        return Ok(config);
    }

    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)?;
        return Config::from_toml_str(&text);
    }

    /// Apply `STRATUM_*` overrides from the process environment.
    pub fn merge_with_env(&mut self) -> Result<()> {
        return self.merge_with_vars(std::env::vars());
    }

    /// Apply overrides from `(NAME, value)` pairs; names without the
    /// `STRATUM_` prefix are ignored.
    pub fn merge_with_vars<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "LOGICAL_USER_TIMEOUT" => self.logical_user_timeout = parse(&key, &value)?,
                "FIELD_STATE_REBUILD_TIMEOUT" => self.field_state_rebuild_timeout = parse(&key, &value)?,
                "ENABLE_CLOSE_ELISION" => self.enable_close_elision = parse(&key, &value)?,
                "COLLECT_GARBAGE_EAGERLY" => self.collect_garbage_eagerly = parse(&key, &value)?,
                "SHARD_COUNT" => self.shard_count = parse(&key, &value)?,
                _ => tracing::warn!(key = %key, "ignoring unknown configuration variable"),
            }
        }
        return self.validate();
    }

    pub fn validate(&self) -> Result<()> {
        if self.logical_user_timeout == 0 {
            return Err(Error::Config("logical_user_timeout must be positive".into()));
        }
        if self.field_state_rebuild_timeout == 0 {
            return Err(Error::Config("field_state_rebuild_timeout must be positive".into()));
        }
        if self.shard_count == 0 {
            return Err(Error::Config("shard_count must be positive".into()));
        }
        return Ok(());
    }

    /// True if the context is control-replicated.
    pub fn is_replicated(&self) -> bool {
        return self.shard_count > 1;
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    return value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("cannot parse {key}={value:?}")));
}
