use std::env;

use snafu::{ResultExt as _, ensure};

use crate::{
  block::{MAX_HEAP_SIZE, NODE_SIZE},
  error::{ConfigError, InitError, InvalidConfigSnafu, InvalidValueSnafu},
};

/// Tunables read once when a heap is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
  /// Pages requested from the extender at initialization.
  pub initial_pages: usize,
  /// Bytes the managed region may grow to, on top of the extender's own limit.
  pub max_heap_size: Option<usize>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      initial_pages: 1,
      max_heap_size: None,
    }
  }
}

impl Config {
  pub const ENV_INITIAL_PAGES: &'static str = "BRKALLOC_INITIAL_PAGES";
  pub const ENV_MAX_HEAP_SIZE: &'static str = "BRKALLOC_MAX_HEAP_SIZE";

  #[must_use]
  pub fn initial_pages(
    mut self,
    pages: usize,
  ) -> Self {
    self.initial_pages = pages;
    self
  }

  #[must_use]
  pub fn max_heap_size(
    mut self,
    bytes: usize,
  ) -> Self {
    self.max_heap_size = Some(bytes);
    self
  }

  /// Default configuration overridden by `BRKALLOC_*` environment variables.
  ///
  /// Reading the environment allocates, so this must not run from inside a
  /// global allocator.
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_lookup(|var| env::var(var).ok())
  }

  pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
  where
    F: Fn(&'static str) -> Option<String>,
  {
    let parse = |var: &'static str| -> Result<Option<usize>, ConfigError> {
      lookup(var)
        .map(|value| {
          value
            .trim()
            .parse()
            .context(InvalidValueSnafu { var, value: value.clone() })
        })
        .transpose()
    };

    let mut config = Self::default();
    if let Some(pages) = parse(Self::ENV_INITIAL_PAGES)? {
      config.initial_pages = pages;
    }
    config.max_heap_size = parse(Self::ENV_MAX_HEAP_SIZE)?;
    Ok(config)
  }

  /// Bytes requested from the extender at initialization.
  pub(crate) fn initial_size(
    &self,
    page_size: usize,
  ) -> Result<usize, InitError> {
    ensure!(
      page_size.is_power_of_two() && page_size >= 2 * NODE_SIZE,
      InvalidConfigSnafu {
        reason: "page size must be a power of two holding at least two free nodes",
      }
    );
    ensure!(
      self.initial_pages > 0,
      InvalidConfigSnafu {
        reason: "at least one initial page is required",
      }
    );

    let size = self
      .initial_pages
      .checked_mul(page_size)
      .filter(|size| *size <= self.heap_limit());
    size.ok_or(InitError::InvalidConfig {
      reason: "initial pages exceed the heap limit",
    })
  }

  /// Largest size the managed region may reach.
  pub(crate) fn heap_limit(&self) -> usize {
    self.max_heap_size.map_or(MAX_HEAP_SIZE, |max| max.min(MAX_HEAP_SIZE))
  }
}

#[cfg(test)]
mod tests {
  use std::collections::HashMap;

  use super::*;

  fn lookup(vars: &[(&'static str, &str)]) -> impl Fn(&'static str) -> Option<String> {
    let vars: HashMap<_, _> = vars.iter().map(|(k, v)| (*k, v.to_string())).collect();
    move |var| vars.get(var).cloned()
  }

  #[test]
  fn test_defaults() {
    let config = Config::from_lookup(lookup(&[])).unwrap();
    assert_eq!(config, Config::default());
    assert_eq!(config.initial_size(4096).unwrap(), 4096);
    assert_eq!(config.heap_limit(), MAX_HEAP_SIZE);
  }

  #[test]
  fn test_env_overrides() {
    let config = Config::from_lookup(lookup(&[
      (Config::ENV_INITIAL_PAGES, "4"),
      (Config::ENV_MAX_HEAP_SIZE, " 65536 "),
    ]))
    .unwrap();
    assert_eq!(config, Config::default().initial_pages(4).max_heap_size(65536));
    assert_eq!(config.initial_size(4096).unwrap(), 16384);
  }

  #[test]
  fn test_env_invalid_number() {
    let err = Config::from_lookup(lookup(&[(Config::ENV_INITIAL_PAGES, "lots")])).unwrap_err();
    assert!(err.to_string().contains(Config::ENV_INITIAL_PAGES));
  }

  #[test]
  fn test_invalid_initial_size() {
    assert!(Config::default().initial_pages(0).initial_size(4096).is_err());
    assert!(Config::default().initial_size(3000).is_err());
    assert!(
      Config::default()
        .initial_pages(4)
        .max_heap_size(8192)
        .initial_size(4096)
        .is_err()
    );
  }
}
