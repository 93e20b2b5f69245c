//! Model cache configuration.

use serde::{Deserialize, Serialize};

use repliq_protocol::Role;

/// Environment variable overriding [`CacheConfig::root_cache_size`].
pub const ROOT_CACHE_SIZE_ENV: &str = "REPLIQ_ROOT_CACHE_SIZE";

// ---------------------------------------------------------------------------
// InitialAction
// ---------------------------------------------------------------------------

/// What a model replica asks for before it reports itself ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InitialAction {
    /// Only the root row and column counts.
    #[default]
    FetchRootSize,
    /// Root counts plus data for the first
    /// [`CacheConfig::prefetch_rows`] root rows.
    PrefetchData,
}

// ---------------------------------------------------------------------------
// CacheConfig
// ---------------------------------------------------------------------------

/// Configuration of a model replica's cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of rows whose role data is kept. Structure survives
    /// eviction; only values are forgotten.
    pub root_cache_size: usize,

    pub initial_action: InitialAction,

    /// Rows fetched up front with [`InitialAction::PrefetchData`].
    pub prefetch_rows: u32,

    /// Roles fetched for each row. Empty means every role the source
    /// advertises.
    pub roles: Vec<Role>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root_cache_size: 1000,
            initial_action: InitialAction::FetchRootSize,
            prefetch_rows: 50,
            roles: Vec::new(),
        }
    }
}

impl CacheConfig {
    /// The default configuration with `root_cache_size` taken from
    /// `REPLIQ_ROOT_CACHE_SIZE` when it is set to a number.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(size) = std::env::var(ROOT_CACHE_SIZE_ENV)
            .ok()
            .and_then(|raw| raw.trim().parse::<usize>().ok())
        {
            config.root_cache_size = size;
        }
        config.validated()
    }

    /// Clamps values into their usable ranges.
    pub fn validated(mut self) -> Self {
        if self.root_cache_size == 0 {
            tracing::warn!("root_cache_size of 0 raised to 1");
            self.root_cache_size = 1;
        }
        self.roles.sort();
        self.roles.dedup();
        self
    }

    pub fn with_roles(mut self, roles: impl IntoIterator<Item = Role>) -> Self {
        self.roles = roles.into_iter().collect();
        self
    }

    pub fn with_root_cache_size(mut self, size: usize) -> Self {
        self.root_cache_size = size;
        self
    }

    /// Prefetch the first `rows` root rows before reporting ready.
    pub fn with_prefetch(mut self, rows: u32) -> Self {
        self.initial_action = InitialAction::PrefetchData;
        self.prefetch_rows = rows;
        self
    }

    /// Rows requested in the initial acquire.
    pub(crate) fn initial_rows(&self) -> u32 {
        match self.initial_action {
            InitialAction::FetchRootSize => 0,
            InitialAction::PrefetchData => self.prefetch_rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config_default() {
        let config = CacheConfig::default();
        assert_eq!(config.root_cache_size, 1000);
        assert_eq!(config.initial_action, InitialAction::FetchRootSize);
        assert_eq!(config.initial_rows(), 0);
        assert!(config.roles.is_empty());
    }

    #[test]
    fn test_validated_clamps_cache_size_and_dedups_roles() {
        let config = CacheConfig::default()
            .with_root_cache_size(0)
            .with_roles([Role::EDIT, Role::DISPLAY, Role::EDIT])
            .validated();
        assert_eq!(config.root_cache_size, 1);
        assert_eq!(config.roles, vec![Role::DISPLAY, Role::EDIT]);
    }

    #[test]
    fn test_with_prefetch_switches_initial_action() {
        let config = CacheConfig::default().with_prefetch(20);
        assert_eq!(config.initial_action, InitialAction::PrefetchData);
        assert_eq!(config.initial_rows(), 20);
    }

    #[test]
    fn test_from_env_reads_root_cache_size() {
        // Only this test touches the variable.
        unsafe { std::env::set_var(ROOT_CACHE_SIZE_ENV, "1500") };
        assert_eq!(CacheConfig::from_env().root_cache_size, 1500);
        unsafe { std::env::set_var(ROOT_CACHE_SIZE_ENV, "not a number") };
        assert_eq!(CacheConfig::from_env().root_cache_size, 1000);
        unsafe { std::env::remove_var(ROOT_CACHE_SIZE_ENV) };
    }
}
