use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::primitives::pager::{max_dbis_for_page_size, PageAllocator};
use crate::storage::btree::Comparator;
use crate::types::page::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::types::{Result, SaplingError};

/// Options supplied when opening a [`super::Db`].
///
/// `page_size` and `max_dbis` can be read from TOML; the comparator and the
/// allocator are runtime capabilities and only settable in code.
#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DbOptions {
    /// Bytes per page, between 256 and 65535.
    pub page_size: u32,
    /// Upper bound on sub-database indices.
    ///
    /// When unset, the most a meta slot of `page_size` holds, up to 32.
    pub max_dbis: Option<u32>,
    /// Key order of DBI 0 and of DBIs opened without their own comparator.
    #[serde(skip)]
    pub comparator: Option<Comparator>,
    /// Source of page buffers; the global heap when unset.
    #[serde(skip)]
    pub allocator: Option<Arc<dyn PageAllocator>>,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_dbis: None,
            comparator: None,
            allocator: None,
        }
    }
}

impl fmt::Debug for DbOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbOptions")
            .field("page_size", &self.page_size)
            .field("max_dbis", &self.max_dbis)
            .field("comparator", &self.comparator)
            .field("allocator", &self.allocator)
            .finish()
    }
}

impl DbOptions {
    /// Parses options from a TOML fragment such as `page_size = 512`.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        toml::from_str(src).map_err(|err| SaplingError::Config(err.to_string()))
    }

    /// Sets the page size.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the DBI limit.
    pub fn with_max_dbis(mut self, max_dbis: u32) -> Self {
        self.max_dbis = Some(max_dbis);
        self
    }

    /// Installs the default key comparator.
    pub fn with_comparator(mut self, comparator: Comparator) -> Self {
        self.comparator = Some(comparator);
        self
    }

    /// Installs a page allocator.
    pub fn with_allocator(mut self, allocator: Arc<dyn PageAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Checks the geometry and returns the DBI limit to open with.
    pub(crate) fn validate(&self) -> Result<usize> {
        let ps = self.page_size as usize;
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&ps) {
            return Err(SaplingError::Invalid("page_size must be within 256..=65535"));
        }
        let limit = max_dbis_for_page_size(ps);
        match self.max_dbis {
            None => Ok(limit),
            Some(n) if n == 0 || n as usize > limit => Err(SaplingError::Invalid(
                "max_dbis must be at least 1 and fit in a meta slot",
            )),
            Some(n) => Ok(n as usize),
        }
    }
}
