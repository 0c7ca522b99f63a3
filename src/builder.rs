//! Fluent builder for hubs.
//!
//! Most code never builds a hub explicitly: [`Hub::current`] creates one
//! per thread from the defaults below. [`HubBuilder`] is for tests and for
//! programs that want a specific backend or debugging aid.
//!
//! # Example
//! ```ignore
//! use fiberhub::{BackendKind, HubBuilder};
//!
//! let hub = HubBuilder::new()
//!     .backend(BackendKind::Poll)
//!     .single_owner(false)
//!     .install()?;
//! ```

use crate::error::{Error, Result};
use crate::hub::{Hub, context};
use crate::poller::{self, Backend, BackendKind};

use std::env;
use std::sync::OnceLock;
use std::time::Duration;

/// Environment variable naming the backend for hubs that do not ask for one.
pub const BACKEND_ENV: &str = "FIBERHUB_BACKEND";

const DEFAULT_IDLE: Duration = Duration::from_secs(60);
const DEFAULT_FIBER_STACK: usize = 0x8000;
const DEFAULT_HUB_STACK: usize = 0x10000;
const DEFAULT_COMPACTION_THRESHOLD: usize = 1000;

static DEFAULT_BACKEND: OnceLock<Option<BackendKind>> = OnceLock::new();

/// Picks the backend of every hub built afterwards without an explicit
/// one, overriding [`BACKEND_ENV`].
///
/// The choice is made once per process: this fails with
/// [`Error::BackendLocked`] once a hub has been built or a backend was
/// already chosen.
pub fn use_backend(kind: BackendKind) -> Result<()> {
    DEFAULT_BACKEND
        .set(Some(kind))
        .map_err(|_| Error::BackendLocked)
}

fn default_backend() -> Option<BackendKind> {
    *DEFAULT_BACKEND.get_or_init(|| {
        let name = env::var(BACKEND_ENV).ok()?;
        match name.parse() {
            Ok(kind) => Some(kind),
            Err(err) => {
                log::warn!("ignoring {}: {}", BACKEND_ENV, err);
                None
            }
        }
    })
}

/// Settings fixed at hub creation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HubConfig {
    pub(crate) single_owner: bool,
    pub(crate) default_idle: Duration,
    /// In machine words.
    pub(crate) fiber_stack_size: usize,
    /// In machine words.
    pub(crate) hub_stack_size: usize,
    pub(crate) compaction_threshold: usize,
    pub(crate) debug_listeners: bool,
    pub(crate) timer_exceptions: bool,
    pub(crate) debug_blocking: Option<Duration>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            single_owner: true,
            default_idle: DEFAULT_IDLE,
            fiber_stack_size: DEFAULT_FIBER_STACK,
            hub_stack_size: DEFAULT_HUB_STACK,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            debug_listeners: false,
            timer_exceptions: true,
            debug_blocking: None,
        }
    }
}

pub struct HubBuilder {
    backend: Option<BackendKind>,
    custom_backend: Option<Box<dyn Backend>>,
    config: HubConfig,
}

impl Default for HubBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HubBuilder {
    pub fn new() -> Self {
        Self {
            backend: None,
            custom_backend: None,
            config: HubConfig::default(),
        }
    }

    /// Uses `kind` instead of the process-wide default.
    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.backend = Some(kind);
        self
    }

    /// Uses an already opened backend, for instance a custom one.
    pub fn with_backend(mut self, backend: Box<dyn Backend>) -> Self {
        self.custom_backend = Some(backend);
        self
    }

    /// Refuse a second primary listener per descriptor and direction.
    /// On by default.
    pub fn single_owner(mut self, enabled: bool) -> Self {
        self.config.single_owner = enabled;
        self
    }

    /// How long the loop blocks when no timer is pending. 60 seconds by
    /// default.
    pub fn default_idle(mut self, idle: Duration) -> Self {
        self.config.default_idle = idle;
        self
    }

    /// Stack size of spawned fibers, in machine words.
    pub fn fiber_stack_size(mut self, words: usize) -> Self {
        self.config.fiber_stack_size = words;
        self
    }

    /// Stack size of the hub fiber, in machine words.
    pub fn hub_stack_size(mut self, words: usize) -> Self {
        self.config.hub_stack_size = words;
        self
    }

    /// Minimum timer heap size before canceled timers are swept.
    pub fn compaction_threshold(mut self, threshold: usize) -> Self {
        self.config.compaction_threshold = threshold;
        self
    }

    pub fn debug_listeners(mut self, enabled: bool) -> Self {
        self.config.debug_listeners = enabled;
        self
    }

    pub fn timer_exceptions(mut self, enabled: bool) -> Self {
        self.config.timer_exceptions = enabled;
        self
    }

    pub fn debug_blocking(mut self, resolution: Option<Duration>) -> Self {
        self.config.debug_blocking = resolution;
        self
    }

    /// Builds a hub without making it the current thread's hub.
    pub fn build(self) -> Result<Hub> {
        let fallback = default_backend();

        let backend = match self.custom_backend {
            Some(backend) => backend,
            None => poller::open(self.backend.or(fallback))?,
        };

        Hub::new(self.config, backend)
    }

    /// Builds a hub and installs it as the current thread's hub.
    pub fn install(self) -> Result<Hub> {
        let hub = self.build()?;
        let previous = context::install(hub.clone());
        drop(previous);

        Ok(hub)
    }
}
