//! Explicit run context handed to every pipeline stage.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tmlsync_content::PlatformVersion;

use crate::error::MigrationError;

/// `export_fqn` is honoured from this release on (inclusive).
const EXPORT_FQN_SINCE: [u32; 3] = [9, 0, 0];

/// Connections can be shared from this release on (inclusive).
const CONNECTION_SHARING_SINCE: [u32; 3] = [9, 2, 0];

/// Shared cancellation flag. Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// The underlying flag, for registration with a signal handler.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    pub fn check(&self) -> Result<(), MigrationError> {
        if self.is_cancelled() {
            Err(MigrationError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Polling bounds for the consistency wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// What the engine knows about the environment it is talking to.
///
/// The current org is an opaque precondition; it is only carried for logs.
#[derive(Debug, Clone)]
pub struct MigrationContext {
    pub platform_version: PlatformVersion,
    pub org: Option<String>,
    pub cancel: CancelToken,
}

impl MigrationContext {
    pub fn new(platform_version: PlatformVersion) -> Self {
        Self {
            platform_version,
            org: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_org(mut self, org: impl Into<String>) -> Self {
        self.org = Some(org.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn supports_export_fqn(&self) -> bool {
        self.platform_version
            .at_least(&PlatformVersion::new(&EXPORT_FQN_SINCE))
    }

    pub fn supports_connection_sharing(&self) -> bool {
        self.platform_version
            .at_least(&PlatformVersion::new(&CONNECTION_SHARING_SINCE))
    }

    pub(crate) fn org_label(&self) -> &str {
        self.org.as_deref().unwrap_or("-")
    }
}
