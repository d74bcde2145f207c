//! Installing a dispatcher for the whole process.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::aggregator::RecordStore;
use crate::config::{ConfigError, TracerConfig};
use crate::dispatcher::Dispatcher;

/// The dispatcher that [`crate::CallProbe`]s report to, if any.
static ACTIVE_DISPATCHER: RwLock<Option<Arc<Dispatcher>>> = parking_lot::const_rwlock(None);

pub(crate) fn active_dispatcher() -> Option<Arc<Dispatcher>> {
    ACTIVE_DISPATCHER.read().clone()
}

/// Is a [`TraceSession`] currently installed?
pub fn is_tracing() -> bool {
    ACTIVE_DISPATCHER.read().is_some()
}

#[derive(thiserror::Error, Debug)]
pub enum InstallError {
    #[error("another trace session is already installed")]
    AlreadyInstalled,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// The installed tracer.
///
/// At most one session exists per process. Dropping it (or calling [`Self::finish`])
/// uninstalls it; calls that are still in flight at that point are never measured.
///
/// ```no_run
/// let session = memtrace::TraceSession::install(memtrace::TracerConfig::new("."))?;
/// // … run the code you want to measure …
/// let records = session.finish();
/// memtrace::Report::from(&records).write_to_path(memtrace::DEFAULT_FILE_NAME)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[must_use = "the tracer is uninstalled when the session is dropped"]
pub struct TraceSession {
    dispatcher: Arc<Dispatcher>,
    was_tracking_sites: bool,
    installed: bool,
}

impl TraceSession {
    pub fn install(config: TracerConfig) -> Result<Self, InstallError> {
        Self::install_with(Dispatcher::new(config)?)
    }

    /// Install a dispatcher that was already set up, e.g. with a custom platform.
    pub fn install_with(dispatcher: Dispatcher) -> Result<Self, InstallError> {
        let dispatcher = Arc::new(dispatcher);

        {
            let mut active = ACTIVE_DISPATCHER.write();
            if active.is_some() {
                return Err(InstallError::AlreadyInstalled);
            }
            *active = Some(dispatcher.clone());
        }

        if !mt_memory::is_installed() {
            mt_log::warn_once!(
                "mt_memory::TrackingAllocator is not the global allocator; calls will not be measured"
            );
        }
        let was_tracking_sites = mt_memory::set_tracking_sites(true);

        mt_log::debug!("Trace session installed");

        Ok(Self {
            dispatcher,
            was_tracking_sites,
            installed: true,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// A copy of the records so far. The session keeps running.
    pub fn records(&self) -> RecordStore {
        self.dispatcher.records()
    }

    /// Uninstall, forget calls that never returned, and hand over the records.
    pub fn finish(mut self) -> RecordStore {
        self.uninstall();
        self.dispatcher.take_records()
    }

    fn uninstall(&mut self) {
        if !self.installed {
            return;
        }
        self.installed = false;

        {
            let mut active = ACTIVE_DISPATCHER.write();
            if active
                .as_ref()
                .is_some_and(|active| Arc::ptr_eq(active, &self.dispatcher))
            {
                *active = None;
            }
        }

        if let Some(stats) = mt_memory::tracking_stats(5) {
            for site in &stats.top_sites {
                mt_log::debug!(
                    "{}: {} B in {} allocation(s)",
                    site.site,
                    site.extant_bytes,
                    site.extant_count
                );
            }
        }
        mt_memory::set_tracking_sites(self.was_tracking_sites);
        self.dispatcher.expire_abandoned();

        let (live_allocs, live_bytes) = mt_memory::global_allocs_and_bytes();
        mt_log::debug!(
            "Trace session uninstalled. {live_bytes} B in {live_allocs} allocation(s), resident: {:?} B",
            mt_memory::bytes_resident()
        );
    }
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        self.uninstall();
    }
}

impl std::fmt::Debug for TraceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceSession")
            .field("root", self.dispatcher.root())
            .field("installed", &self.installed)
            .finish()
    }
}

/// Tests that install a session must hold this, since there is only one slot per process.
#[cfg(test)]
pub(crate) static TEST_SESSION_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::snapshot_source::FakeSnapshots;

    fn dispatcher() -> Dispatcher {
        Dispatcher::with_platform(
            TracerConfig::new(env!("CARGO_MANIFEST_DIR")),
            FakeSnapshots::default(),
            FakeClock::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_single_session() {
        let _lock = TEST_SESSION_LOCK.lock();

        let session = TraceSession::install_with(dispatcher()).unwrap();
        assert!(is_tracing());
        assert!(matches!(
            TraceSession::install_with(dispatcher()),
            Err(InstallError::AlreadyInstalled)
        ));
        assert!(is_tracing(), "failed install leaves the first one alone");

        drop(session);
        assert!(!is_tracing());

        let session = TraceSession::install_with(dispatcher()).unwrap();
        assert!(session.finish().is_empty());
        assert!(!is_tracing());
    }

    #[test]
    fn test_site_tracking_is_restored() {
        let _lock = TEST_SESSION_LOCK.lock();

        let before = mt_memory::is_tracking_sites();
        let session = TraceSession::install_with(dispatcher()).unwrap();
        assert!(mt_memory::is_tracking_sites());
        drop(session);
        assert_eq!(mt_memory::is_tracking_sites(), before);
    }

    #[test]
    fn test_bad_root() {
        let _lock = TEST_SESSION_LOCK.lock();

        let err = TraceSession::install(TracerConfig::new("/no/such/root/anywhere")).unwrap_err();
        assert!(matches!(err, InstallError::Config(ConfigError::InvalidRoot { .. })));
        assert!(!is_tracing());
    }
}
