use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

/// A source location that allocations are attributed to.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Site {
    file: Arc<str>,
    line: u32,
}

impl Site {
    /// File name used for allocations made outside of any [`SiteScope`].
    pub const UNATTRIBUTED_FILE: &'static str = "<unattributed>";

    pub fn new(file: impl Into<Arc<str>>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }

    /// Where allocations go when no [`SiteScope`] is active on the allocating thread.
    pub fn unattributed() -> Self {
        Self::new(Self::UNATTRIBUTED_FILE, 0)
    }

    #[inline]
    pub fn file(&self) -> &str {
        &self.file
    }

    #[inline]
    pub fn line(&self) -> u32 {
        self.line
    }

    #[inline]
    pub fn is_unattributed(&self) -> bool {
        &*self.file == Self::UNATTRIBUTED_FILE
    }
}

impl std::fmt::Display for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

// ----------------------------------------------------------------------------

/// Index into the site table of the allocation tracker.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct SiteId(pub(crate) u32);

impl SiteId {
    pub(crate) const UNATTRIBUTED: Self = Self(0);
}

thread_local! {
    /// The site that allocations on this thread are currently attributed to.
    ///
    /// This is read from inside the global allocator, so it must never allocate.
    static CURRENT_SITE: Cell<SiteId> = const { Cell::new(SiteId::UNATTRIBUTED) };
}

pub(crate) fn current_site() -> SiteId {
    CURRENT_SITE
        .try_with(Cell::get)
        .unwrap_or(SiteId::UNATTRIBUTED)
}

/// Attributes allocations made by this thread to a [`Site`] while alive.
///
/// Scopes nest: dropping one restores whatever site was active before it.
/// A scope is bound to the thread that created it.
#[must_use = "allocations are only attributed while the scope is alive"]
pub struct SiteScope {
    previous: SiteId,
    _not_send: PhantomData<*const ()>,
}

impl SiteScope {
    pub fn enter(site: Site) -> Self {
        let id = crate::tracking_allocator::intern_site(site);
        let previous = CURRENT_SITE
            .try_with(|current| current.replace(id))
            .unwrap_or(SiteId::UNATTRIBUTED);

        Self {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for SiteScope {
    fn drop(&mut self) {
        CURRENT_SITE.try_with(|current| current.set(self.previous)).ok();
    }
}

impl std::fmt::Debug for SiteScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteScope")
            .field("previous", &self.previous)
            .finish()
    }
}
