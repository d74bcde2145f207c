//! Call probes: how Rust code reports its own calls and returns.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use mt_byte_size::SizeBytes;
use mt_memory::{Site, SiteScope};

use crate::dispatcher::{Disposition, Dispatcher};
use crate::event::{ActivationId, Arguments, CodeLocation, EventKind, FrameIntrospect, TraceEvent};

static NEXT_ACTIVATION: AtomicU64 = AtomicU64::new(1);

/// Reports one activation of a function to the installed [`crate::TraceSession`].
///
/// Created by [`crate::trace_call!`]. Emits a call event when created and a return event
/// on [`Self::finish`] or drop (an exception-return if the thread is panicking).
/// While alive, allocations of this thread are attributed to the function's definition site.
///
/// Does nothing, and renders no arguments, when no session is installed
/// or the function is not traced.
#[must_use = "the call ends when the probe is dropped"]
pub struct CallProbe {
    active: Option<ActiveProbe>,
}

struct ActiveProbe {
    dispatcher: Arc<Dispatcher>,
    activation: ActivationId,
    frame: ProbeFrame,
    site: SiteScope,
}

struct ProbeFrame {
    location: CodeLocation,
    arguments: Arguments,
}

impl FrameIntrospect for ProbeFrame {
    fn current_location(&self) -> CodeLocation {
        self.location.clone()
    }

    fn current_arguments(&self) -> Arguments {
        self.arguments.clone()
    }
}

impl CallProbe {
    /// A probe that does nothing.
    pub const fn inactive() -> Self {
        Self { active: None }
    }

    pub fn enter(location: CodeLocation, arguments: impl FnOnce() -> Arguments) -> Self {
        let Some(dispatcher) = crate::session::active_dispatcher() else {
            return Self::inactive();
        };
        // The first look at a file fills the dispatcher's verdict cache.
        if !mt_memory::untracked(|| dispatcher.is_traced(&location)) {
            return Self::inactive();
        }

        let activation = ActivationId(NEXT_ACTIVATION.fetch_add(1, Ordering::Relaxed));
        let frame = mt_memory::untracked(|| ProbeFrame {
            location,
            arguments: arguments(),
        });

        if dispatcher.dispatch(&TraceEvent::call(activation, &frame)) != Disposition::Began {
            return Self::inactive();
        }

        let site = mt_memory::untracked(|| {
            SiteScope::enter(Site::new(&*frame.location.file, frame.location.line))
        });

        Self {
            active: Some(ActiveProbe {
                dispatcher,
                activation,
                frame,
                site,
            }),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// End the call, reporting the size of what it returns.
    pub fn finish<R: SizeBytes>(mut self, value: R) -> R {
        if let Some(active) = self.active.take() {
            active.leave(EventKind::Return, Some(&value));
        }
        value
    }
}

impl ActiveProbe {
    fn leave(self, kind: EventKind, returned: Option<&dyn SizeBytes>) {
        let Self {
            dispatcher,
            activation,
            frame,
            site,
        } = self;
        drop(site);

        let event = TraceEvent {
            kind,
            activation,
            frame: &frame,
            returned,
        };
        dispatcher.dispatch(&event);

        mt_memory::untracked(|| drop(frame));
    }
}

impl Drop for CallProbe {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            let kind = if std::thread::panicking() {
                EventKind::ExceptionReturn
            } else {
                EventKind::Return
            };
            active.leave(kind, None);
        }
    }
}

impl std::fmt::Debug for CallProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.active {
            Some(active) => f
                .debug_struct("CallProbe")
                .field("activation", &active.activation)
                .field("location", &active.frame.location)
                .finish(),
            None => f.write_str("CallProbe(inactive)"),
        }
    }
}

/// Strip the helper-function suffix from a `type_name` of a function item.
#[doc(hidden)]
pub fn clean_function_name(name: &'static str) -> &'static str {
    let name = name.strip_suffix("::__f").unwrap_or(name);
    let mut name = name;
    while let Some(stripped) = name.strip_suffix("::{{closure}}") {
        name = stripped;
    }
    name
}

/// The path of the enclosing function, e.g. `my_crate::cache::Cache::insert`.
#[macro_export]
macro_rules! current_function_name {
    () => {{
        fn __f() {}
        $crate::__clean_function_name(::std::any::type_name_of_val(&__f))
    }};
}

/// Report the current call to the installed trace session.
///
/// Returns a [`CallProbe`]; the call ends when the probe is dropped or
/// [`CallProbe::finish`]ed with the return value. List the arguments to record;
/// they are rendered with `Debug`, and only if the call is actually traced.
///
/// ```
/// fn fib(n: u64) -> u64 {
///     let probe = memtrace::trace_call!(n);
///     let result = if n < 2 { n } else { fib(n - 1) + fib(n - 2) };
///     probe.finish(result)
/// }
/// # assert_eq!(fib(10), 55);
/// ```
#[macro_export]
macro_rules! trace_call {
    ($($arg:ident),* $(,)?) => {
        $crate::CallProbe::enter(
            $crate::CodeLocation::new($crate::current_function_name!(), file!(), line!()),
            || {
                <$crate::Arguments as ::std::iter::FromIterator<(
                    ::std::string::String,
                    ::std::string::String,
                )>>::from_iter([$((
                    ::std::string::String::from(stringify!($arg)),
                    format!("{:?}", $arg),
                )),*])
            },
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::config::TracerConfig;
    use crate::session::{TEST_SESSION_LOCK, TraceSession};
    use crate::snapshot_source::FakeSnapshots;

    fn session() -> TraceSession {
        let dispatcher = Dispatcher::with_platform(
            TracerConfig::new(env!("CARGO_MANIFEST_DIR")).with_settle_delays(
                std::time::Duration::ZERO,
                std::time::Duration::ZERO,
            ),
            FakeSnapshots::default(),
            FakeClock::default(),
        )
        .unwrap();
        TraceSession::install_with(dispatcher).unwrap()
    }

    fn square(x: u64) -> u64 {
        let probe = crate::trace_call!(x);
        probe.finish(x * x)
    }

    #[test]
    fn test_function_name() {
        assert_eq!(
            crate::current_function_name!(),
            "memtrace::probe::tests::test_function_name"
        );
        let in_closure = || crate::current_function_name!();
        assert_eq!(in_closure(), "memtrace::probe::tests::test_function_name");
    }

    #[test]
    fn test_no_session_is_noop() {
        let _lock = TEST_SESSION_LOCK.lock();

        let rendered = std::cell::Cell::new(false);
        let probe = CallProbe::enter(CodeLocation::new("f", file!(), line!()), || {
            rendered.set(true);
            Arguments::default()
        });
        assert!(!probe.is_active());
        assert!(!rendered.get());
        assert_eq!(square(3), 9);
    }

    #[test]
    fn test_traced_call_is_recorded() {
        let _lock = TEST_SESSION_LOCK.lock();

        let session = session();
        assert_eq!(square(7), 49);
        assert_eq!(square(2), 4);
        let records = session.finish();

        assert_eq!(records.len(), 1);
        let record = records.iter().next().unwrap();
        assert_eq!(record.key.function, "memtrace::probe::tests::square");
        assert_eq!(record.key.file, file!());
        assert_eq!(record.arguments["x"], "2");
        assert_eq!(record.returned_size, 8);
    }

    #[test]
    fn test_untraced_location_skips_arguments() {
        let _lock = TEST_SESSION_LOCK.lock();

        let session = session();
        let probe = CallProbe::enter(CodeLocation::new("f", "/elsewhere/f.rs", 1), || {
            panic!("arguments of untraced calls are never rendered")
        });
        assert!(!probe.is_active());
        drop(probe);
        assert!(session.finish().is_empty());
    }

    #[test]
    fn test_panic_abandons_call() {
        let _lock = TEST_SESSION_LOCK.lock();

        let session = session();
        let result = std::panic::catch_unwind(|| {
            let _probe = crate::trace_call!();
            panic!("boom");
        });
        assert!(result.is_err());

        assert_eq!(session.dispatcher().active_activations(), 1);
        assert!(session.finish().is_empty());
    }

    #[test]
    fn test_drop_without_finish_is_return() {
        let _lock = TEST_SESSION_LOCK.lock();

        let session = session();
        {
            let _probe = crate::trace_call!();
        }
        let records = session.finish();
        assert_eq!(records.len(), 1);
        assert_eq!(records.iter().next().unwrap().returned_size, 0);
    }
}
