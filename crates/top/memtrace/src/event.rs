//! What the host runtime tells us about calls and returns.

use std::borrow::Cow;

/// Name → rendered value of the arguments of one call, in parameter order.
pub type Arguments = indexmap::IndexMap<String, String>;

/// The kind of a [`TraceEvent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Call,
    Return,

    /// The activation is being left because of a panic (or a raised exception in other hosts).
    ExceptionReturn,

    /// A new line is about to execute. Only delivered when line timing is requested.
    Line,

    /// Anything else the host wants to tell us about.
    Other,
}

/// Identifies one live activation of a function.
///
/// Two recursive (or concurrent) calls of the same function get different ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActivationId(pub u64);

impl nohash_hasher::IsEnabled for ActivationId {}

impl std::fmt::Display for ActivationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A function, the file it is defined in, and the line it is defined on.
///
/// This is also the key that measurements are aggregated under.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeLocation {
    pub function: Cow<'static, str>,
    pub file: Cow<'static, str>,
    pub line: u32,
}

impl CodeLocation {
    pub fn new(
        function: impl Into<Cow<'static, str>>,
        file: impl Into<Cow<'static, str>>,
        line: u32,
    ) -> Self {
        Self {
            function: function.into(),
            file: file.into(),
            line,
        }
    }
}

impl std::fmt::Display for CodeLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}:{})", self.function, self.file, self.line)
    }
}

/// What the tracer needs to know about the activation an event belongs to.
///
/// Each host implements this; the tracer never looks at frames any other way.
pub trait FrameIntrospect {
    /// Where the activation's function is defined.
    fn current_location(&self) -> CodeLocation;

    /// The current argument bindings of the activation.
    fn current_arguments(&self) -> Arguments;
}

/// One call/return (or other) event delivered by the host.
#[derive(Clone, Copy)]
pub struct TraceEvent<'a> {
    pub kind: EventKind,
    pub activation: ActivationId,
    pub frame: &'a dyn FrameIntrospect,

    /// What the activation returned, for [`EventKind::Return`].
    pub returned: Option<&'a dyn mt_byte_size::SizeBytes>,
}

impl<'a> TraceEvent<'a> {
    pub fn call(activation: ActivationId, frame: &'a dyn FrameIntrospect) -> Self {
        Self {
            kind: EventKind::Call,
            activation,
            frame,
            returned: None,
        }
    }

    pub fn ret(
        activation: ActivationId,
        frame: &'a dyn FrameIntrospect,
        returned: Option<&'a dyn mt_byte_size::SizeBytes>,
    ) -> Self {
        Self {
            kind: EventKind::Return,
            activation,
            frame,
            returned,
        }
    }

    pub fn other(kind: EventKind, activation: ActivationId, frame: &'a dyn FrameIntrospect) -> Self {
        Self {
            kind,
            activation,
            frame,
            returned: None,
        }
    }
}

impl std::fmt::Debug for TraceEvent<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceEvent")
            .field("kind", &self.kind)
            .field("activation", &self.activation)
            .field("location", &self.frame.current_location())
            .field("returned", &self.returned.map(|r| r.total_size_bytes()))
            .finish()
    }
}
