//! Diagnostic sink collaborator.
//!
//! Every allocator event is forwarded to the `log` facade and, when one is
//! configured, to a caller-supplied [`DiagnosticSink`].

use alloc::sync::Arc;
use core::fmt;

#[cfg(feature = "log")]
use log::{debug, error, info, trace, warn};

/// Severity attached to every diagnostic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Trace => "TRACE",
            Severity::Debug => "DEBUG",
            Severity::Information => "INFORMATION",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

/// Receiver of human-readable allocator traces.
///
/// The sink has no way to report failure back: whatever it does with a
/// message, the allocation that produced it proceeds unchanged.
pub trait DiagnosticSink: Send + Sync {
    fn log(&self, severity: Severity, message: fmt::Arguments<'_>);
}

/// Fan-out of one diagnostic event to `log` and the optional sink.
#[derive(Clone, Default)]
pub(crate) struct Diagnostics {
    sink: Option<Arc<dyn DiagnosticSink>>,
}

impl Diagnostics {
    pub(crate) fn new(sink: Option<Arc<dyn DiagnosticSink>>) -> Self {
        Self { sink }
    }

    pub(crate) fn emit(&self, severity: Severity, message: fmt::Arguments<'_>) {
        match severity {
            Severity::Trace => {
                trace!("{}", message);
            }
            Severity::Debug => {
                debug!("{}", message);
            }
            Severity::Information => {
                info!("{}", message);
            }
            Severity::Warning => {
                warn!("{}", message);
            }
            Severity::Error | Severity::Critical => {
                error!("{}", message);
            }
        }
        if let Some(sink) = &self.sink {
            sink.log(severity, message);
        }
    }

    pub(crate) fn trace(&self, message: fmt::Arguments<'_>) {
        self.emit(Severity::Trace, message);
    }

    pub(crate) fn debug(&self, message: fmt::Arguments<'_>) {
        self.emit(Severity::Debug, message);
    }

    pub(crate) fn warning(&self, message: fmt::Arguments<'_>) {
        self.emit(Severity::Warning, message);
    }

    pub(crate) fn error(&self, message: fmt::Arguments<'_>) {
        self.emit(Severity::Error, message);
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::{String, ToString};
    use alloc::vec::Vec;
    use kspin::SpinNoIrq;

    struct Collect {
        lines: SpinNoIrq<Vec<(Severity, String)>>,
    }

    impl Collect {
        fn new() -> Self {
            Self {
                lines: SpinNoIrq::new(Vec::new()),
            }
        }
    }

    impl DiagnosticSink for Collect {
        fn log(&self, severity: Severity, message: fmt::Arguments<'_>) {
            self.lines.lock().push((severity, message.to_string()));
        }
    }

    #[test]
    fn test_emit_reaches_sink() {
        let sink = Arc::new(Collect::new());
        let diag = Diagnostics::new(Some(sink.clone()));

        diag.debug(format_args!("split block at {:#x}", 0x40));
        diag.error(format_args!("double free"));

        let lines = sink.lines.lock();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], (Severity::Debug, "split block at 0x40".to_string()));
        assert_eq!(lines[1].0, Severity::Error);
    }

    #[test]
    fn test_missing_sink_is_noop() {
        let diag = Diagnostics::default();
        diag.warning(format_args!("nobody listens"));
        diag.trace(format_args!("still fine"));
    }

    #[test]
    fn test_every_severity_reaches_sink() {
        let sink = Arc::new(Collect::new());
        let diag = Diagnostics::new(Some(sink.clone()));
        let all = [
            Severity::Trace,
            Severity::Debug,
            Severity::Information,
            Severity::Warning,
            Severity::Error,
            Severity::Critical,
        ];
        for severity in all {
            diag.emit(severity, format_args!("{}", severity));
        }

        let lines = sink.lines.lock();
        assert_eq!(lines.len(), all.len());
        for ((severity, line), expected) in lines.iter().zip(all) {
            assert_eq!(*severity, expected);
            assert_eq!(*line, expected.to_string());
        }
    }

    #[test]
    fn test_severity_order() {
        assert!(Severity::Trace < Severity::Debug);
        assert!(Severity::Error < Severity::Critical);
        assert_eq!(Severity::Warning.to_string(), "WARNING");
    }
}
