//! Per-emulator diagnostic output on top of `tracing`.

use std::fmt;

use tracing::Span;

/// Diagnostic sink handed explicitly to the mapper and the engine.
///
/// Every event is recorded inside the logger's span so output from
/// concurrent emulators stays attributable. Silencing one logger leaves
/// the others untouched.
#[derive(Debug, Clone)]
pub struct Logger {
    output_disabled: bool,
    span: Span,
}

impl Default for Logger {
    fn default() -> Self {
        Self {
            output_disabled: false,
            span: Span::none(),
        }
    }
}

impl Logger {
    /// Creates a logger whose events are recorded under an `emulator` span
    /// naming `image`.
    #[must_use]
    pub fn for_image(image: &str) -> Self {
        Self {
            output_disabled: false,
            span: tracing::info_span!("emulator", image = %image),
        }
    }

    /// Creates a logger that drops every event.
    #[must_use]
    pub fn silent() -> Self {
        let mut logger = Self::default();
        logger.disable_output(true);
        logger
    }

    /// Suppresses (or re-enables) all output of this logger.
    pub const fn disable_output(&mut self, disabled: bool) {
        self.output_disabled = disabled;
    }

    /// Returns `true` when events are forwarded to `tracing`.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !self.output_disabled
    }

    /// Span events are recorded in.
    #[must_use]
    pub const fn span(&self) -> &Span {
        &self.span
    }

    /// Records an info-level event.
    pub fn info(&self, args: fmt::Arguments<'_>) {
        if self.is_enabled() {
            let _entered = self.span.enter();
            tracing::info!("{args}");
        }
    }

    /// Records a debug-level event.
    pub fn debug(&self, args: fmt::Arguments<'_>) {
        if self.is_enabled() {
            let _entered = self.span.enter();
            tracing::debug!("{args}");
        }
    }

    /// Records a warn-level event.
    pub fn warn(&self, args: fmt::Arguments<'_>) {
        if self.is_enabled() {
            let _entered = self.span.enter();
            tracing::warn!("{args}");
        }
    }
}
