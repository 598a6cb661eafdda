use crate::context::Context;
use crate::diagnostic::DiagnosticRecord;
use crate::error::KilnError;
use crate::scheduler::PumpStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationArtifact {
    /// Empty unless compilation succeeded.
    pub wasm: Vec<u8>,
    pub diagnostics: Vec<DiagnosticRecord>,
}

impl CompilationArtifact {
    pub fn succeeded(&self) -> bool {
        !self.wasm.is_empty()
    }
}

/// Compile a single source text with default options.
pub fn compile_wasm(source: &str) -> Result<CompilationArtifact, KilnError> {
    let mut context = Context::new();
    context.add_injected(source)?;
    Ok(finish(context))
}

/// Pump a configured context to completion and collect its results.
pub fn finish(mut context: Context) -> CompilationArtifact {
    let status = context.run_to_completion();
    let wasm = match status {
        PumpStatus::Done => context.output().map(<[u8]>::to_vec).unwrap_or_default(),
        _ => Vec::new(),
    };
    CompilationArtifact {
        wasm,
        diagnostics: context.diagnostics().cloned().collect(),
    }
}
