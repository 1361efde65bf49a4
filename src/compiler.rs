//! The narrow interface the pipeline consumes compiler plugins through
//! (spec.md §1: "The pipeline consumes them through a single narrow interface
//! (§6)"; §6's plugin ABI: `ICompileOperation`/`CreateCompileOperation`).
//!
//! In-process compilers (tests, statically-linked delegates) implement
//! [`CompilerDelegate`] directly; [`crate::plugin::abi`] implements it as a thin
//! wrapper over a dynamically-loaded library's exported `CreateCompileOperation`.

use crate::artifact::chunkfile::Chunk;
use crate::depval::DependentFileState;
use crate::error::Result;

/// One named output of a [`CompileOperation`] (spec.md §6: "`GetTargets() →
/// [(type_code, name), …]`").
#[derive(Debug, Clone)]
pub struct CompileTarget {
    pub type_code: u64,
    pub name: String,
}

/// The object returned by a compiler plugin for one request (spec.md §3, §6).
pub trait CompileOperation: Send {
    fn targets(&self) -> Vec<CompileTarget>;

    /// Serializes target `index` into its output chunks (spec.md §6:
    /// "`SerializeTarget(i) → [(type_code, version, name, blob), …]`").
    fn serialize_target(&self, index: usize) -> Result<Vec<Chunk>>;

    /// Source files this operation consumed (spec.md §6: "`GetDependencies() →
    /// [DependentFileState, …]`").
    fn dependencies(&self) -> Vec<DependentFileState>;
}

/// The closure registered with the registry that, given initializers, returns a
/// compile operation (GLOSSARY: "Compiler delegate").
pub trait CompilerDelegate: Send + Sync {
    fn create_compile_operation(&self, initializers: &[String]) -> Result<Box<dyn CompileOperation>>;
}

impl<F> CompilerDelegate for F
where
    F: Fn(&[String]) -> Result<Box<dyn CompileOperation>> + Send + Sync,
{
    fn create_compile_operation(&self, initializers: &[String]) -> Result<Box<dyn CompileOperation>> {
        self(initializers)
    }
}
