//! Molt compiler library
//!
//! The four-phase pipeline: frontend lowering (lexer, parser, HIR
//! desugar), typed SSA with inference/shapes/specialization, LIR with
//! explicit ownership, and the two backends. Every stage is a pure
//! function of its inputs plus the [`config::BuildConfig`] record, so
//! identical inputs and manifest produce identical artifacts.

pub mod artifact;
pub mod ast;
pub mod backend;
pub mod config;
pub mod diag;
pub mod hir;
pub mod lexer;
pub mod lir;
pub mod parser;
pub mod source;
pub mod tir;

pub use config::{BuildConfig, OptimizationLevel, Target};
pub use diag::{CompileError, Stage};

use std::collections::HashMap;
use std::path::Path;

use tir::infer::FuncSummary;

/// A fully lowered, verified program, ready for either backend.
#[derive(Debug)]
pub struct CompiledProgram {
    pub lir: lir::LirModule,
    pub inference: tir::infer::Inference,
    pub spec_table: tir::specialize::SpecTable,
}

/// Run the pipeline from source text through verified LIR.
pub fn compile_source(
    source: &str,
    file: &str,
    module_name: &str,
    config: &BuildConfig,
) -> Result<CompiledProgram, CompileError> {
    let ast = parser::parse(source, file, module_name)?;
    resolve_imports(&ast, config)?;
    let hir = hir::lower_module(&ast)?;
    tracing::debug!(
        functions = hir.functions.len(),
        classes = hir.classes.len(),
        "lowered {}",
        module_name
    );
    let mut tir_module = tir::build::build_module(&hir)?;

    let seeds: HashMap<String, FuncSummary> = match &config.facts_path {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| {
                CompileError::new(
                    Stage::Infer,
                    format!("cannot read type facts '{}': {}", path.display(), e),
                    None,
                )
            })?;
            tir::facts::parse_facts(&text)?
        }
        None => HashMap::new(),
    };

    check_capabilities(&tir_module, config)?;
    let mut inference = tir::infer::infer_module(&mut tir_module, &seeds, config.strict_facts)?;
    let spec_table = tir::specialize::specialize_module(&mut tir_module, &mut inference)?;
    tracing::debug!(
        variants = spec_table.variants.values().map(|v| v.len()).sum::<usize>(),
        shapes = tir_module.shapes.len(),
        "specialized {}",
        module_name
    );
    let mut lir_module = lir::lower::lower_module(&tir_module, &inference)?;
    lir::opt::optimize_module(&mut lir_module);
    lir::verify::verify_module(&lir_module)?;

    Ok(CompiledProgram {
        lir: lir_module,
        inference,
        spec_table,
    })
}

/// Eager import resolution: every imported module must resolve to a
/// file under the configured roots (searched in order). There is no
/// runtime string-to-module fallback.
fn resolve_imports(module: &ast::Module, config: &BuildConfig) -> Result<(), CompileError> {
    for import in &module.imports {
        let rel: std::path::PathBuf = import.split('.').collect();
        let found = config.module_roots.iter().any(|root| {
            root.join(&rel).with_extension("mt").is_file()
        });
        if !found {
            return Err(CompileError::new(
                Stage::Lower,
                format!(
                    "module '{}' not found under the configured module roots",
                    import
                ),
                None,
            ));
        }
    }
    Ok(())
}

/// Lowering rejects an intrinsic call whose capability is absent from
/// the build manifest; there is no implicit fallback.
fn check_capabilities(
    module: &tir::TirModule,
    config: &BuildConfig,
) -> Result<(), CompileError> {
    for f in &module.functions {
        for block in &f.blocks {
            for op in &block.ops {
                if let tir::OpKind::Intrinsic { id, .. } = &op.kind {
                    if let Some(missing) = config.caps.first_missing(id.def().caps) {
                        return Err(CompileError::at(
                            Stage::Lower,
                            op.span.clone(),
                            format!(
                                "{} requires capability '{}', which the build manifest does not grant",
                                id.name(),
                                missing.name()
                            ),
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Compile a source file to a native executable.
pub fn build_native_executable(
    source_path: &Path,
    output_path: &Path,
    config: &BuildConfig,
) -> Result<(), CompileError> {
    let source = std::fs::read_to_string(source_path).map_err(|e| {
        CompileError::new(
            Stage::Parse,
            format!("cannot read '{}': {}", source_path.display(), e),
            None,
        )
    })?;
    let module_name = source_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("main");
    let program = compile_source(
        &source,
        &source_path.display().to_string(),
        module_name,
        config,
    )?;
    backend::native::build_native(&program.lir, config, output_path)
}

/// Compile a source file to a sandbox module, its manifest, and a
/// package archive wrapping both. Returns the package checksum.
pub fn build_sandbox_package(
    source_path: &Path,
    output_path: &Path,
    config: &BuildConfig,
) -> Result<String, CompileError> {
    let source = std::fs::read_to_string(source_path).map_err(|e| {
        CompileError::new(
            Stage::Parse,
            format!("cannot read '{}': {}", source_path.display(), e),
            None,
        )
    })?;
    let module_name = source_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("main");
    let program = compile_source(
        &source,
        &source_path.display().to_string(),
        module_name,
        config,
    )?;
    let artifact = backend::sandbox::build_sandbox(&program.lir, config)?;
    let module_bytes = artifact
        .module
        .encode()
        .map_err(|e| CompileError::new(Stage::Backend, e, None))?;
    let manifest_json = artifact
        .manifest
        .to_json()
        .map_err(|e| CompileError::new(Stage::Backend, e, None))?;

    let mut package =
        artifact::PackageBuilder::new(&config.module_name, &config.module_version);
    package.add("module.bin", &module_bytes)?;
    package.add("manifest.json", manifest_json.as_bytes())?;
    package.write_to(output_path)
}

/// Emit LLVM IR text without invoking the system toolchain (tests,
/// inspection).
pub fn compile_to_ir(source: &str, config: &BuildConfig) -> Result<String, CompileError> {
    let program = compile_source(source, "<memory>", "main", config)?;
    backend::native::emit_ir(&program.lir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_end_to_end() {
        let config = BuildConfig::default();
        let program = compile_source("print(\"hello\")\n", "hello.mt", "hello", &config)
            .expect("pipeline");
        assert!(!program.lir.functions.is_empty());
    }

    #[test]
    fn test_compile_error_carries_location() {
        let config = BuildConfig::default();
        let err =
            compile_source("def f(s):\n    return eval(s)\n", "m.mt", "m", &config).unwrap_err();
        let span = err.span.expect("span");
        assert_eq!(span.line, 2);
    }

    #[test]
    fn test_identical_inputs_identical_ir() {
        let config = BuildConfig::default();
        let src = "def f(p):\n    return p[\"x\"] + p[\"y\"]\n\nr = f({\"x\": 3, \"y\": 4})\nprint(r)\n";
        let a = compile_to_ir(src, &config).unwrap();
        let b = compile_to_ir(src, &config).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_strict_facts_flow_through_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let facts = dir.path().join("facts.json");
        std::fs::write(
            &facts,
            r#"{"version":1,"facts":[{"symbol":"m.f","params":["Int"],"returns":"Int"}]}"#,
        )
        .unwrap();
        let mut config = BuildConfig::default();
        config.facts_path = Some(facts);
        config.strict_facts = true;
        // Calling f with a string contradicts the declared facts.
        let err = compile_source(
            "def f(a):\n    return a\n\nx = f(\"s\")\n",
            "m.mt",
            "m",
            &config,
        )
        .unwrap_err();
        assert_eq!(err.stage, Stage::Infer);
    }
}
