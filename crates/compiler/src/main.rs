//! Molt compiler CLI
//!
//! Thin front over the library pipeline: build native executables,
//! build sandbox packages, or emit intermediate IR for inspection.
//! Heavy front-end concerns (lockfiles, registry upload, signing) live
//! in the outer tooling, not here.

use std::io;
use std::path::PathBuf;
use std::process;

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{generate, Shell};

use moltc::{BuildConfig, Target};

#[derive(ClapParser)]
#[command(name = "moltc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Molt compiler - build native executables and sandbox modules", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a source file to a native executable
    Build {
        /// Input source file
        input: PathBuf,

        /// Output path (defaults to the input stem)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Build manifest (TOML) with capabilities and module metadata
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Type Facts Artifact from an external checker
        #[arg(long = "type-facts", value_name = "PATH")]
        type_facts: Option<PathBuf>,

        /// Treat type facts as assertions (mismatch fails the build)
        #[arg(long)]
        strict_facts: bool,

        /// Keep the intermediate .ll file
        #[arg(long)]
        keep_ir: bool,
    },

    /// Compile a source file to a sandbox package (module + manifest)
    Module {
        /// Input source file
        input: PathBuf,

        /// Output package path (defaults to the input stem + .moltpkg)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Build manifest (TOML)
        #[arg(long)]
        manifest: Option<PathBuf>,
    },

    /// Emit LLVM IR text for inspection
    EmitIr {
        /// Input source file
        input: PathBuf,

        /// Build manifest (TOML)
        #[arg(long)]
        manifest: Option<PathBuf>,
    },

    /// Generate shell completion scripts
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn load_config(manifest: Option<&PathBuf>) -> BuildConfig {
    let config = match manifest {
        Some(path) => {
            let text = std::fs::read_to_string(path).unwrap_or_else(|e| {
                eprintln!("error: cannot read manifest '{}': {}", path.display(), e);
                process::exit(molt_core::EXIT_COMPILE);
            });
            BuildConfig::from_toml(&text).unwrap_or_else(|e| {
                eprintln!("error: {}", e);
                process::exit(molt_core::EXIT_COMPILE);
            })
        }
        None => BuildConfig::default(),
    };
    config.apply_env()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Build {
            input,
            output,
            manifest,
            type_facts,
            strict_facts,
            keep_ir,
        } => {
            let mut config = load_config(manifest.as_ref());
            config.target = Target::Native;
            config.keep_ir = keep_ir;
            if let Some(facts) = type_facts {
                config.facts_path = Some(facts);
            }
            if strict_facts {
                config.strict_facts = true;
            }
            let output = output.unwrap_or_else(|| {
                input
                    .file_stem()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("a.out"))
            });
            if let Err(e) = moltc::build_native_executable(&input, &output, &config) {
                eprintln!("error: {}", e);
                process::exit(molt_core::EXIT_COMPILE);
            }
            println!("built {}", output.display());
        }
        Commands::Module {
            input,
            output,
            manifest,
        } => {
            let mut config = load_config(manifest.as_ref());
            config.target = Target::Sandbox;
            let output = output.unwrap_or_else(|| {
                let mut p = input
                    .file_stem()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("module"));
                p.set_extension("moltpkg");
                p
            });
            match moltc::build_sandbox_package(&input, &output, &config) {
                Ok(checksum) => {
                    println!("built {} (sha256 {})", output.display(), checksum)
                }
                Err(e) => {
                    eprintln!("error: {}", e);
                    process::exit(molt_core::EXIT_COMPILE);
                }
            }
        }
        Commands::EmitIr { input, manifest } => {
            let config = load_config(manifest.as_ref());
            let source = std::fs::read_to_string(&input).unwrap_or_else(|e| {
                eprintln!("error: cannot read '{}': {}", input.display(), e);
                process::exit(molt_core::EXIT_COMPILE);
            });
            match moltc::compile_to_ir(&source, &config) {
                Ok(ir) => print!("{}", ir),
                Err(e) => {
                    eprintln!("error: {}", e);
                    process::exit(molt_core::EXIT_COMPILE);
                }
            }
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
        }
    }
}
