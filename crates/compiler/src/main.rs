//! `emberc` — compile and run a pre-read Ember source file (§6).
//!
//! Namespace loading by walking `require` against the filesystem is out of
//! scope (spec §1 treats file/module loading as external); `run` takes a
//! single source file as a stand-in for "the namespace is already loaded",
//! compiles every top-level form in it in order, binds
//! `*command-line-args*`, and invokes `<namespace>/main`.

use clap::{Parser as ClapParser, Subcommand};
use ember_core::config::Config;
use ember_core::{Heap, Symbol, Value};
use ember_runtime::namespace::{BindingStack, NamespaceRegistry};
use ember_runtime::vm::{Vm, VmError};
use ember_runtime::{exception, install_prelude};
use std::path::PathBuf;
use std::process;

#[derive(ClapParser)]
#[command(name = "emberc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Ember compiler and runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and run a namespace's `main`
    Run {
        /// Source file holding the namespace's forms
        source: PathBuf,

        /// Namespace the forms in `source` belong to
        namespace: String,

        /// Path to an ember.toml config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Arguments bound to *command-line-args* and passed to `main`
        args: Vec<String>,
    },
}

fn main() {
    tracing_subscriber::fmt::try_init().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { source, namespace, config, args } => {
            process::exit(run(&source, &namespace, config.as_deref(), args));
        }
    }
}

fn run(source: &std::path::Path, namespace: &str, config_path: Option<&std::path::Path>, args: Vec<String>) -> i32 {
    let cfg = match config_path {
        Some(path) => match Config::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("error reading config {}: {e}", path.display());
                return 3;
            }
        },
        None => Config::default(),
    };

    let text = match std::fs::read_to_string(source) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("error reading {}: {e}", source.display());
            return 3;
        }
    };

    let mut heap = Heap::new(cfg.gc_frequency);
    let meta = heap.bootstrap_meta_type();
    let mut registry = NamespaceRegistry::new();
    let mut bindings = BindingStack::new();
    let mut vm = Vm::new(&mut heap, cfg.max_call_depth);

    install_prelude(&mut heap, meta, &mut registry, namespace);

    let forms = match ember_reader::read_all(&mut heap, meta, &text) {
        Ok(fs) => fs,
        Err(e) => {
            eprintln!("read error in {}: {e}", source.display());
            return 3;
        }
    };

    for form in forms {
        let compiled = ember_compiler::compile_toplevel(&mut heap, meta, &mut registry, &mut bindings, &mut vm, &cfg, namespace, form);
        let thunk = match compiled {
            Ok(f) => f,
            Err(e) => {
                eprintln!("compile error: {}", describe(&heap, &e));
                return 3;
            }
        };
        if let Err(err) = vm.call(&mut heap, &registry, &mut bindings, thunk, vec![]) {
            return report_vm_error(&heap, err);
        }
    }

    let args_vec: ember_core::collections::vector::PersistentVector =
        args.iter().map(|a| Value::str(a.as_str())).collect();
    let args_value = heap.alloc_static(meta, ember_core::Payload::Vector(args_vec)).value();
    registry.define(&mut heap, meta, namespace, Symbol::unqualified("*command-line-args*"), args_value, Value::Nil);

    let Some(main_ref) = registry.resolve_var(namespace, Symbol::unqualified("main")) else {
        eprintln!("no {namespace}/main var defined");
        return 3;
    };
    let main_fn = ember_runtime::namespace::var_value(&heap, &bindings, main_ref);

    match vm.call(&mut heap, &registry, &mut bindings, main_fn, vec![]) {
        Ok(_) => 0,
        Err(e) => report_vm_error(&heap, e),
    }
}

fn report_vm_error(heap: &Heap, err: VmError) -> i32 {
    match err {
        VmError::Exception(v) => {
            eprintln!("uncaught exception: {}", describe(heap, &v));
            2
        }
        VmError::CorruptBytecode(msg) => {
            eprintln!("internal error: {msg}");
            3
        }
    }
}

fn describe(heap: &Heap, exc: &Value) -> String {
    let ty = exception::type_name_of(heap, exc).unwrap_or_else(|| "Exception".to_string());
    let msg = exception::message_of(heap, exc).unwrap_or_default();
    format!("{ty}: {msg}")
}
