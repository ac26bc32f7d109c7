use std::{env, process::exit};
use tracing_subscriber::EnvFilter;

use armature::host::NativeHost;
use armature::vm::{self, Vm};

struct Opts {
    /// Install directory package-relative paths resolve against.
    root: String,

    /// The program image to run.
    program: String,
}

fn main() {
    setup_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: armature [--root <dir>] [--] <program>");
        exit(1);
    }
    let opts = parse_opts(&args);

    let host = NativeHost::new(&opts.root);
    let mut vm = match Vm::new(Box::new(host)) {
        Ok(vm) => vm,
        Err(err) => {
            eprintln!("error: {err}");
            exit(1);
        }
    };
    vm::set_current(&mut vm as *mut Vm);

    let Some(lib) = vm.load(&opts.program) else {
        eprintln!("error: couldn't load {}", opts.program);
        exit(1);
    };
    if let Err(err) = vm.execute_image(&lib) {
        eprintln!("error: {err}");
        exit(1);
    }
}

fn parse_opts(args: &[String]) -> Opts {
    let mut root = String::from(".");
    let mut program = String::new();
    let mut i = 1; // Skip program name
    while i < args.len() {
        if args[i] == "--root" {
            if i + 1 < args.len() {
                root = args[i + 1].clone();
                i += 2;
            } else {
                eprintln!("error: --root requires a value");
                exit(1);
            }
        } else if args[i] == "--" {
            if i + 1 < args.len() {
                program = args[i + 1].clone();
            }
            break;
        } else if program.is_empty() {
            program = args[i].clone();
            break;
        } else {
            i += 1;
        }
    }
    if program.is_empty() {
        eprintln!("usage: armature [--root <dir>] [--] <program>");
        exit(1);
    }
    Opts { root, program }
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}
