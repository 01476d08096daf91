use std::cell::RefCell;
use std::io::BufRead;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{bail, Result};
use structopt::StructOpt;

use flowc::diagnostics::{shared, Report};
use flowc::interpreter::Interpreter;
use flowc::types::LiteralType;
use flowc::vm::instruction::disassemble_one;
use flowc::vm::runner::NO_QUOTA;
use flowc::vm::runtime::Runtime;

#[derive(Debug, StructOpt)]
#[structopt(name = "flowc", about = "Compiler and VM for the Flow DSL")]
struct Opt {
    /// Path to the Flow program to execute
    #[structopt(name = "PROGRAM_FILE", short = "f", long = "file")]
    file: Option<PathBuf>,

    /// Optimization level; 0 disables all passes
    #[structopt(short = "O", long = "optimize", default_value = "1")]
    optimize: i32,

    /// Prints the program IR and exits
    #[structopt(long = "dump-ir")]
    dump_ir: bool,

    /// Prints the program target code and exits
    #[structopt(long = "dump-tc")]
    dump_tc: bool,

    /// Prints target code during execution
    #[structopt(long = "trace")]
    trace: bool,

    /// Input files handed to the program line by line
    #[structopt(name = "INPUT_FILE")]
    inputs: Vec<PathBuf>,
}

fn main() {
    let opts = Opt::from_args();
    if let Err(e) = run(&opts) {
        eprintln!("flowc: {}", e);
        std::process::exit(1);
    }
}

fn run(opts: &Opt) -> Result<()> {
    let file = match &opts.file {
        Some(file) => file,
        None => bail!("missing program file (-f PROGRAM_FILE)"),
    };

    let current_line: Rc<RefCell<String>> = Rc::new(RefCell::new(String::new()));
    let mut interp = Interpreter::new(demo_runtime(current_line.clone()));

    let report = shared(Report::console());
    if !interp.compile_file(file, &report, opts.optimize)? {
        bail!("failed to compile {}", file.display());
    }

    if opts.dump_ir {
        print!("{}", interp.program_ir().unwrap().dump());
        return Ok(());
    }
    if opts.dump_tc {
        print!("{}", interp.program().unwrap().dump());
        return Ok(());
    }

    if opts.inputs.is_empty() {
        run_handler(&interp, "main", opts.trace);
        return Ok(());
    }

    // line-processing mode: initially / process-per-line / finally
    run_handler(&interp, "initially", opts.trace);
    for input in &opts.inputs {
        let source = std::fs::File::open(input)?;
        for line in std::io::BufReader::new(source).lines() {
            *current_line.borrow_mut() = line?;
            run_handler(&interp, "process", opts.trace);
        }
    }
    run_handler(&interp, "finally", opts.trace);

    Ok(())
}

fn run_handler(interp: &Interpreter, name: &str, trace: bool) -> bool {
    if trace {
        interp.run_with(
            name,
            NO_QUOTA,
            Some(Box::new(|instr, ip, sp| {
                eprintln!("  [{:>4} sp={}] {}", ip, sp, disassemble_one(instr));
            })),
        )
    } else {
        interp.run(name)
    }
}

fn demo_runtime(current_line: Rc<RefCell<String>>) -> Runtime {
    let mut runtime = Runtime::new();

    runtime
        .register_function("LINE", LiteralType::String)
        .bind(move |params| {
            let line = current_line.borrow().clone();
            params.set_result(line);
        });

    runtime
        .register_function("print", LiteralType::Void)
        .param("text", LiteralType::String)
        .bind(|params| {
            println!("{}", params.get_string(1));
        });

    runtime
        .register_function("log", LiteralType::Void)
        .param("message", LiteralType::String)
        .bind(|params| {
            eprintln!("{}", params.get_string(1));
        });

    runtime
        .register_function("assert", LiteralType::Number)
        .param("condition", LiteralType::Boolean)
        .param_with_default("description", LiteralType::String, "")
        .bind(|params| {
            if !params.get_bool(1) {
                let description = params.get_string(2).to_string();
                if description.is_empty() {
                    eprintln!("Assertion failed.");
                } else {
                    eprintln!("Assertion failed ({}).", description);
                }
            }
            let ok = params.get_bool(1) as i64;
            params.set_result(ok);
        });

    runtime
        .register_handler("done")
        .bind(|params| params.set_result(true));

    runtime
}
