use std::{env, fs, path::Path, process};

use cinder::{Compiler, Engine, Lexer, TokenKind, disassemble};

fn main() {
    let args: Vec<String> = env::args().collect();

    let tokens_only = args.contains(&"--tokens".to_string());
    let disasm_only = args.contains(&"--disasm".to_string());

    // first non-flag argument is the filename
    let filename = args.iter().skip(1).find(|a| !a.starts_with('-'));

    match filename {
        Some(filename) => {
            ensure_extension(filename);
            match fs::read_to_string(filename) {
                Ok(source) => {
                    if tokens_only {
                        dump_tokens(&source);
                    } else if disasm_only {
                        dump_bytecode(&source);
                    } else {
                        run_program(&source);
                    }
                }
                Err(e) => {
                    eprintln!("Failed to read '{}': {}", filename, e);
                    process::exit(1);
                }
            }
        }
        None => print_usage(),
    }
}

fn print_usage() {
    println!("CINDER - embeddable game scripting language");
    println!();
    println!("Usage:");
    println!("  cinder <file.cn>           Run a script");
    println!("  cinder --tokens <file.cn>  Show tokens only");
    println!("  cinder --disasm <file.cn>  Show compiled bytecode only");
}

fn ensure_extension(filename: &str) {
    let path = Path::new(filename);
    if path.extension().and_then(|e| e.to_str()) != Some("cn") {
        eprintln!("Error: expected a .cn file, got {}", filename);
        process::exit(1);
    }
}

fn dump_tokens(source: &str) {
    let mut lexer = Lexer::new(source);
    loop {
        match lexer.next() {
            Ok(token) => {
                println!("{:>4}:{:<3} {}", token.line, token.indent, token);
                if token.kind == TokenKind::EndOfFile {
                    break;
                }
            }
            Err(e) => {
                eprintln!("{}", e);
                process::exit(1);
            }
        }
    }
}

fn dump_bytecode(source: &str) {
    let mut lexer = Lexer::new(source);
    let mut compiler = Compiler::new();
    compiler.set_native_functions(["output"]);
    match compiler.compile(&mut lexer) {
        Ok(program) => print!("{}", disassemble(&program)),
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}

fn run_program(source: &str) {
    let mut engine = Engine::new();
    engine.add_native_function("output", |call| {
        let mut parts = Vec::new();
        for index in 0..call.parameter_count() {
            if call.is_string(index) {
                parts.push(call.get_string(index));
            } else if call.is_int(index) {
                parts.push(call.get_int(index).to_string());
            } else if call.is_float(index) {
                parts.push(call.get_float(index).to_string());
            } else {
                parts.push("none".to_string());
            }
        }
        println!("{}", parts.join(" "));
    });

    if let Err(e) = engine.run(source) {
        eprintln!("{}", e);
        process::exit(1);
    }
}
