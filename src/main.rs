use std::io::{BufRead, Write};

use log::error;

use vellum::{
    cli::{Command, Shell},
    utils::init_log,
    Config, Database,
};

/// `vellum-cli <config-file> [command...]`
///
/// With a command on the argument list it runs once and exits; without
/// one it reads commands from stdin. Exit code 0 on success, nonzero
/// on any recovery or integrity failure.
fn main() {
    init_log();
    std::process::exit(run());
}

fn run() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = match args.first() {
        Some(p) => p.clone(),
        None => {
            eprintln!("usage: vellum-cli <config-file> [command...]");
            return 2;
        }
    };

    let text = match std::fs::read_to_string(&config_path) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("cannot read {}: {}", config_path, e);
            return 2;
        }
    };
    let config = match Config::parse(&text) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("bad configuration: {}", e);
            return 2;
        }
    };

    if let Err(e) = Database::init(config) {
        error!("recovery failed: {}", e);
        eprintln!("recovery failed: {}", e);
        return 1;
    }

    let mut shell = Shell::new();
    let status;

    if args.len() > 1 {
        let line = args[1..].join(" ");
        status = dispatch_line(&mut shell, &line);
    } else {
        status = repl(&mut shell);
    }

    if let Err(e) = Database::close() {
        eprintln!("close failed: {}", e);
        return 1;
    }
    status
}

fn repl(shell: &mut Shell) -> i32 {
    let stdin = std::io::stdin();
    let mut worst = 0;

    print!("> ");
    let _ = std::io::stdout().flush();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            print!("> ");
            let _ = std::io::stdout().flush();
            continue;
        }
        if matches!(Command::parse(line.trim()), Ok(Command::Quit)) {
            break;
        }
        let status = dispatch_line(shell, line.trim());
        worst = worst.max(status);
        print!("> ");
        let _ = std::io::stdout().flush();
    }
    worst
}

fn dispatch_line(shell: &mut Shell, line: &str) -> i32 {
    let command = match Command::parse(line) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            return 2;
        }
    };
    match shell.dispatch(command) {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
            0
        }
        Err(e) => {
            eprintln!("{}", e);
            1
        }
    }
}
