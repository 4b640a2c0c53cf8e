use clap::Parser;
use funee::BundleRequest;
use std::process::ExitCode;

/// Bundle and run funee programs.
#[derive(Debug, Parser)]
#[command(name = "funee", version, about = "Bundle and run a funee program")]
struct Cli {
    /// Entry module: a file path or an http(s) URL.
    entry: String,

    /// Write the bundled script to stdout instead of running it.
    #[arg(long)]
    emit: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let entry = if cli.entry.starts_with("http://") || cli.entry.starts_with("https://") {
        cli.entry.clone()
    } else {
        match std::fs::canonicalize(&cli.entry) {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(e) => {
                eprintln!("error: cannot resolve {}: {}", cli.entry, e);
                return ExitCode::from(1);
            }
        }
    };

    let request = match BundleRequest::new(entry) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(1);
        }
    };

    let code = match request.emit() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(1);
        }
    };

    if cli.emit {
        println!("{}", code);
        return ExitCode::SUCCESS;
    }

    match funee::host::run_bundle(&code) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::from(2)
        }
    }
}
