use std::process::ExitCode;

fn main() -> ExitCode {
    objmon::cli::run_cli()
}
