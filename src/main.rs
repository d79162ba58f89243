use std::process::ExitCode;

fn main() -> ExitCode {
    weakrefs_conformance::run_cli()
}
