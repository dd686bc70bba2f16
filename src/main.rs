use std::process::ExitCode;

fn main() -> ExitCode {
    match demo_sync::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
