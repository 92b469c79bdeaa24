use std::process::ExitCode;

fn main() -> ExitCode {
    match worldline::run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error [{}]: {}", e.code(), e);
            ExitCode::FAILURE
        }
    }
}
