use std::process::ExitCode;

fn main() -> ExitCode {
    lanekeeper::run()
}
