use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let code = hypergen::run().await;
    ExitCode::from(code.clamp(0, u8::MAX as i32) as u8)
}
