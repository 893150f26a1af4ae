use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match sgz_assistant::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
