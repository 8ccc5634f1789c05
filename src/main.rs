use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match wpheal::cli::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            ExitCode::from(wpheal::errors::get_exit_code(&e))
        }
    }
}
