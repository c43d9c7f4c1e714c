/// Command-line entry point for sshdeck
///
/// This is a thin wrapper that delegates to the library crate.
/// Argument parsing and the session REPL live in `cli.rs`.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sshdeck_lib::cli::run().await
}
