//! Queue Admin CLI - Entry Point
//!
//! Operator tooling for the job queue runtime.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    fpl_queue_admin::run().await
}
