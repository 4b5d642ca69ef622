use std::time::Duration;

use tally::{Backend, Builder, CounterError};
use tempfile::tempdir;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // NOTE: Using a temporary directory for demonstration.
    let db_dir = tempdir()?.keep();

    println!("Opening counter log in {}", db_dir.display());
    // Environment first, then explicit overrides
    let counter = Builder::from_env()?
        .backend(Backend::Log)
        .data_dir(&db_dir)
        .table("votes")
        .key("poll-42")
        .bounds(0, 3)
        .max_retry_attempts(8)
        .base_delay(Duration::from_millis(20))
        .compaction_threshold(64 * 1024)
        .build()
        .await?;

    counter.provision(2).await?;

    let record = counter.increment().await?;
    println!("{} = {}", counter.key(), record.value);

    match counter.increment().await {
        Err(CounterError::Boundary { proposed, max, .. }) => {
            println!("rejected {proposed}: limit is {max}");
        }
        other => println!("unexpected: {other:?}"),
    }

    // Cleanup
    drop(counter);
    let _ = tokio::fs::remove_dir_all(&db_dir).await;

    Ok(())
}
