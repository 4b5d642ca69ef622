use tally::{Backend, Builder};
use tempfile::tempdir;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // NOTE: Using a temporary directory for demonstration.
    let db_dir = tempdir()?.keep();

    let counter = Builder::new().backend(Backend::Log).data_dir(&db_dir).build().await?;
    counter.provision(0).await?;

    let record = counter.increment().await?;
    println!("{} = {} (version {})", counter.key(), record.value, record.version);

    let record = counter.increment().await?;
    println!("{} = {} (version {})", counter.key(), record.value, record.version);

    let record = counter.decrement().await?;
    println!("{} = {} (version {})", counter.key(), record.value, record.version);

    println!("\nRestarting counter...");
    // Drop the service to simulate restart
    drop(counter);

    let counter = Builder::new().backend(Backend::Log).data_dir(&db_dir).build().await?;
    let record = counter.increment().await?;
    println!("{} = {} (version {})", counter.key(), record.value, record.version);

    // Cleanup
    drop(counter);
    let _ = tokio::fs::remove_dir_all(&db_dir).await;

    Ok(())
}
