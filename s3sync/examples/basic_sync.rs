//! Basic sync example against the in-process store

use std::sync::Arc;

use anyhow::Result;

use s3sync::{
    resolve_endpoints, MemoryStore, ProgressChannel, ProgressEvent, SessionConfig, SyncEngine,
    SyncOptions, SyncSession,
};

fn engine(store: &MemoryStore, options: SyncOptions) -> Result<SyncEngine> {
    let config = SessionConfig {
        retry_delay_secs: 1,
        ..Default::default()
    };
    let session = SyncSession::new(Arc::new(store.clone()), config)?;
    Ok(SyncEngine::new(session, options))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    println!("Basic Sync Engine Example");
    println!("========================");

    let temp_dir = tempfile::TempDir::new()?;
    let source_dir = temp_dir.path().join("source");
    let restore_dir = temp_dir.path().join("restore");

    tokio::fs::create_dir_all(source_dir.join("subdir")).await?;
    tokio::fs::create_dir_all(&restore_dir).await?;
    tokio::fs::write(source_dir.join("file1.txt"), b"This is file 1 content").await?;
    tokio::fs::write(source_dir.join("file2.txt"), b"This is file 2 content").await?;
    tokio::fs::write(source_dir.join("subdir").join("file3.txt"), b"This is file 3 content").await?;

    let store = MemoryStore::with_bucket("backups");
    let (source, destination) = resolve_endpoints(&format!("{}/", source_dir.display()), "backups:example")?;

    // Example 1: Dry run
    println!("Example 1: Dry Run Mode");
    println!("-----------------------");

    let dry_run = SyncOptions {
        dry_run: true,
        ..Default::default()
    };
    let metrics = engine(&store, dry_run)?.sync(&source, &destination).await?;
    println!("Would create {} nodes", metrics.files.created);
    assert!(store.keys("backups").is_empty());
    println!();

    // Example 2: Upload with progress reporting
    println!("Example 2: Upload with Progress Reporting");
    println!("-----------------------------------------");

    let upload = engine(&store, SyncOptions::default())?;
    let (progress_reporter, mut progress_channel) = ProgressChannel::new(upload.session().id());

    let monitor = async {
        while let Some(event) = progress_channel.recv().await {
            match event {
                ProgressEvent::NodeAction { operation, name } => println!("  {} {}", operation, name),
                ProgressEvent::FileOperationCompleted { name, bytes, .. } => {
                    println!("  done {} ({} bytes)", name, bytes)
                }
                ProgressEvent::SyncCompleted { duration, .. } => {
                    println!("Sync completed in {:.2}s", duration.as_secs_f64());
                    break;
                }
                ProgressEvent::SyncFailed { error, .. } => {
                    println!("Sync failed: {}", error);
                    break;
                }
                _ => {}
            }
        }
    };
    let (metrics, ()) = tokio::join!(
        upload.sync_with_progress(&source, &destination, Some(progress_reporter)),
        monitor
    );
    let metrics = metrics?;
    println!("{}", metrics.summary());
    for key in store.keys("backups") {
        println!("  stored {}", key);
    }
    println!();

    // Example 3: Nothing left to do
    println!("Example 3: Second Run");
    println!("---------------------");

    let metrics = engine(&store, SyncOptions::default())?.sync(&source, &destination).await?;
    println!("{} unchanged", metrics.files.unchanged);
    println!();

    // Example 4: Restore into an empty directory, skipping one file
    println!("Example 4: Filtered Download");
    println!("----------------------------");

    let (remote, local) = resolve_endpoints("backups:example/", &format!("{}/", restore_dir.display()))?;
    let restore = SyncOptions {
        exclude: Some(r"^file2\.txt$".to_string()),
        ..Default::default()
    };
    let metrics = engine(&store, restore)?.sync(&remote, &local).await?;
    println!("Restored {} nodes ({} bytes)", metrics.files.created, metrics.transfer.bytes_downloaded);
    assert!(restore_dir.join("subdir").join("file3.txt").exists());
    assert!(!restore_dir.join("file2.txt").exists());

    println!();
    println!("All examples completed successfully!");

    Ok(())
}
