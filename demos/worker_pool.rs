//! Worker pool example: three workers doubling nine jobs
//!
//! Run with: cargo run --example worker_pool

use std::time::Duration;
use taskweld::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Worker Pool ===");

    let token = CancelToken::new();
    let (mut submitter, pool) = WorkerPool::new(transform_fn(|job: u64| async move {
        // simulate some work
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok::<_, Error>(job * 2)
    }))
    .workers(3)
    .buffer_size(9)
    .spawn(&token);

    for job in 1..=9 {
        let id = submitter.submit(job).await?;
        println!("Submitted job {} as task {}", job, id);
    }
    submitter.finish()?;

    let (results, handle) = pool.into_parts();
    while let Some(result) = results.recv().await {
        println!(
            "Worker {} finished task {} with result {}",
            result.worker + 1,
            result.id,
            result.output
        );
    }
    handle.wait().await?;

    println!("All jobs processed");
    Ok(())
}
