//! Fan-out example: ten jobs shared by two consumers
//!
//! Run with: cargo run --example fan_out

use std::time::Duration;
use taskweld::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Fan-Out ===");

    let token = CancelToken::new();
    let jobs = emit(1..=10, &StageConfig::default().buffer_size(0), &token);
    let (outputs, splitter) = fan_out(jobs.output, 2, &FanConfig::default(), &token).into_parts();

    let consumers: Vec<_> = outputs
        .into_iter()
        .enumerate()
        .map(|(index, jobs)| {
            tokio::spawn(async move {
                while let Some(job) = jobs.recv().await {
                    println!("Consumer {} processed job {}", index + 1, job);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
        })
        .collect();

    for consumer in consumers {
        consumer.await.map_err(Error::from)?;
    }
    splitter.wait().await?;
    jobs.handle.wait().await?;

    println!("All jobs processed");
    Ok(())
}
