//! Cancellation example: a two second budget for three seconds of work
//!
//! Run with: cargo run --example cancellation

use std::time::Duration;
use taskweld::prelude::*;

async fn slow_operation(token: &CancelToken) -> Result<&'static str> {
    token
        .run_until_cancelled(async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            "operation completed"
        })
        .await
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Cancellation ===");

    let token = CancelToken::with_timeout(Duration::from_secs(2));
    match slow_operation(&token).await {
        Ok(message) => println!("{}", message),
        Err(e) if e.is_timeout() => println!("Operation timed out: {}", e),
        Err(e) => println!("Operation cancelled: {}", e),
    }

    // cancelling a parent stops every stage derived from it
    let root = CancelToken::new();
    let spawned = Pipeline::from_iter(1u64.., StageConfig::default().buffer_size(1), &root)
        .map(|n: u64| n * n)
        .build();
    let (squares, handle) = spawned.into_parts();
    let lifecycle = handle.lifecycle().clone();

    for _ in 0..3 {
        if let Some(square) = squares.recv().await {
            println!("Square: {}", square);
        }
    }
    root.cancel("consumer is done");

    match handle.wait().await {
        Err(e) if e.is_cancellation() => println!("Pipeline stopped: {}", e),
        other => other?,
    }
    println!("Pipeline state: {:?}", lifecycle.get());
    println!("Output closed: {}", squares.is_closed());
    Ok(())
}
