//! Fan-in example: three producers merged into one stream
//!
//! Run with: cargo run --example fan_in

use std::time::Duration;
use taskweld::prelude::*;

fn producer(id: u32) -> Receiver<String> {
    let (tx, rx) = channel(0);
    tokio::spawn(async move {
        for i in 1..=3 {
            let message = format!("Producer {} - Message {}", id, i);
            if tx.send(message).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100 * id as u64)).await;
        }
    });
    rx
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Fan-In ===");

    let token = CancelToken::new();
    let inputs = (1..=3).map(producer);
    let (merged, handle) = fan_in(inputs, &FanConfig::default(), &token).into_parts();

    let mut received = 0;
    while let Some(message) = merged.recv().await {
        println!("{}", message);
        received += 1;
    }
    handle.wait().await?;

    println!("Received {} messages", received);
    Ok(())
}
