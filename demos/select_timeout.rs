//! Select example: two producers raced against a timeout
//!
//! Run with: cargo run --example select_timeout

use std::time::Duration;
use taskweld::prelude::*;

fn delayed(message: &'static str, delay: Duration) -> Receiver<&'static str> {
    let (tx, rx) = channel(1);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(message).await;
    });
    rx
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Select ===");

    let first = delayed("from the first producer", Duration::from_millis(200));
    let second = delayed("from the second producer", Duration::from_millis(100));
    let deadline = tokio::time::Instant::now() + Duration::from_millis(300);

    let mut open = vec![first, second];
    while !open.is_empty() {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match Select::new().recv_all(open.iter()).timeout(remaining).wait().await {
            Selected::Item { index, value } => {
                println!("Received {}", value);
                open.remove(index);
            }
            Selected::Closed { index } => {
                open.remove(index);
            }
            Selected::TimedOut => {
                println!("Timeout");
                break;
            }
            Selected::Cancelled(e) => return Err(e),
        }
    }
    Ok(())
}
