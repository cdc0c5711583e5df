//! Pipeline example: generate, square, format
//!
//! Run with: cargo run --example pipeline

use taskweld::prelude::*;

/// Squares every number it receives
struct Square;

#[async_trait::async_trait]
impl Transform for Square {
    type Input = i64;
    type Output = i64;

    async fn apply(&self, item: i64) -> Result<i64> {
        Ok(item * item)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Pipeline ===");

    let token = CancelToken::new();
    let config = StageConfig::default().buffer_size(0);

    let results = Pipeline::from_iter(1..=5, config, &token)
        .stage(Square)
        .map(|n: i64| format!("Square result: {}", n))
        .collect()
        .await?;

    for line in results {
        println!("{}", line);
    }
    Ok(())
}
