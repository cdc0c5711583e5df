//! Fan-in merging and fan-out splitting.

use std::sync::Arc;

use crate::config::FanConfig;
use crate::error::Result;
use crate::group::{Lifecycle, Spawned, TaskGroup};
use crate::stream::{channel, CloseOnDrop, Receiver};
use crate::token::CancelToken;

/// Merge every input into one output stream.
///
/// One forwarder runs per input. The forwarders share the output's close
/// guard, so the output closes once the last of them exits, whether its input
/// was exhausted or the token fired. Interleaving across inputs is
/// unspecified; within one input, order is preserved.
///
/// With no inputs the output is closed immediately.
pub fn fan_in<T, I>(inputs: I, config: &FanConfig, token: &CancelToken) -> Spawned<Receiver<T>>
where
    T: Send + 'static,
    I: IntoIterator<Item = Receiver<T>>,
{
    let mut group = TaskGroup::new("fan-in", token);
    let (tx, rx) = channel(config.buffer_size);
    let output = Arc::new(CloseOnDrop::new(tx));

    for (index, input) in inputs.into_iter().enumerate() {
        let forwarder = Forwarder {
            input,
            output: output.clone(),
            token: group.token().clone(),
            lifecycle: group.lifecycle().clone(),
        };
        group.spawn("forwarder", index, forwarder.run());
    }
    tracing::debug!(inputs = group.len(), "fan-in started");
    drop(output);

    Spawned {
        output: rx,
        handle: group,
    }
}

struct Forwarder<T> {
    input: Receiver<T>,
    output: Arc<CloseOnDrop<T>>,
    token: CancelToken,
    lifecycle: Lifecycle,
}

impl<T: Send + 'static> Forwarder<T> {
    async fn run(self) -> Result<()> {
        let mut forwarded = 0usize;
        while let Some(item) = self.input.recv_cancellable(&self.token).await? {
            self.output.send_cancellable(item, &self.token).await?;
            forwarded += 1;
        }
        self.lifecycle.draining();
        tracing::debug!(forwarded, "input exhausted");
        Ok(())
    }
}

/// Split one input across `consumers` output streams.
///
/// Each output is fed by its own splitter, and all splitters receive from the
/// shared input. A splitter claims an item only while its consumer is waiting
/// for one (or, with a buffered output, while that buffer has room), so the
/// next item goes to whichever consumer is ready first and an idle consumer
/// never holds one back. Every output closes once the input is exhausted or
/// the token fires. A consumer that drops its output only stops its own
/// splitter; the others keep draining the input.
///
/// With zero consumers nothing is spawned and the input is dropped.
pub fn fan_out<T>(
    input: Receiver<T>,
    consumers: usize,
    config: &FanConfig,
    token: &CancelToken,
) -> Spawned<Vec<Receiver<T>>>
where
    T: Send + 'static,
{
    let mut group = TaskGroup::new("fan-out", token);
    let mut outputs = Vec::with_capacity(consumers);

    for index in 0..consumers {
        let (tx, rx) = channel(config.buffer_size);
        let splitter = Splitter {
            input: input.clone(),
            output: CloseOnDrop::new(tx),
            token: group.token().clone(),
            lifecycle: group.lifecycle().clone(),
        };
        group.spawn("splitter", index, splitter.run());
        outputs.push(rx);
    }
    tracing::debug!(consumers, "fan-out started");

    Spawned {
        output: outputs,
        handle: group,
    }
}

struct Splitter<T> {
    input: Receiver<T>,
    output: CloseOnDrop<T>,
    token: CancelToken,
    lifecycle: Lifecycle,
}

enum Claim<T> {
    Item(T),
    // the consumer stopped waiting before an item arrived
    Withdrawn,
    Exhausted,
}

impl<T: Send + 'static> Splitter<T> {
    async fn run(self) -> Result<()> {
        let mut claimed = 0usize;
        loop {
            let ready = self
                .token
                .run_until_cancelled(async {
                    tokio::select! {
                        biased;
                        _ = self.input.drained() => None,
                        ready = self.output.ready() => Some(ready.is_ok()),
                    }
                })
                .await?;
            match ready {
                None => break,
                Some(false) => {
                    tracing::debug!(claimed, "consumer left, splitter stopping");
                    return Ok(());
                }
                Some(true) => {}
            }

            let claim = self
                .token
                .run_until_cancelled(async {
                    tokio::select! {
                        biased;
                        _ = self.output.until_unready() => Claim::Withdrawn,
                        item = self.input.recv() => match item {
                            Some(item) => Claim::Item(item),
                            None => Claim::Exhausted,
                        },
                    }
                })
                .await?;
            match claim {
                Claim::Item(item) => {
                    tracing::trace!(claimed, "claimed item");
                    self.output.send_cancellable(item, &self.token).await?;
                    claimed += 1;
                }
                Claim::Withdrawn => continue,
                Claim::Exhausted => break,
            }
        }
        self.lifecycle.draining();
        tracing::debug!(claimed, "input exhausted, closing output");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::collections::HashMap;

    fn producer(id: usize, count: usize) -> Receiver<String> {
        let (tx, rx) = channel(0);
        tokio::spawn(async move {
            for i in 1..=count {
                let message = format!("Producer {} - Message {}", id, i);
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    #[tokio::test]
    async fn fan_in_merges_every_message() {
        let token = CancelToken::new();
        let inputs: Vec<_> = (1..=3).map(|id| producer(id, 3)).collect();

        let (merged, handle) = fan_in(inputs, &FanConfig::default(), &token).into_parts();
        let mut messages = merged.collect_all().await;
        handle.wait().await.unwrap();

        assert_eq!(messages.len(), 9);
        messages.sort();
        for id in 1..=3 {
            for i in 1..=3 {
                let expected = format!("Producer {} - Message {}", id, i);
                assert!(messages.contains(&expected), "missing {}", expected);
            }
        }
    }

    #[tokio::test]
    async fn fan_in_keeps_per_input_order() {
        let token = CancelToken::new();
        let (a_tx, a_rx) = channel(8);
        let (b_tx, b_rx) = channel(8);
        for i in 0..5 {
            a_tx.send(("a", i)).await.unwrap();
            b_tx.send(("b", i)).await.unwrap();
        }
        drop(a_tx);
        drop(b_tx);

        let (merged, handle) = fan_in([a_rx, b_rx], &FanConfig::default(), &token).into_parts();
        let items = merged.collect_all().await;
        handle.wait().await.unwrap();

        let from_a: Vec<_> = items.iter().filter(|(s, _)| *s == "a").map(|(_, i)| *i).collect();
        let from_b: Vec<_> = items.iter().filter(|(s, _)| *s == "b").map(|(_, i)| *i).collect();
        assert_eq!(from_a, vec![0, 1, 2, 3, 4]);
        assert_eq!(from_b, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn fan_in_without_inputs_closes_immediately() {
        let token = CancelToken::new();
        let inputs: Vec<Receiver<u8>> = Vec::new();
        let (merged, handle) = fan_in(inputs, &FanConfig::default(), &token).into_parts();
        assert_eq!(merged.recv().await, None);
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn fan_in_cancellation_closes_output() {
        let token = CancelToken::new();
        let (_keep_open, idle) = channel::<u8>(1);
        let (merged, handle) = fan_in([idle], &FanConfig::default(), &token).into_parts();

        token.cancel("shutting down");
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, Error::Cancelled { ref reason } if reason == "shutting down"));
        assert_eq!(merged.recv().await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fan_out_delivers_each_item_once() {
        let token = CancelToken::new();
        let (tx, rx) = channel(4);
        let (outputs, handle) = fan_out(rx, 3, &FanConfig::default(), &token).into_parts();
        assert_eq!(outputs.len(), 3);

        let consumers: Vec<_> = outputs
            .into_iter()
            .enumerate()
            .map(|(consumer, output)| {
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    while let Some(job) = output.recv().await {
                        seen.push((consumer, job));
                    }
                    seen
                })
            })
            .collect();

        for job in 1..=10u32 {
            tx.send(job).await.unwrap();
        }
        tx.close().unwrap();

        let mut per_job: HashMap<u32, usize> = HashMap::new();
        let mut total = 0;
        for consumer in consumers {
            for (_, job) in consumer.await.unwrap() {
                *per_job.entry(job).or_default() += 1;
                total += 1;
            }
        }
        handle.wait().await.unwrap();

        assert_eq!(total, 10);
        assert_eq!(per_job.len(), 10);
        assert!(per_job.values().all(|&n| n == 1));
    }

    #[tokio::test]
    async fn fan_out_idle_consumer_holds_nothing_back() {
        let token = CancelToken::new();
        let (tx, rx) = channel(4);
        let (mut outputs, handle) = fan_out(rx, 2, &FanConfig::default(), &token).into_parts();
        let busy = outputs.pop().unwrap();
        // alive, but never asks for an item
        let idle = outputs.pop().unwrap();

        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        tx.close().unwrap();

        assert_eq!(busy.collect_all().await, vec![1, 2]);
        handle.wait().await.unwrap();
        assert_eq!(idle.recv().await, None);
    }

    #[tokio::test]
    async fn fan_out_survives_a_departed_consumer() {
        let token = CancelToken::new();
        let (tx, rx) = channel(8);
        for job in 1..=6 {
            tx.send(job).await.unwrap();
        }
        tx.close().unwrap();

        let (mut outputs, handle) = fan_out(rx, 2, &FanConfig::default(), &token).into_parts();
        let live = outputs.pop().unwrap();
        drop(outputs);

        assert_eq!(live.collect_all().await, vec![1, 2, 3, 4, 5, 6]);
        handle.wait().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fan_out_consumer_leaving_midway_loses_nothing() {
        let token = CancelToken::new();
        let (tx, rx) = channel(16);
        for job in 1..=12u32 {
            tx.send(job).await.unwrap();
        }
        tx.close().unwrap();

        let (mut outputs, handle) = fan_out(rx, 2, &FanConfig::default(), &token).into_parts();
        let live = outputs.pop().unwrap();
        let leaving = outputs.pop().unwrap();

        let early = tokio::spawn(async move {
            let mut taken = Vec::new();
            for _ in 0..2 {
                match leaving.recv().await {
                    Some(job) => taken.push(job),
                    None => break,
                }
            }
            taken
        });
        let mut all = live.collect_all().await;
        all.extend(early.await.unwrap());
        handle.wait().await.unwrap();

        all.sort();
        assert_eq!(all, (1..=12).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn fan_out_with_zero_consumers_spawns_nothing() {
        let token = CancelToken::new();
        let (_tx, rx) = channel::<u8>(1);
        let spawned = fan_out(rx, 0, &FanConfig::default(), &token);
        assert!(spawned.output.is_empty());
        assert!(spawned.handle.is_empty());
        spawned.handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn fan_out_cancellation_closes_every_output() {
        let token = CancelToken::new();
        let (_tx, rx) = channel::<u8>(1);
        let (outputs, handle) = fan_out(rx, 2, &FanConfig::default(), &token).into_parts();

        token.cancel("stop");
        assert!(handle.wait().await.unwrap_err().is_cancellation());
        for output in outputs {
            assert_eq!(output.recv().await, None);
        }
    }
}
