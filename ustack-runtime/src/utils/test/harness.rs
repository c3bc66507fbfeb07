use crate::interface::ChannelInterface;
use crossbeam::channel::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::runtime;

/// Tests are written "Given, When, Then" (https://martinfowler.com/bliki/GivenWhenThen.html):
/// build a stack over recording or channel interfaces, drive frames through it, then inspect what
/// the interfaces transmitted and what the protocol handlers saw. Work handed to the background
/// tasks completes asynchronously, so assertions on it go through `wait_until`.

/// A threaded runtime with time and IO drivers, like the one a stack runs in.
pub fn initialize_runtime() -> runtime::Runtime {
    runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Polls `condition` until it holds or `timeout` passes. Returns the final evaluation.
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return condition();
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    true
}

/// Plays the wire between two channel interfaces: every frame `from` transmits is received by
/// `to`. Runs on its own thread until `from` is dropped.
pub fn patch_cable(from: Receiver<Vec<u8>>, to: Arc<ChannelInterface>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for frame in from.iter() {
            if to.inject(frame).is_err() {
                break;
            }
        }
    })
}
