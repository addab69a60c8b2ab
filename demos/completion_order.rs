use std::time::Duration;

use futures::StreamExt;
use reflow::{Cancellation, CompletionExt};

async fn download(name: &'static str, millis: u64) -> Result<&'static str, String> {
    tokio::time::sleep(Duration::from_millis(millis)).await;
    if name == "broken.bin" {
        return Err(format!("{name}: connection reset"));
    }
    Ok(name)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let downloads = [
        download("large.iso", 600),
        download("small.txt", 50),
        download("broken.bin", 250),
        download("medium.zip", 300),
    ];

    // Whichever download finishes first is handled first.
    for completion in downloads.order_by_completion() {
        let rank = completion.rank();
        match completion.await {
            Ok(name) => println!("{rank:?}: finished {name}"),
            Err(e) => println!("{rank:?}: failed with {e}"),
        }
    }

    let cancellation = Cancellation::new();
    let remote = cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        remote.cancel();
    });

    let slow = [download("a", 100), download("b", 400), download("c", 150)];
    let mut stream = slow.in_completion_order(cancellation);
    while let Some(next) = stream.next().await {
        match next {
            Ok(result) => println!("streamed {result:?}"),
            Err(cancelled) => println!("stream stopped: {cancelled}"),
        }
    }
}
