use std::time::Duration;

use futures::StreamExt;
use reflow::{Cancellation, Cancelled, Disposal, Envelope, EnvelopeStream};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // A producer that honors cancellation.
    let cancellation = Cancellation::new();
    let mut ticks = EnvelopeStream::new(Envelope::cancellable(|emitter, token: Cancellation| async move {
        for tick in 0..u32::MAX {
            token.run_until_cancelled(tokio::time::sleep(Duration::from_millis(20))).await?;
            emitter.emit(tick);
        }
        Ok::<_, Cancelled>(())
    }));
    ticks.with_cancellation(cancellation.clone());

    while let Some(tick) = ticks.next().await {
        let tick = tick.expect("ticker failed");
        println!("tick {tick}");
        if tick == 4 {
            cancellation.cancel();
        }
    }
    println!("ticker disposed: {:?}", ticks.dispose().await);

    // A producer that cannot be stopped and is given up on after a while.
    let cancellation = Cancellation::new();
    let mut legacy = EnvelopeStream::new(Envelope::uncancellable(|emitter| async move {
        for line in ["header", "row 1", "row 2"] {
            emitter.emit(line);
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        std::thread::sleep(Duration::from_secs(2));
        Ok::<_, String>(())
    }));
    legacy
        .with_cancellation(cancellation.clone())
        .disposal_timeout(Duration::from_millis(100));

    while let Some(line) = legacy.next().await {
        println!("read {}", line.expect("export failed"));
        cancellation.cancel();
    }
    match legacy.dispose().await {
        Disposal::Completed => println!("export wound down"),
        Disposal::Abandoned => println!("export left running in the background"),
    }
}
