use std::time::Duration;

use futures_lite::StreamExt;
use macro_rules_attribute::apply;
use reflow::{Cancellation, CompletionExt, Envelope, EnvelopeStream, Spawner};
use smol::Timer;
use smol_macros::main;

async fn countdown(from: u64) -> u64 {
    Timer::after(Duration::from_millis(from * 100)).await;
    from
}

#[apply(main!)]
async fn main() {
    for completion in [3, 1, 2].map(countdown).order_by_completion() {
        println!("countdown {} done", completion.await);
    }

    let mut stream = EnvelopeStream::new(Envelope::cancellable(|emitter, token: Cancellation| async move {
        for word in ["polled", "on", "smol"] {
            token.check()?;
            Timer::after(Duration::from_millis(50)).await;
            emitter.emit(word);
        }
        Ok::<_, reflow::Cancelled>(())
    }));
    stream.spawn_with(Spawner::new(|future| smol::spawn(future).detach()));

    while let Some(word) = stream.next().await {
        println!("{}", word.expect("envelope failed"));
    }
}
