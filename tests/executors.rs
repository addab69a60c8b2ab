use std::{sync::Arc, time::Duration};

use futures_lite::StreamExt;
use macro_rules_attribute::apply;
use reflow::{Cancellation, ContextFlow, CompletionExt, Envelope, EnvelopeStream, Spawner, context};
use smol::Timer;
use smol_macros::test;

async fn identifiable_timer(id: u64) -> u64 {
    Timer::after(Duration::from_millis(15 * (id + 1))).await;
    id
}

#[apply(test!)]
async fn completion_order_on_smol() {
    let sources = [2, 0, 3, 1].map(identifiable_timer);

    let mut ids = Vec::new();
    for completion in sources.order_by_completion() {
        ids.push(completion.await);
    }
    assert_eq!(ids, [0, 1, 2, 3]);
}

#[apply(test!)]
async fn envelope_on_smol_executor() {
    let mut stream = EnvelopeStream::new(Envelope::cancellable(|emitter, token: Cancellation| async move {
        for value in ["first", "second", "third"] {
            token.run_until_cancelled(Timer::after(Duration::from_millis(3))).await?;
            emitter.emit(value);
        }
        Ok::<_, reflow::Cancelled>(())
    }));
    stream.spawn_with(Spawner::new(|future| smol::spawn(future).detach()));

    let mut items = Vec::new();
    while let Some(item) = stream.next().await {
        items.push(item.unwrap());
    }
    assert_eq!(items, ["first", "second", "third"]);
}

#[apply(test!)]
async fn context_flow_on_smol() {
    context::set_current(None);
    let flow = ContextFlow::snapshot();
    context::set_current(Some(Arc::new(context::ThreadPoolContext::default())));
    Timer::after(Duration::from_millis(5)).await;

    flow.await;
    assert!(context::current().is_none());
}
