use std::time::{Duration, Instant};

use futures::StreamExt;
use reflow::{Cancellation, Cancelled, CompletionExt, order_by_completion};

async fn identifiable_delay(id: u64, scaling: u64) -> u64 {
    tokio::time::sleep(Duration::from_millis(scaling * (id + 1))).await;
    id
}

async fn delayed_failure(delay_ms: u64) -> Result<u64, String> {
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    Err("Foo!".to_string())
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_batch_yields_no_completions() {
    let sources: Vec<std::future::Ready<u64>> = Vec::new();
    assert!(sources.order_by_completion().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn single_source_is_returned_as_is() {
    let ordered = order_by_completion([identifiable_delay(3, 1)]);
    assert_eq!(ordered.len(), 1);
    assert!(ordered[0].is_passthrough(), "A single source needs no slots");

    let mut ids = Vec::new();
    for completion in ordered {
        ids.push(completion.await);
    }
    assert_eq!(ids, [3]);
}

#[tokio::test(flavor = "multi_thread")]
async fn reversed_delays_come_back_in_completion_order() {
    let count = 9;
    let sources: Vec<_> = (0..count).rev().map(|id| identifiable_delay(id, 16)).collect();

    let mut ids = Vec::with_capacity(count as usize);
    for completion in sources.order_by_completion() {
        ids.push(completion.await);
    }
    assert_eq!(ids, (0..count).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread")]
async fn shuffled_ids_resolve_in_ascending_order() {
    let sources = [4, 0, 3, 1, 2].map(|id| identifiable_delay(id, 24));

    let mut ids = Vec::new();
    for completion in order_by_completion(sources) {
        ids.push(completion.await);
    }
    assert_eq!(ids, [0, 1, 2, 3, 4]);
}

#[tokio::test(flavor = "multi_thread")]
async fn already_ordered_sources_keep_their_order() {
    let sources: Vec<_> = (0..6).map(|id| identifiable_delay(id, 16)).collect();

    let mut ids = Vec::new();
    for completion in order_by_completion(sources) {
        ids.push(completion.await);
    }
    assert_eq!(ids, [0, 1, 2, 3, 4, 5], "Sorted input should be left as is");
}

#[tokio::test(flavor = "multi_thread")]
async fn completions_never_resolve_before_their_predecessor() {
    let sources: Vec<_> = [5, 2, 7, 0, 3]
        .into_iter()
        .map(|id| async move {
            let id = identifiable_delay(id, 10).await;
            (id, Instant::now())
        })
        .collect();

    let mut finished = Vec::new();
    for completion in order_by_completion(sources) {
        finished.push(completion.await);
    }
    assert_eq!(finished.len(), 5);
    assert!(
        finished.windows(2).all(|pair| pair[0].1 <= pair[1].1),
        "Each rank should finish no later than the next one"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_surfaces_at_its_completion_rank() {
    const COUNT: usize = 11;
    const FAULTY: usize = COUNT / 2 + 1;

    let mut sources: Vec<futures::future::BoxFuture<'static, Result<u64, String>>> = Vec::new();
    for index in 0..FAULTY {
        sources.push(Box::pin(async move {
            Ok::<_, String>(identifiable_delay(30 + index as u64, 1).await)
        }));
    }
    sources.push(Box::pin(delayed_failure(80)));
    for index in FAULTY + 1..COUNT {
        sources.push(Box::pin(async move {
            Ok::<_, String>(identifiable_delay(150 + index as u64, 1).await)
        }));
    }
    sources.reverse();

    let mut news = Vec::with_capacity(COUNT);
    for completion in sources.order_by_completion() {
        news.push(match completion.await {
            Ok(_) => "no throw",
            Err(_) => "throw",
        });
    }

    let mut expected = vec!["no throw"; COUNT];
    expected[FAULTY] = "throw";
    assert_eq!(news, expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_surfaces_at_its_completion_rank() {
    const COUNT: usize = 11;
    const CANCELLING: usize = COUNT / 2 + 1;

    let mut handles = Vec::with_capacity(COUNT);
    for index in 0..CANCELLING {
        handles.push(tokio::spawn(identifiable_delay(20 + index as u64, 1)));
    }
    let doomed = tokio::spawn(identifiable_delay(400, 1));
    let abort = doomed.abort_handle();
    handles.push(doomed);
    for index in CANCELLING + 1..COUNT {
        handles.push(tokio::spawn(identifiable_delay(150 + index as u64, 1)));
    }
    handles.reverse();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        abort.abort();
    });

    let mut news = Vec::with_capacity(COUNT);
    for completion in handles.order_by_completion() {
        news.push(match completion.await {
            Ok(_) => "completed",
            Err(e) if e.is_cancelled() => "cancelled",
            Err(_) => "failed",
        });
    }

    let mut expected = vec!["completed"; COUNT];
    expected[CANCELLING] = "cancelled";
    assert_eq!(news, expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_completions_do_not_stall_the_rest() {
    let sources: Vec<_> = (0..5).map(|id| identifiable_delay(id, 10)).collect();
    let mut ordered = order_by_completion(sources);

    let last = ordered.pop().unwrap();
    let first = ordered.remove(0);
    drop(ordered);

    assert_eq!(first.await, 0);
    assert_eq!(last.await, 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn completions_can_be_awaited_from_separate_tasks() {
    let sources: Vec<_> = [6, 1, 4, 0, 5, 2, 3].map(|id| identifiable_delay(id, 12)).into();
    let waiting: Vec<_> = order_by_completion(sources)
        .into_iter()
        .map(|completion| {
            let rank = completion.rank().unwrap();
            tokio::spawn(async move { (rank, completion.await) })
        })
        .collect();

    let mut ranked = Vec::new();
    for handle in waiting {
        ranked.push(handle.await.unwrap());
    }
    ranked.sort();
    let ids: Vec<_> = ranked.into_iter().map(|(_, id)| id).collect();
    assert_eq!(ids, [0, 1, 2, 3, 4, 5, 6]);
}

#[tokio::test(flavor = "multi_thread")]
async fn completion_stream_yields_in_completion_order() {
    let sources: Vec<_> = [3, 8, 1, 0, 5].map(|id| identifiable_delay(id, 20)).into();

    let ids: Vec<_> = sources
        .in_completion_order(Cancellation::new())
        .map(Result::unwrap)
        .collect()
        .await;
    assert_eq!(ids, [0, 1, 3, 5, 8]);
}

#[tokio::test(flavor = "multi_thread")]
async fn completion_stream_stops_on_cancellation() {
    let cancellation = Cancellation::new();
    let sources: Vec<_> = (0..6).map(|id| identifiable_delay(id, 40)).collect();
    let mut stream = sources.in_completion_order(cancellation.clone());

    assert_eq!(stream.next().await, Some(Ok(0)));
    assert_eq!(stream.next().await, Some(Ok(1)));
    cancellation.cancel();
    assert_eq!(stream.next().await, Some(Err(Cancelled)));
    assert_eq!(stream.next().await, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn completion_stream_wakes_up_for_cancellation() {
    let cancellation = Cancellation::new();
    let remote = cancellation.clone();
    let sources = [identifiable_delay(1000, 10), identifiable_delay(2000, 10)];
    let mut stream = sources.in_completion_order(cancellation);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        remote.cancel();
    });

    let start = Instant::now();
    assert_eq!(stream.next().await, Some(Err(Cancelled)));
    assert!(start.elapsed() < Duration::from_secs(5), "Should not wait for the sources");
}
