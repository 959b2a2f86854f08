//! Stream checks: ordering, the write-then-close race and reader lifetimes.

use crate::WorldFactory;
use bytes::Bytes;
use kura_core::{EntityKind, RunId, WorldError};
use std::sync::Arc;
use std::time::Duration;

const READ_LIMIT: Duration = Duration::from_secs(10);

/// The canonical write, close, read.
pub async fn concrete_scenario(factory: &dyn WorldFactory) {
    let streamer = factory.create_streamer().await;
    let owner = RunId::new("r1");
    streamer
        .write_to_stream("s1", &owner, Bytes::from("Hello, World!"))
        .await
        .unwrap();
    streamer.close_stream("s1", &owner).await.unwrap();

    let data = streamer
        .read_from_stream("s1")
        .await
        .unwrap()
        .read_to_end_timeout(READ_LIMIT)
        .await
        .unwrap();
    assert_eq!(data, Bytes::from_static("Hello, World!".as_bytes()));
}

/// Chunks come back in write order, to every reader, from position 0.
pub async fn order_is_preserved(factory: &dyn WorldFactory) {
    let streamer = factory.create_streamer().await;
    let owner = RunId::new("wrun_order");
    for line in ["first\n", "second\n", "third\n"] {
        streamer
            .write_to_stream("lines", &owner, Bytes::from(line))
            .await
            .unwrap();
    }
    streamer.close_stream("lines", &owner).await.unwrap();

    let data = streamer
        .read_from_stream("lines")
        .await
        .unwrap()
        .read_to_end_timeout(READ_LIMIT)
        .await
        .unwrap();
    assert_eq!(data, Bytes::from_static(b"first\nsecond\nthird\n"));

    for chunk_count in [1usize, 100] {
        let name = format!("numbers_{chunk_count}");
        for index in 0..chunk_count {
            streamer
                .write_to_stream(&name, &owner, Bytes::from(index.to_string()))
                .await
                .unwrap();
        }
        streamer.close_stream(&name, &owner).await.unwrap();

        for _reader in 0..2 {
            let chunks = streamer
                .read_from_stream(&name)
                .await
                .unwrap()
                .collect_chunks()
                .await
                .unwrap();
            let expected: Vec<Bytes> = (0..chunk_count)
                .map(|index| Bytes::from(index.to_string()))
                .collect();
            assert_eq!(chunks, expected);
        }
    }
}

/// A write immediately followed by close is never lost, for early and late readers.
pub async fn write_then_close_never_drops(factory: &dyn WorldFactory) {
    let streamer = factory.create_streamer().await;
    let owner = RunId::new("wrun_race");

    for round in 0..50 {
        let name = format!("race_{round}");
        let payload = Bytes::from(format!("payload {round}\0end"));
        let early = streamer.read_from_stream(&name).await.unwrap();

        let writer = {
            let streamer = Arc::clone(&streamer);
            let (name, owner, payload) = (name.clone(), owner.clone(), payload.clone());
            tokio::spawn(async move {
                streamer.write_to_stream(&name, &owner, payload).await?;
                streamer.close_stream(&name, &owner).await
            })
        };
        let early = tokio::spawn(early.read_to_end_timeout(READ_LIMIT));

        writer.await.unwrap().unwrap();
        let late = streamer
            .read_from_stream(&name)
            .await
            .unwrap()
            .read_to_end_timeout(READ_LIMIT)
            .await
            .unwrap();
        assert_eq!(late, payload, "late reader lost data in round {round}");
        assert_eq!(
            early.await.unwrap().unwrap(),
            payload,
            "early reader lost data in round {round}"
        );
    }
}

/// Streams of one run never see each other's data.
pub async fn named_streams_are_isolated(factory: &dyn WorldFactory) {
    let streamer = factory.create_streamer().await;
    let owner = RunId::new("wrun_isolated");
    let other = RunId::new("wrun_other");

    let stdout = streamer.read_from_stream("iso/stdout").await.unwrap();
    streamer
        .write_to_stream("iso/stdout", &owner, Bytes::from_static(b"out"))
        .await
        .unwrap();
    streamer
        .write_to_stream("iso/stderr", &owner, Bytes::from_static(b"err"))
        .await
        .unwrap();
    streamer
        .write_to_stream("iso/other", &other, Bytes::from_static(b"foreign"))
        .await
        .unwrap();
    for name in ["iso/stdout", "iso/stderr", "iso/other"] {
        let owner = if name == "iso/other" { &other } else { &owner };
        streamer.close_stream(name, owner).await.unwrap();
    }

    assert_eq!(
        stdout.read_to_end_timeout(READ_LIMIT).await.unwrap(),
        Bytes::from_static(b"out")
    );
    let stderr = streamer
        .read_from_stream("iso/stderr")
        .await
        .unwrap()
        .read_to_end_timeout(READ_LIMIT)
        .await
        .unwrap();
    assert_eq!(stderr, Bytes::from_static(b"err"));

    assert_eq!(
        streamer.list_streams(&owner).await.unwrap(),
        vec!["iso/stderr".to_string(), "iso/stdout".to_string()]
    );
    assert_eq!(
        streamer.list_streams(&other).await.unwrap(),
        vec!["iso/other".to_string()]
    );
}

/// A stream belongs to whoever opened it, not to later writers or closers.
pub async fn stream_owner_is_first_writer(factory: &dyn WorldFactory) {
    let streamer = factory.create_streamer().await;
    let writer = RunId::new("wrun_a");
    let closer = RunId::new("wrun_b");

    streamer
        .write_to_stream("shared", &writer, Bytes::from_static(b"one"))
        .await
        .unwrap();
    streamer
        .write_to_stream("shared", &closer, Bytes::from_static(b"two"))
        .await
        .unwrap();
    streamer.close_stream("shared", &closer).await.unwrap();
    streamer.close_stream("closed_first", &closer).await.unwrap();

    assert_eq!(
        streamer.list_streams(&writer).await.unwrap(),
        vec!["shared".to_string()]
    );
    assert_eq!(
        streamer.list_streams(&closer).await.unwrap(),
        vec!["closed_first".to_string()]
    );
}

/// Writing to a closed stream fails and leaves its contents intact.
pub async fn write_after_close_fails(factory: &dyn WorldFactory) {
    let streamer = factory.create_streamer().await;
    let owner = RunId::new("wrun_closed");
    streamer
        .write_to_stream("closed", &owner, Bytes::from_static(b"kept"))
        .await
        .unwrap();
    streamer.close_stream("closed", &owner).await.unwrap();

    let result = streamer
        .write_to_stream("closed", &owner, Bytes::from_static(b"dropped"))
        .await;
    assert!(matches!(result, Err(WorldError::StreamClosed { ref name }) if name == "closed"));

    let data = streamer
        .read_from_stream("closed")
        .await
        .unwrap()
        .read_to_end_timeout(READ_LIMIT)
        .await
        .unwrap();
    assert_eq!(data, Bytes::from_static(b"kept"));
}

/// Closing twice is a no-op, and closing an unopened stream closes it empty.
pub async fn double_close_is_noop(factory: &dyn WorldFactory) {
    let streamer = factory.create_streamer().await;
    let owner = RunId::new("wrun_double");
    streamer
        .write_to_stream("twice", &owner, Bytes::from_static(b"x"))
        .await
        .unwrap();
    streamer.close_stream("twice", &owner).await.unwrap();
    streamer.close_stream("twice", &owner).await.unwrap();
    let chunks = streamer
        .read_from_stream("twice")
        .await
        .unwrap()
        .collect_chunks()
        .await
        .unwrap();
    assert_eq!(chunks, vec![Bytes::from_static(b"x")]);

    streamer.close_stream("never_written", &owner).await.unwrap();
    let data = streamer
        .read_from_stream("never_written")
        .await
        .unwrap()
        .read_to_end_timeout(READ_LIMIT)
        .await
        .unwrap();
    assert!(data.is_empty());
}

/// A reader waits on an open stream and ends once it is closed.
pub async fn blocked_reader_terminates_on_close(factory: &dyn WorldFactory) {
    let streamer = factory.create_streamer().await;
    let owner = RunId::new("wrun_block");
    streamer
        .write_to_stream("live", &owner, Bytes::from_static(b"one"))
        .await
        .unwrap();

    let mut reader = streamer.read_from_stream("live").await.unwrap();
    assert_eq!(
        reader.next_chunk_timeout(READ_LIMIT).await.unwrap(),
        Some(Bytes::from_static(b"one"))
    );
    assert!(matches!(
        reader.next_chunk_timeout(Duration::from_millis(50)).await,
        Err(WorldError::Timeout {
            entity: EntityKind::Stream,
            ..
        })
    ));

    let writer = {
        let streamer = Arc::clone(&streamer);
        let owner = owner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            streamer
                .write_to_stream("live", &owner, Bytes::from_static(b"two"))
                .await?;
            streamer.close_stream("live", &owner).await
        })
    };
    assert_eq!(
        reader.next_chunk_timeout(READ_LIMIT).await.unwrap(),
        Some(Bytes::from_static(b"two"))
    );
    assert_eq!(reader.next_chunk_timeout(READ_LIMIT).await.unwrap(), None);
    writer.await.unwrap().unwrap();
}

/// A timed-out or dropped reader releases its subscription.
pub async fn read_timeout_releases_subscriber(factory: &dyn WorldFactory) {
    let streamer = factory.create_streamer().await;
    assert_eq!(streamer.subscriber_count("idle"), 0);

    let reader = streamer.read_from_stream("idle").await.unwrap();
    let second = streamer.read_from_stream("idle").await.unwrap();
    assert_eq!(streamer.subscriber_count("idle"), 2);

    let result = reader.read_to_end_timeout(Duration::from_millis(50)).await;
    assert!(matches!(result, Err(WorldError::Timeout { .. })));
    assert_eq!(streamer.subscriber_count("idle"), 1);

    drop(second);
    assert_eq!(streamer.subscriber_count("idle"), 0);
}
