use chanrpc::{
    BincodeCodec, ChannelHandler, PairConfig, PairTransport, Peer, ServerChannel, ServerConfig,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (left, right) = PairTransport::create_pair("events", PairConfig::default());

    let accept = tokio::spawn(async move {
        Peer::<String, _>::accept(right, BincodeCodec, ServerConfig::default())
            .await
            .unwrap()
    });
    let watcher = Peer::connect(
        left,
        "dashboard".to_string(),
        BincodeCodec,
        ServerConfig::default(),
    )
    .await?;
    let (feed, _) = accept.await?;

    // A heartbeat event stream: one tick every 100ms, starting from the
    // subscriber-supplied offset.
    feed.register_channel(
        "heartbeat",
        Arc::new(ChannelHandler::new().event("tick", |_ctx: String, start: u64| {
            futures::stream::unfold(start, |n| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Some((n, n + 1))
            })
        })) as Arc<dyn ServerChannel<String>>,
    );

    let source = watcher
        .get_channel("heartbeat")
        .listen_with_arg::<u64, u64>("tick", &40)?;

    let mut sub = source.subscribe();
    for _ in 0..3 {
        if let Some(tick) = sub.recv().await {
            println!("[dashboard] tick {}", tick?);
        }
    }

    // Dropping the last subscription disposes the remote stream.
    drop(sub);
    println!("[dashboard] unsubscribed");

    watcher.dispose().await;
    Ok(())
}
