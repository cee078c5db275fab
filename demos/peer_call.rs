use chanrpc::{
    BincodeCodec, ChannelHandler, PairConfig, PairTransport, Peer, RemoteError, RpcError,
    ServerChannel, ServerConfig,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QuoteRequest {
    symbol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Quote {
    symbol: String,
    price_cents: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (left, right) = PairTransport::create_pair("demo", PairConfig::default());

    let accept = tokio::spawn(async move {
        Peer::<String, _>::accept(right, BincodeCodec, ServerConfig::default())
            .await
            .unwrap()
    });
    let trader = Peer::connect(
        left,
        "trader-desk".to_string(),
        BincodeCodec,
        ServerConfig::default(),
    )
    .await?;
    let (exchange, who) = accept.await?;
    println!("[exchange] connection from '{}'", who);

    exchange.register_channel(
        "quotes",
        Arc::new(
            ChannelHandler::new()
                .method("quote", |ctx: String, req: QuoteRequest| async move {
                    println!("[exchange] quote({}) for {}", req.symbol, ctx);
                    match req.symbol.as_str() {
                        "ACME" => Ok(Quote {
                            symbol: req.symbol,
                            price_cents: 10_250,
                        }),
                        other => Err(RpcError::Remote(RemoteError::new(
                            format!("no listing for '{}'", other),
                            "UnknownSymbol",
                        ))),
                    }
                }),
        ) as Arc<dyn ServerChannel<String>>,
    );

    let quotes = trader.get_channel("quotes");

    let quote: Quote = quotes
        .call(
            "quote",
            &QuoteRequest {
                symbol: "ACME".to_string(),
            },
        )
        .await?;
    println!("[trader] {} = {} cents", quote.symbol, quote.price_cents);

    match quotes
        .call::<QuoteRequest, Quote>(
            "quote",
            &QuoteRequest {
                symbol: "NOPE".to_string(),
            },
        )
        .await
    {
        Err(RpcError::Remote(err)) => println!("[trader] rejected: {}", err),
        other => println!("[trader] unexpected outcome: {:?}", other),
    }

    trader.dispose().await;
    Ok(())
}
