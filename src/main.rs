mod config;

use chatcierge::{
    AppState, build_metrics_layer_and_handle, build_metrics_router, build_router,
    catalog::{Catalog, WatchedFile},
    client::create_hyper_client,
    feed::{RecommendationFeed, RecommendationsClient},
    openai::OpenAiClient,
    supabase::SupabaseStore,
    traits::HotelStore,
};
use clap::Parser as _;
use config::{AskArgs, Command, Config, ServeArgs};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[tokio::main]
#[instrument]
pub async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse().validate()?;
    match config.command {
        Command::Serve(args) => serve(args).await,
        Command::Ask(args) => ask(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    info!("Starting ChatCierge with config: {:?}", args);

    let http = create_hyper_client(
        args.pool_max_idle_per_host,
        Duration::from_secs(args.pool_idle_timeout_secs),
    );

    let openai = Arc::new(OpenAiClient::new(
        http.clone(),
        args.openai_base_url.clone(),
        args.openai_key.clone(),
        args.openai_organization.clone(),
        args.completion_settings(),
    ));

    let store: Arc<dyn HotelStore> = match (&args.catalog, &args.supabase_url, &args.supabase_key)
    {
        (Some(path), _, _) => {
            let catalog = Catalog::from_file(path)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to load catalog: {}", e))?;
            if args.watch {
                catalog.receive_updates(WatchedFile(path.clone())).await?;
            }
            Arc::new(catalog)
        }
        (None, Some(url), Some(key)) => {
            info!("Using Supabase at {}", url);
            Arc::new(SupabaseStore::new(http.clone(), url.clone(), key.clone()))
        }
        _ => anyhow::bail!("No hotel store configured"),
    };

    let shutdown = CancellationToken::new();
    let app_state = AppState::builder()
        .embeddings(openai.clone())
        .completions(openai)
        .store(store)
        .stream(args.stream_settings())
        .search(args.search_settings())
        .shutdown(shutdown.clone())
        .build();
    let mut router = build_router(app_state);

    if args.metrics {
        let (prometheus_layer, handle) = build_metrics_layer_and_handle(args.metrics_prefix);
        router = router.layer(prometheus_layer);

        let metrics_router = build_metrics_router(handle);
        let bind_addr = format!("0.0.0.0:{}", args.metrics_port);
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("Metrics endpoint enabled on {}", bind_addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, metrics_router).await {
                error!("Metrics server stopped: {}", e);
            }
        });
    }

    let bind_addr = format!("0.0.0.0:{}", args.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("ChatCierge listening on {}", bind_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down, closing open recommendation streams");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}

async fn ask(args: AskArgs) -> anyhow::Result<()> {
    let http = create_hyper_client(1, Duration::from_secs(90));
    let client = RecommendationsClient::new(http, args.server.clone(), args.framing);
    let feed = RecommendationFeed::new(client);

    let hotel_uuids = (!args.hotels.is_empty()).then(|| args.hotels.clone());
    let mut updates = feed.updates();
    let recommend = feed.recommend(&args.question, hotel_uuids);
    tokio::pin!(recommend);

    let result = loop {
        tokio::select! {
            result = &mut recommend => break result?,
            Some(snapshot) = updates.next() => {
                debug!(
                    generation = snapshot.generation,
                    state = ?snapshot.state,
                    received = snapshot.slots.as_slice().iter().map(String::len).sum::<usize>(),
                    "Recommendations updated"
                );
            }
        }
    };

    if result.hotels.len() < args.hotels.len() {
        warn!(
            "{} of the requested hotels are unknown",
            args.hotels.len() - result.hotels.len()
        );
    }
    if result.hotels.is_empty() {
        println!("No hotels match that question.");
        return Ok(());
    }

    let texts = result.recommendations.slots.as_slice();
    for (hotel, text) in result.hotels.iter().zip(texts) {
        println!("{} ({})\n  {}\n", hotel.name, hotel.city, text.trim());
    }
    Ok(())
}
